use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::metrics;

/// Well-known service ports never handed to dev servers.
pub const RESERVED_PORTS: &[u16] = &[
    3000, 3001, 3306, 4000, 5000, 5173, 5432, 6379, 8000, 8080, 8443, 9000, 27017,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortReservation {
    pub port: u16,
    pub project_id: String,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupancy {
    Free,
    Occupied,
}

/// Leases dev-server ports to projects, checking the OS before each lease.
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    connect_host: IpAddr,
    connect_timeout: Duration,
    reservations: Mutex<HashMap<u16, PortReservation>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, connect_timeout: Duration) -> Self {
        Self {
            range,
            connect_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u16, PortReservation>> {
        self.reservations.lock()
    }

    /// Reserve a free port for `project_id`, or return the one it already holds.
    pub async fn allocate(&self, project_id: &str) -> Result<u16, BrokerError> {
        if let Some(port) = self.reserved_for(project_id) {
            return Ok(port);
        }
        for candidate in self.range.clone() {
            if RESERVED_PORTS.contains(&candidate) {
                continue;
            }
            {
                let mut table = self.table();
                if table.contains_key(&candidate) {
                    continue;
                }
                // Held tentatively so a concurrent allocation skips it while we check it.
                table.insert(candidate, self.reservation(candidate, project_id));
            }
            match self.occupancy(candidate).await {
                Occupancy::Free => {
                    debug!(project_id = %project_id, port = candidate, "port reserved");
                    self.refresh_gauge();
                    return Ok(candidate);
                }
                Occupancy::Occupied => {
                    self.table().remove(&candidate);
                    debug!(port = candidate, "candidate port busy");
                }
            }
        }
        warn!(project_id = %project_id, "port range exhausted");
        Err(BrokerError::NoPortsAvailable {
            start: *self.range.start(),
            end: *self.range.end(),
        })
    }

    /// Move the project's lease to the port its server actually bound. Returns
    /// `false` if another project holds that port.
    pub fn confirm(&self, project_id: &str, port: u16) -> bool {
        let mut table = self.table();
        if let Some(holder) = table.get(&port) {
            if holder.project_id != project_id {
                warn!(
                    project_id = %project_id,
                    port,
                    holder = %holder.project_id,
                    "detected port already leased to another project"
                );
                return false;
            }
            return true;
        }
        table.retain(|_, r| r.project_id != project_id);
        table.insert(port, self.reservation(port, project_id));
        drop(table);
        self.refresh_gauge();
        true
    }

    pub fn release(&self, port: u16) {
        if let Some(reservation) = self.table().remove(&port) {
            info!(project_id = %reservation.project_id, port, "port released");
        }
        self.refresh_gauge();
    }

    pub fn release_project(&self, project_id: &str) -> Option<u16> {
        let port = self.reserved_for(project_id)?;
        self.release(port);
        Some(port)
    }

    pub fn reserved_for(&self, project_id: &str) -> Option<u16> {
        self.table()
            .values()
            .find(|r| r.project_id == project_id)
            .map(|r| r.port)
    }

    pub fn reservations(&self) -> Vec<PortReservation> {
        let mut all: Vec<_> = self.table().values().cloned().collect();
        all.sort_by_key(|r| r.port);
        all
    }

    fn reservation(&self, port: u16, project_id: &str) -> PortReservation {
        PortReservation {
            port,
            project_id: project_id.to_string(),
            reserved_at: Utc::now(),
        }
    }

    /// A completed connect means something listens; refused means free. Anything
    /// else (timeouts, unreachable) counts as occupied.
    async fn occupancy(&self, port: u16) -> Occupancy {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((self.connect_host, port)))
            .await
        {
            Ok(Ok(_stream)) => Occupancy::Occupied,
            Ok(Err(err)) if err.kind() == ErrorKind::ConnectionRefused => Occupancy::Free,
            Ok(Err(err)) => {
                debug!(port, error = %err, "port check inconclusive");
                Occupancy::Occupied
            }
            Err(_) => Occupancy::Occupied,
        }
    }

    fn refresh_gauge(&self) {
        metrics::PORTS_RESERVED.set(self.table().len() as i64);
    }
}
