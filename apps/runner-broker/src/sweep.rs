use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::metrics;
use crate::sessions::{finish_session, SessionStatus, SessionStore, TransitionOutcome};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub failed: Vec<String>,
    /// Sessions that reached a terminal state between the scan and the write.
    pub raced: usize,
}

/// Start time before which an `active` session counts as stuck. A zero age or one
/// that cannot be represented as a past instant is rejected.
fn stale_cutoff(max_age_minutes: u64) -> Result<DateTime<Utc>, BrokerError> {
    let invalid = || {
        BrokerError::InvalidRequest(format!(
            "max_age_minutes must be between 1 and a representable age, got {max_age_minutes}"
        ))
    };
    if max_age_minutes == 0 {
        return Err(invalid());
    }
    let minutes = i64::try_from(max_age_minutes).map_err(|_| invalid())?;
    let age = chrono::Duration::try_minutes(minutes).ok_or_else(invalid)?;
    Utc::now().checked_sub_signed(age).ok_or_else(invalid)
}

/// Fail every session still `active` after `max_age_minutes`. Re-running is a no-op
/// for sessions that are already terminal.
pub async fn cleanup_stuck_sessions(
    store: &dyn SessionStore,
    max_age_minutes: u64,
) -> Result<SweepReport, BrokerError> {
    let cutoff = stale_cutoff(max_age_minutes)?;
    let stale = store.active_started_before(cutoff).await?;
    let mut report = SweepReport {
        scanned: stale.len(),
        ..SweepReport::default()
    };
    for session in stale {
        let summary = format!(
            "No completion received within {max_age_minutes} minutes; the runner may have \
             crashed or disconnected"
        );
        match finish_session(store, &session.id, SessionStatus::Failed, Some(summary)).await? {
            TransitionOutcome::Applied(_) => {
                metrics::STUCK_SESSIONS_FAILED.inc();
                warn!(
                    session_id = %session.id,
                    project_id = %session.project_id,
                    started_at = %session.started_at,
                    "stuck session marked failed"
                );
                report.failed.push(session.id);
            }
            TransitionOutcome::AlreadyTerminal(_) | TransitionOutcome::NotFound => {
                report.raced += 1;
            }
        }
    }
    Ok(report)
}

pub fn spawn_sweeper(
    store: Arc<dyn SessionStore>,
    max_age_minutes: u64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match cleanup_stuck_sessions(store.as_ref(), max_age_minutes).await {
                Ok(report) if !report.failed.is_empty() => {
                    info!(failed = report.failed.len(), "stuck-session sweep finished");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "stuck-session sweep failed"),
            }
        }
    })
}
