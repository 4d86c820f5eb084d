use std::sync::Arc;

use sqlx::PgPool;

use crate::bus::CommandBus;
use crate::config::AppConfig;
use crate::error::StoreError;
use crate::handlers::{ProjectLifecycle, SessionEvents};
use crate::logs::LogBuffer;
use crate::ports::PortAllocator;
use crate::projects::{InMemoryProjectStore, PostgresProjectStore, ProjectStore};
use crate::registry::ConnectionRegistry;
use crate::sessions::{InMemorySessionStore, PostgresSessionStore, SessionStore};

#[derive(Clone)]
enum Backend {
    Memory,
    Postgres(PgPool),
}

/// Everything a request handler or socket loop needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub bus: CommandBus,
    pub sessions: Arc<dyn SessionStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub ports: Arc<PortAllocator>,
    pub logs: LogBuffer,
    backend: Backend,
}

impl AppState {
    pub fn in_memory(config: AppConfig) -> Self {
        Self::assemble(
            config,
            InMemorySessionStore::new(),
            InMemoryProjectStore::new(),
            Backend::Memory,
        )
    }

    pub fn with_db(pool: PgPool, config: AppConfig) -> Self {
        Self::assemble(
            config,
            Arc::new(PostgresSessionStore::new(pool.clone())),
            Arc::new(PostgresProjectStore::new(pool.clone())),
            Backend::Postgres(pool),
        )
    }

    fn assemble(
        config: AppConfig,
        sessions: Arc<dyn SessionStore>,
        projects: Arc<dyn ProjectStore>,
        backend: Backend,
    ) -> Self {
        let registry = ConnectionRegistry::new(config.liveness_window());
        let bus = CommandBus::new(
            registry,
            config.max_pending_per_runner,
            config.max_pending_total,
        );
        let ports = Arc::new(PortAllocator::new(
            config.port_range_start..=config.port_range_end,
            config.port_connect_timeout(),
        ));
        let logs = LogBuffer::new(config.log_buffer_capacity);

        bus.register_handler(Arc::new(SessionEvents::new(sessions.clone())));
        bus.register_handler(Arc::new(ProjectLifecycle::new(
            projects.clone(),
            ports.clone(),
            logs.clone(),
        )));

        Self {
            config: Arc::new(config),
            bus,
            sessions,
            projects,
            ports,
            logs,
            backend,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.bus.registry()
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Memory => "memory",
            Backend::Postgres(_) => "postgres",
        }
    }

    pub async fn check_ready(&self) -> Result<(), StoreError> {
        if let Backend::Postgres(pool) = &self.backend {
            sqlx::query("SELECT 1").execute(pool).await?;
        }
        Ok(())
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
