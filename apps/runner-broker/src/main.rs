use std::net::SocketAddr;
use std::time::Duration;

use runner_broker::{
    config::AppConfig,
    metrics,
    routes::build_router,
    state::{run_migrations, AppState},
    sweep::spawn_sweeper,
    telemetry::init_tracing,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env();
    init_tracing(&cfg.log_filter);

    let state = if let Some(db_url) = &cfg.database_url {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match run_migrations(&pool).await {
                Ok(()) => {
                    info!("database migrations applied");
                    AppState::with_db(pool, cfg.clone())
                }
                Err(err) => {
                    warn!(error = %err, "failed to run database migrations, continuing with in-memory state");
                    AppState::in_memory(cfg.clone())
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to connect to database, continuing with in-memory state");
                AppState::in_memory(cfg.clone())
            }
        }
    } else {
        info!("database_url not set; running in in-memory mode");
        AppState::in_memory(cfg.clone())
    };

    if cfg.stuck_sweep_interval_secs > 0 {
        spawn_sweeper(
            state.sessions.clone(),
            cfg.stuck_session_max_age_minutes,
            Duration::from_secs(cfg.stuck_sweep_interval_secs),
        );
    }

    metrics::BOOT_COUNTER.inc();
    let app = build_router(state);

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!(addr = %addr, "starting runner broker");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app.into_make_service()).await?;

    Ok(())
}
