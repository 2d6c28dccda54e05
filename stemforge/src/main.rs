use std::sync::Arc;

use stemforge::config::AppConfig;
use stemforge::database::{self, repositories::Repositories};
use stemforge::domain::JobOptions;
use stemforge::events::BroadcastEventBus;
use stemforge::logging;
use stemforge::pipeline::PipelineManager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default();
    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;
    config.validate()?;

    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let events = Arc::new(BroadcastEventBus::new());
    let manager = PipelineManager::new(config, Repositories::sqlite(pool), events);
    manager.start();

    // Each argument is a media URL for a fresh track.
    for url in std::env::args().skip(1) {
        let track_id = uuid::Uuid::new_v4().to_string();
        match manager.submit(&track_id, &url, JobOptions::new()).await {
            Ok(job_id) => info!(track_id = %track_id, job_id = %job_id, url = %url, "Submitted track"),
            Err(e) => error!(url = %url, error = %e, "Failed to submit track"),
        }
    }

    info!("stemforge running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    shutdown.cancel();
    manager.stop().await;
    info!("stemforge stopped");

    Ok(())
}
