use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use lexroute_core::{config::Config, db::Db, pipeline::Pipeline};
use lexroute_oracles::{
    classify::HttpClassifier, extract::HttpExtractor, news::NewsAnalyzer, notify::SmtpNotifier,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lexroute_core=info,lexroute_oracles=info,lexroute_daemon=info".into()),
        )
        .init();

    let config = Config::from_env();

    if let Some(dir) = std::path::Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(dir)?;
    }
    let db = Db::open(&config.db_path)?;
    db.migrate()?;
    let db = Arc::new(db);
    let config = Arc::new(config);

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&db),
        Arc::clone(&config),
        Arc::new(HttpExtractor::new(&config)),
        Arc::new(HttpClassifier::new(&config)),
        Arc::new(NewsAnalyzer::new(&config)),
        Arc::new(SmtpNotifier::new(&config)?),
    ));

    info!(
        "lexroute daemon starting (db={}, tick={}s, max_cases={})",
        config.db_path, config.pipeline_tick_s, config.pipeline_max_cases
    );

    // Pipeline tick loop
    let tick_secs = config.pipeline_tick_s;
    {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            loop {
                if let Err(e) = Arc::clone(&pipeline).tick().await {
                    error!("pipeline tick error: {e}");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(tick_secs)).await;
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!(
        "shutdown requested, {} case(s) still in flight",
        pipeline.active_case_count()
    );
    Ok(())
}
