use clap::Parser;
use filegate::config::{Args, Config};
use filegate::gate::PathGate;
use filegate::index::{IndexStore, Scanner};
use filegate::server::{self, AppState};
use filegate::upload::{janitor, UploadEngine};
use std::sync::Arc;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "filegate=info".to_string()))
        .init();

    let args = Args::parse();
    let cfg = Arc::new(Config::from_args(args)?);

    // Bases resolve once; an unusable base is a startup error.
    let gate = Arc::new(PathGate::new(&cfg).await?);
    tokio::fs::create_dir_all(&cfg.upload_temp_dir).await?;

    let index = if cfg.index_enabled {
        Some(Arc::new(IndexStore::connect(&cfg.index_database_url).await?))
    } else {
        None
    };

    if let Some(index) = &index {
        let scanner = Scanner::new(Arc::clone(index), cfg.index_scan_concurrency);
        let bases = gate.bases().to_vec();
        let interval = cfg.index_rescan_interval;
        tokio::spawn(async move {
            loop {
                scanner.scan_all(&bases).await;
                tokio::time::sleep(interval).await;
            }
        });
    }

    tokio::spawn(janitor::run(Arc::clone(&cfg)));

    let uploads = Arc::new(UploadEngine::new(
        Arc::clone(&cfg),
        Arc::clone(&gate),
        index.clone(),
    ));
    let state = AppState {
        cfg,
        gate,
        index,
        uploads,
    };

    if let Err(e) = server::serve(state).await {
        error!("server error: {e}");
        return Err(e);
    }
    Ok(())
}
