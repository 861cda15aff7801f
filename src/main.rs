use anyhow::Context;
use clap::Parser;
use dividend_engine::directory::SledDirectory;
use dividend_engine::ledger::SledLedger;
use dividend_engine::store::Store;
use dividend_engine::{routes, scheduler, DividendEngine, EngineConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dividend-engine", about = "Threshold-triggered bonus distribution engine")]
struct Args {
    /// Data directory for the embedded database.
    #[arg(long, default_value = "./dividend-data")]
    data_dir: String,

    /// Listen address for the admin API.
    #[arg(long, default_value = "127.0.0.1:7080")]
    listen: SocketAddr,

    /// Disable the background sweep scheduler (sweeps must then be
    /// triggered through the admin API).
    #[arg(long)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("DIVIDEND_LOG")
        .unwrap_or_else(|_| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let config = EngineConfig::from_env();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let db = sled::open(&args.data_dir)
        .with_context(|| format!("opening database at {}", args.data_dir))?;
    let store = Arc::new(Store::open(db).context("opening engine trees")?);
    let directory = Arc::new(SledDirectory::open(store.db()).context("opening directory")?);
    let ledger = Arc::new(SledLedger::open(store.db()).context("opening ledger")?);

    let engine = Arc::new(
        DividendEngine::new(store.clone(), directory, ledger, config.clone())
            .context("building engine")?,
    );
    info!(
        "dividend engine starting: {} pool(s), sweep every {}s",
        store.pools.all().map(|p| p.len()).unwrap_or(0),
        config.sweep_interval_secs
    );

    if !args.no_scheduler {
        scheduler::spawn_scheduler(engine.clone(), config.sweep_interval_secs);
    }

    let app = routes::router(engine);
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!("admin API listening on {}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = store.flush();
        })
        .await?;
    Ok(())
}
