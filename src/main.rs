//! Binary entry point: load configuration, open storage, build the venue
//! adapter set, wire the observatory, and serve the status API alongside
//! the background pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arb_observatory::app::Observatory;
use arb_observatory::kv::{KvStore, RedisKv};
use arb_observatory::models::Config;
use arb_observatory::storage::{DurableStore, SqliteStore};
use arb_observatory::venue::cex::CexAdapter;
use arb_observatory::venue::dex::DexSpotAdapter;
use arb_observatory::venue::VenueAdapter;

#[derive(Parser, Debug)]
#[command(name = "observatory", about = "Cross-venue crypto arbitrage observatory")]
struct Cli {
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,

    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(path) = cli.database_path {
        config.database_path = path;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    info!(port = config.port, database = %config.database_path, "starting observatory");

    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open(&config.database_path)?);
    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect(&config.redis_url).await?);

    let binance_spot = CexAdapter::spawn_binance_spot(vec![
        "btcusdt".into(),
        "ethusdt".into(),
        "solusdt".into(),
    ])
    .await?;
    let binance_futures =
        CexAdapter::spawn_binance_futures(vec!["btcusdt".into(), "ethusdt".into()]).await?;
    let dex_spot = DexSpotAdapter::spawn(
        "uniswap-agg".to_string(),
        std::env::var("DEX_AGGREGATOR_URL")
            .unwrap_or_else(|_| "https://api.example-dex-aggregator.invalid".to_string()),
        vec!["BTC".into(), "ETH".into(), "SOL".into()],
    );

    let adapters: Vec<Arc<dyn VenueAdapter>> = vec![binance_spot, binance_futures, dex_spot];

    let observatory = Observatory::new(config.clone(), kv, store, adapters);

    let shutdown = CancellationToken::new();
    observatory.spawn_all(shutdown.clone());

    let app = arb_observatory::api::router(observatory.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status API listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::select! {
        result = server => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    }

    Ok(())
}
