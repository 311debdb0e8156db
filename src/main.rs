use std::{env, path::PathBuf};

use rotaprox::config::AppConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    // Needed once per process before any rustls::ClientConfig is built (the insecure outbound
    // TLS config in transport.rs and the CONNECT-tunnel TLS wrap in connect.rs both build one).
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_path = env::var("ROTAPROX_CONFIG").unwrap_or_else(|_| "rotaprox.toml".to_string());
    let config_path = PathBuf::from(config_path);
    let config = AppConfig::from_file(&config_path)?;

    init_tracing(&config.server.log_level);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = config.server.threads {
        builder.worker_threads(threads);
    }
    let runtime = builder.build()?;

    runtime.block_on(async move {
        info!(config = %config_path.to_string_lossy(), "rotaprox is starting");
        rotaprox::run(config).await
    })
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}
