pub mod config;
pub mod connect;
pub mod dispatcher;
pub mod errors;
pub mod healthcheck;
pub mod middleware;
pub mod model;
pub mod selector;
pub mod server;
pub mod store;
pub mod tracker;
pub mod transport;
pub mod watcher;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use config::AppConfig;
use healthcheck::HealthChecker;
use server::ProxyServer;
use store::MemoryStore;
use tracker::UsageTracker;

/// Build the full server graph from a parsed config and run it until the process is asked to
/// shut down, draining in-flight connections per the configured grace period before returning.
/// Shared by `main.rs` and integration tests that want a real listener.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store: Arc<dyn store::Store> = Arc::new(MemoryStore::from_config(&config)?);
    let server = Arc::new(ProxyServer::new(store.clone(), &config).await?);
    let tracker = Arc::new(UsageTracker::new(store.clone()));
    let health_checker = Arc::new(HealthChecker::new(store.clone(), tracker));

    let settings = store.get_settings().await?;

    tokio::spawn(watcher::run_pool_refresh(
        store.clone(),
        server_selector_handle(&server),
    ));
    tokio::spawn(watcher::run_bucket_cleanup(
        store.clone(),
        server_rate_limiter_handle(&server),
    ));
    tokio::spawn(health_checker.start_periodic(Duration::from_secs(settings.healthcheck_interval_s)));

    info!(listen = ?config.server.listen, "starting proxy listener");
    let listen_addrs = config.server.listen.clone();
    tokio::select! {
        result = server.clone().run(&listen_addrs) => result,
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining in-flight connections");
            server.shutdown().await;
            Ok(())
        }
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM — whichever arrives first.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// `ProxyServer` keeps its selector private; these accessors exist only so `run` can hand the
/// same shared selector/limiter to the background tickers without widening the server's public
/// surface to every internal collaborator.
fn server_selector_handle(server: &Arc<ProxyServer>) -> Arc<selector::Selector> {
    server.selector_handle()
}

fn server_rate_limiter_handle(server: &Arc<ProxyServer>) -> Arc<middleware::RateLimiter> {
    server.rate_limiter_handle()
}
