//! Crawl service: axum control API plus the in-process dispatch engine.

use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tracing::info;

use crawl_core::dispatcher::DispatcherConfig;
use crawl_core::fetch::HttpFetcher;
use crawl_core::manager::{JobManager, ManagerConfig};
use crawl_core::retry::RetryPolicy;
use crawl_core::robots::RobotsPolicy;
use crawl_core::store::Store;

use config::Config;
use handlers::AppState;

mod config;
mod handlers;
mod metrics;

async fn listen(app: Router, host: &str, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = Store::connect(&config.database_url).await?;
    let fetcher = Arc::new(HttpFetcher::new(
        &config.user_agent,
        config.request_timeout.duration(),
    )?);
    let robots = Arc::new(RobotsPolicy::new(
        store.clone(),
        &config.user_agent,
        config.robots_timeout.duration(),
    ));

    let manager_config = ManagerConfig {
        dispatcher: DispatcherConfig {
            retry_policy: RetryPolicy::new(
                2,
                std::time::Duration::from_secs(2),
                None,
                config.max_retries,
            ),
            throttle_default: config.throttle_default.duration(),
            ..Default::default()
        },
        detector_interval: config.detector_interval.duration(),
    };
    let manager = JobManager::new(store.clone(), robots, fetcher, manager_config);

    // No job may be left in an un-owned running state after startup.
    let recovered = manager.recover().await?;
    if recovered > 0 {
        info!("rebound {recovered} job(s) from a previous process");
    }

    let defaults = (&config).into();
    let state = AppState {
        manager,
        store,
        defaults,
    };
    let app = handlers::add_routes(Router::new(), state);
    let app = metrics::setup_metrics_routes(app);

    info!("listening on {}:{}", config.host, config.port);
    match listen(app, &config.host, config.port).await {
        Ok(_) => {}
        Err(error) => tracing::error!("failed to start crawl-server http server, {}", error),
    }
    Ok(())
}
