use clap::Parser;
use ha_eink_screenshot_engine::browser_driver::BrowserDriver;
use ha_eink_screenshot_engine::cli::{setup_logging, Cli};
use ha_eink_screenshot_engine::config::AppConfig;
use ha_eink_screenshot_engine::facade::BrowserFacade;
use ha_eink_screenshot_engine::http::{build_router, AppState};
use ha_eink_screenshot_engine::metrics::EngineMetrics;
use ha_eink_screenshot_engine::schedule_executor::ScheduleExecutor;
use ha_eink_screenshot_engine::schedule_store::JsonFileScheduleStore;
use ha_eink_screenshot_engine::scheduler::Scheduler;
use ha_eink_screenshot_engine::serializer::RequestSerializer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();
    setup_logging(args.verbose)?;

    info!("Starting ha-eink-screenshot-engine v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(load_config(&args).await?);
    config.validate()?;

    let metrics = Arc::new(EngineMetrics::install());

    let driver = Arc::new(BrowserDriver::new(config.clone()));
    let facade = Arc::new(BrowserFacade::new(driver.clone()).with_metrics(metrics.clone()));
    let serializer =
        RequestSerializer::new(config.clone(), driver.clone(), facade.clone()).with_metrics(metrics.clone());

    let store = JsonFileScheduleStore::open(config.schedule_store_path.clone()).await?;
    let executor = Arc::new(
        ScheduleExecutor::new(config.clone(), serializer.clone()).with_metrics(metrics.clone()),
    );
    let scheduler = Scheduler::new(config.clone(), store.clone(), executor).await?;
    scheduler.start().await;

    let state = Arc::new(AppState {
        config: config.clone(),
        serializer: serializer.clone(),
        facade: facade.clone(),
        scheduler: scheduler.clone(),
        store,
        metrics,
        start_time: Instant::now(),
    });

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("listening on port {}", config.port);

    let shutdown_signal = wait_for_shutdown_signal();

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await;

    if let Err(err) = serve_result {
        error!("HTTP server error: {err}");
    }

    info!("shutting down");
    // Force exit if scheduler/serializer cleanup stalls past the grace period.
    let grace = Duration::from_millis(ha_eink_screenshot_engine::config::constants::SHUTDOWN_GRACE_MS);
    let cleanup = async {
        scheduler.stop().await;
        serializer.shutdown().await;
    };
    if tokio::time::timeout(grace, cleanup).await.is_err() {
        error!("graceful shutdown exceeded {grace:?}, forcing exit");
        std::process::exit(1);
    }

    info!("ha-eink-screenshot-engine stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

async fn load_config(args: &Cli) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = if let Some(path) = &args.config {
        let raw = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&raw)?
    } else {
        AppConfig::default()
    };

    config = config.apply_env_overrides();

    if let Some(port) = args.port {
        config.port = port;
    }
    if args.keep_browser_open {
        config.keep_browser_open = true;
    }
    if args.mock_ha {
        config.mock_ha = true;
    }

    info!("configuration loaded: port={}, mock_ha={}, keep_browser_open={}", config.port, config.mock_ha, config.keep_browser_open);

    Ok(config)
}
