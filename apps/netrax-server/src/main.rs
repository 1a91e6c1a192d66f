//! netrax Server: headless capture server
//!
//! Opens the camera (or a detector, when one is linked in), serves the MJPEG
//! stream, a WebSocket for stats and gesture events, and a status endpoint.
//!
//! ## Usage
//!
//! ```bash
//! # Start server (port 8000, config/body_detection_config.json)
//! netrax-server
//!
//! # Custom port and config
//! NETRAX_WEB_PORT=8080 NETRAX_CONFIG_PATH=/etc/netrax.json netrax-server
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use netrax::capture::default_backends;
use netrax::{config, CaptureConfig, Service};

/// Server configuration from environment
struct Config {
    config_path: PathBuf,
    bind_addr: IpAddr,
    web_port: u16,
}

impl Config {
    fn from_env() -> Self {
        let config_path = config::config_path_from_env();

        let bind_addr: IpAddr = std::env::var("NETRAX_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let web_port: u16 = std::env::var("NETRAX_WEB_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8000);

        Self {
            config_path,
            bind_addr,
            web_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("netrax server starting");
    info!("  Config path: {:?}", config.config_path);
    info!("  Web: {}:{}", config.bind_addr, config.web_port);

    let capture = CaptureConfig::load_or_default(&config.config_path);
    info!("  Camera: {}", capture.camera_id);

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let backends = default_backends(&capture.policy);
    let service = Service::start(&capture, None, backends, cancel.clone())
        .context("Failed to start capture service")?;

    // Bind before spawning so a taken port fails startup
    let web_bind = SocketAddr::new(config.bind_addr, config.web_port);
    let web_ctx = service.web_context();
    let listener = tokio::net::TcpListener::bind(web_bind)
        .await
        .context(format!("Failed to bind to {}", web_bind))?;
    info!("Web server listening on http://{}", web_bind);

    tracker.spawn(async move {
        if let Err(e) = netrax::web::serve(listener, web_ctx).await {
            error!("Web server error: {}", e);
        }
    });

    tracker.close();

    run_headless(service, cancel, tracker).await
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("netrax=info")),
        )
        .init();
}

/// Headless mode: log stats periodically, shut down on SIGINT/SIGTERM
async fn run_headless(service: Service, cancel: CancellationToken, tracker: TaskTracker) -> Result<()> {
    let mut stats_interval = interval(Duration::from_secs(30));
    stats_interval.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
            _ = stats_interval.tick() => {
                let hub = service.hub().stats();
                let stats = service.state().read_stats();
                info!(
                    "Stats: {:.1} fps, {} subscribers, {} events published, {} gestures",
                    stats.fps, hub.subscribers, hub.events_published, stats.gesture_count
                );
            }
        }
    }

    // producer join blocks; keep it off the runtime workers
    let producer = tokio::task::spawn_blocking(move || service.shutdown());

    if tokio::time::timeout(Duration::from_secs(5), async {
        tracker.wait().await;
        let _ = producer.await;
    })
    .await
    .is_err()
    {
        warn!("Shutdown timed out after 5s");
    }
    Ok(())
}

/// Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
