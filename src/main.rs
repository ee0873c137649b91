use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use media_edge_proxy::{
    config::Config,
    health::HealthManager,
    http_proxy::HttpProxy,
    logging::LoggerManager,
    orchestrator::MediaProxy,
    origin_client::OriginClient,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    ProxyError, Result,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Start the health check server
async fn start_health_server(
    addr: SocketAddr,
    health_manager: Arc<HealthManager>,
    mut shutdown_signal: ShutdownSignal,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::IoError(format!("Failed to bind health server: {}", e)))?;

    info!("Health check server listening on {}", addr);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _) = accept_result.map_err(|e| {
                    ProxyError::IoError(format!("Failed to accept connection: {}", e))
                })?;

                let io = TokioIo::new(stream);
                let health_manager_clone = health_manager.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let health_manager = health_manager_clone.clone();
                        async move { health_manager.handle_health_request(req).await }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving health check connection: {}", e);
                    }
                });
            }
            _ = shutdown_signal.wait_for_shutdown() => {
                info!("Health check server received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the process-wide rustls crypto provider before any TLS config is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::load()?;

    let logger = LoggerManager::new(
        config.logging.clone(),
        gethostname::gethostname().to_string_lossy().to_string(),
    );
    logger.initialize()?;
    if let Err(e) = logger.cleanup_old_logs(30) {
        warn!("Failed to clean up old application logs: {}", e);
    }

    info!(
        "Starting Media Edge Proxy v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    info!("HTTP port: {}", config.server.http_port);
    info!("Public base URL: {}", config.server.public_base_url);
    info!("Transformation backend: {}", config.transform_base_url());

    let origin_client = OriginClient::new()?;
    let media_proxy = Arc::new(MediaProxy::new(&config, origin_client)?);

    // Bind to [::] for IPv6 dual-stack (accepts both IPv4 and IPv6)
    let http_addr = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], config.server.http_port));
    let http_proxy = HttpProxy::new(http_addr, media_proxy, config.server.max_concurrent_requests)
        .with_max_body_bytes(config.server.max_request_body_bytes);

    let mut shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
    shutdown_coordinator.set_active_requests(http_proxy.active_requests());

    let health_manager = Arc::new(HealthManager::new(&config));

    let health_task = if config.health.enabled {
        info!("Starting health check server on port {}", config.health.port);
        let health_addr = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], config.health.port));
        let health_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());

        Some(tokio::spawn(async move {
            if let Err(e) = start_health_server(health_addr, health_manager, health_shutdown).await {
                error!("Health check server failed: {}", e);
            }
        }))
    } else {
        None
    };

    let http_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_proxy.start(http_shutdown).await {
            error!("HTTP proxy failed: {}", e);
        }
    });

    if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
        error!("Shutdown coordinator failed: {}", e);
    }
    info!("Shutdown coordinator completed, waiting for server tasks");

    if tokio::time::timeout(Duration::from_secs(10), http_task)
        .await
        .is_err()
    {
        warn!("HTTP proxy task did not stop in time");
    }
    if let Some(task) = health_task {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    info!("Media Edge Proxy shutdown complete");
    Ok(())
}
