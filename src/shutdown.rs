//! Graceful Shutdown Module
//!
//! Listens for SIGINT/SIGTERM, tells every server loop to stop accepting, and
//! waits for in-flight requests to drain.

use crate::{ProxyError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    active_requests: Option<Arc<AtomicUsize>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            active_requests: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Track in-flight requests so shutdown can wait for them
    pub fn set_active_requests(&mut self, active_requests: Arc<AtomicUsize>) {
        self.active_requests = Some(active_requests);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Start listening for shutdown signals
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        // Listen for SIGINT (Ctrl+C) and SIGTERM
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Initiate graceful shutdown sequence
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            // No receivers left; nothing to notify
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.drain_requests()).await {
            Ok(()) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Err(_) => {
                let remaining = self
                    .active_requests
                    .as_ref()
                    .map(|c| c.load(Ordering::Relaxed))
                    .unwrap_or(0);
                error!(
                    "Graceful shutdown timed out after {:?} with {} requests in flight",
                    self.shutdown_timeout, remaining
                );
                Err(ProxyError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }

    /// Wait until no request is in flight
    async fn drain_requests(&self) {
        let Some(active_requests) = &self.active_requests else {
            return;
        };

        let mut logged = false;
        loop {
            let active = active_requests.load(Ordering::Relaxed);
            if active == 0 {
                break;
            }
            if !logged {
                info!("Waiting for {} in-flight requests to complete", active);
                logged = true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    /// Create new shutdown signal from receiver
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        match self.receiver.recv().await {
            Ok(()) => {}
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Shutdown channel closed, treating as shutdown");
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
        self.shutdown_requested = true;
        Ok(())
    }
}
