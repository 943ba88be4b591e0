//! Admin HTTP server
//!
//! This module provides the HTTP server infrastructure including:
//! - Router configuration and route handlers
//! - Server lifecycle management

pub mod router;

pub use router::{build_router, AppState, HealthResponse};

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::config::ServerConfig;

/// Admin HTTP server
///
/// Binds to the configured address and serves the admin router until the
/// shutdown future resolves. Runs started over HTTP are cancelled on
/// shutdown.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.config.host.parse().unwrap_or([127, 0, 0, 1].into()),
            self.config.port,
        )
    }

    /// Run the server until shutdown signal is received
    ///
    /// # Arguments
    ///
    /// * `shutdown` - Future that resolves when the server should shut down
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = self.bind_addr();
        let cancel = self.state.cancel.clone();
        let app = build_router(self.state).layer(tower_http::trace::TraceLayer::new_for_http());

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;

        tracing::info!("Admin server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                cancel.cancel();
            })
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))?;

        tracing::info!("Admin server shutdown complete");
        Ok(())
    }
}

/// Server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address
    #[error("Failed to bind to address: {0}")]
    Bind(String),

    /// Failed to serve requests
    #[error("Server error: {0}")]
    Serve(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::sync::Orchestrator;
    use std::sync::Arc;
    use std::time::Duration;

    fn create_test_state() -> AppState {
        AppState::new(Arc::new(Orchestrator::new(&OrchestratorConfig::default())))
    }

    // Test 1: Default bind address
    #[test]
    fn test_server_new() {
        let server = Server::new(ServerConfig::default(), create_test_state());
        assert_eq!(server.bind_addr().to_string(), "127.0.0.1:8090");
    }

    // Test 2: Unparseable host falls back to loopback
    #[test]
    fn test_server_bind_addr_fallback() {
        let config = ServerConfig {
            host: "not-an-ip".to_string(),
            port: 9090,
            ..Default::default()
        };
        let server = Server::new(config, create_test_state());
        assert_eq!(server.bind_addr().to_string(), "127.0.0.1:9090");
    }

    // Test 3: Graceful shutdown cancels background runs
    #[tokio::test]
    async fn test_server_graceful_shutdown() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let state = create_test_state();
        let cancel = state.cancel.clone();
        let server = Server::new(config, state);

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        let result = tokio::spawn(async move { server.run(shutdown).await })
            .await
            .unwrap();
        assert!(result.is_ok());
        assert!(cancel.is_cancelled());
    }

    // Test 4: ServerError display messages
    #[test]
    fn test_server_error_display() {
        let bind_err = ServerError::Bind("address in use".to_string());
        assert_eq!(
            bind_err.to_string(),
            "Failed to bind to address: address in use"
        );

        let serve_err = ServerError::Serve("connection reset".to_string());
        assert_eq!(serve_err.to_string(), "Server error: connection reset");
    }
}
