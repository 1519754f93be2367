//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to the player manager.
//! It provides router construction ([`http::build_router`]), shared state
//! ([`AppState`]), and server startup ([`start_server`]).

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clock::MonotonicClock;
use crate::events::BroadcastEventBridge;
use crate::manager::PlayerManager;
use crate::player::backend::MockBackend;
use crate::state::CoreConfig;

pub mod http;
pub mod response;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// A thin wrapper holding references to services; all business logic lives
/// in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Endpoint lifecycle manager.
    pub manager: Arc<PlayerManager>,
    /// Event bridge feeding the WebSocket push channel.
    pub bridge: Arc<BroadcastEventBridge>,
    /// WebSocket connection tracking and fan-out.
    pub ws: Arc<WsConnectionManager>,
    /// Process-wide tunables.
    pub core: CoreConfig,
}

/// Builder for constructing an [`AppState`].
pub struct AppStateBuilder {
    manager: Option<Arc<PlayerManager>>,
    bridge: Option<Arc<BroadcastEventBridge>>,
    ws: Option<Arc<WsConnectionManager>>,
    core: CoreConfig,
}

impl AppStateBuilder {
    /// Creates an empty builder with default tunables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            manager: None,
            bridge: None,
            ws: None,
            core: CoreConfig::default(),
        }
    }

    /// Fully mocked state for tests: mock backend, default tunables.
    #[must_use]
    pub fn mock() -> Self {
        let core = CoreConfig::default();
        let bridge = Arc::new(BroadcastEventBridge::new(core.event_channel_capacity));
        let manager = Arc::new(PlayerManager::new(
            core.clone(),
            Arc::new(MockBackend::new()),
            MonotonicClock::arc(),
            bridge.clone(),
        ));
        Self {
            manager: Some(manager),
            bridge: Some(bridge),
            ws: Some(Arc::new(WsConnectionManager::new())),
            core,
        }
    }

    /// Sets the player manager.
    #[must_use]
    pub fn manager(mut self, manager: Arc<PlayerManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Sets the event bridge.
    #[must_use]
    pub fn bridge(mut self, bridge: Arc<BroadcastEventBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Sets the WebSocket connection manager.
    #[must_use]
    pub fn ws(mut self, ws: Arc<WsConnectionManager>) -> Self {
        self.ws = Some(ws);
        self
    }

    /// Sets the core tunables.
    #[must_use]
    pub fn core(mut self, core: CoreConfig) -> Self {
        self.core = core;
        self
    }

    /// Builds the state.
    ///
    /// # Panics
    ///
    /// Panics when a required service was not provided; state assembly is a
    /// startup-time concern, not a recoverable one.
    #[must_use]
    pub fn build(self) -> AppState {
        AppState {
            manager: self.manager.expect("manager is required"),
            bridge: self
                .bridge
                .unwrap_or_else(|| Arc::new(BroadcastEventBridge::new(256))),
            ws: self.ws.unwrap_or_else(|| Arc::new(WsConnectionManager::new())),
            core: self.core,
        }
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds `port` and serves the API until `cancel` fires.
///
/// # Errors
///
/// [`ServerError::Bind`] when the port cannot be bound.
pub async fn start_server(
    state: AppState,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let router = http::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("[Api] Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_builder_produces_usable_state() {
        let state = AppStateBuilder::mock().build();
        assert_eq!(state.manager.list().len(), 0);
        assert_eq!(state.ws.connection_count(), 0);
    }
}
