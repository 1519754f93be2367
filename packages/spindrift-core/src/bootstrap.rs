//! Service assembly for embedding applications.
//!
//! The standalone server (and tests) build their service graph through
//! [`bootstrap_services`]: backend selection by configuration, the event
//! bridge, the player manager seeded from the YAML roster, and the
//! WebSocket plumbing, returned as one container.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::{AppState, AppStateBuilder, WsConnectionManager};
use crate::clock::MonotonicClock;
use crate::error::{SpindriftError, SpindriftResult};
use crate::events::BroadcastEventBridge;
use crate::manager::PlayerManager;
use crate::player::backend::{AudioBackend, BackendKind, MockBackend};
use crate::state::{CoreConfig, PlayerConfiguration};

/// Everything a hosting application needs to run the endpoint.
pub struct BootstrappedServices {
    /// Endpoint lifecycle manager.
    pub manager: Arc<PlayerManager>,
    /// Event bridge feeding the push channel.
    pub bridge: Arc<BroadcastEventBridge>,
    /// WebSocket connection manager.
    pub ws: Arc<WsConnectionManager>,
    /// Tunables the services were built with.
    pub core: CoreConfig,
}

impl BootstrappedServices {
    /// Assembles the API-layer state over these services.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppStateBuilder::new()
            .manager(self.manager.clone())
            .bridge(self.bridge.clone())
            .ws(self.ws.clone())
            .core(self.core.clone())
            .build()
    }
}

/// Instantiates the backend named by `kind`.
///
/// # Errors
///
/// [`SpindriftError::Unsupported`] when the backend was not compiled in.
pub fn make_backend(kind: BackendKind) -> SpindriftResult<Arc<dyn AudioBackend>> {
    match kind {
        BackendKind::Mock => Ok(Arc::new(MockBackend::new())),
        #[cfg(feature = "pulse")]
        BackendKind::PulseAudio => Ok(Arc::new(
            crate::player::backend::PulseBackend::new("Spindrift"),
        )),
        #[cfg(not(feature = "pulse"))]
        BackendKind::PulseAudio => Err(SpindriftError::Unsupported(
            "pulseaudio backend not compiled in (enable the `pulse` feature)".into(),
        )),
        #[cfg(feature = "alsa-backend")]
        BackendKind::AlsaDirect => Ok(Arc::new(crate::player::backend::AlsaBackend::new())),
        #[cfg(not(feature = "alsa-backend"))]
        BackendKind::AlsaDirect => Err(SpindriftError::Unsupported(
            "alsa backend not compiled in (enable the `alsa-backend` feature)".into(),
        )),
    }
}

/// Builds the full service graph.
///
/// # Errors
///
/// [`SpindriftError::Unsupported`] for a backend missing from this build.
pub fn bootstrap_services(
    core: CoreConfig,
    roster: BTreeMap<String, PlayerConfiguration>,
    roster_path: Option<PathBuf>,
) -> SpindriftResult<BootstrappedServices> {
    let backend = make_backend(core.backend)?;
    let bridge = Arc::new(BroadcastEventBridge::new(core.event_channel_capacity));
    let ws = Arc::new(WsConnectionManager::new());

    let manager = PlayerManager::new(
        core.clone(),
        backend,
        MonotonicClock::arc(),
        bridge.clone(),
    )
    .with_roster(roster_path, roster);

    Ok(BootstrappedServices {
        manager: Arc::new(manager),
        bridge,
        ws,
        core,
    })
}
