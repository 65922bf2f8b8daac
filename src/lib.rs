//! CamLink: resilient camera stream sessions over unreliable networks
//!
//! This crate manages the connection lifecycle for live camera viewing:
//! one WebRTC-style peer session per stream, driven through a connect ->
//! monitor -> reconnect state machine with bounded retries and exponential
//! backoff, plus a persistent WebSocket command channel that queues
//! mount-control commands across reconnect cycles.
//!
//! # Features
//! - Per-stream session state machine with bounded, backed-off retries
//! - TURN/STUN configuration resolution with layered fallback
//! - At-most-one transport handle per stream key, enforced by the registry
//! - FIFO command queuing across control-channel drops
//! - Desktop/mobile client profiles (gathering timeouts, relay bias)
//!
//! # Usage
//! ```rust,ignore
//! use camlink::{CamLinkConfig, ClientProfile, CommandChannel, SessionRegistry};
//! use camlink::rtc::RtcTransportFactory;
//! use std::sync::Arc;
//!
//! let config = CamLinkConfig::load_or_default();
//! let registry = SessionRegistry::from_config(
//!     &config,
//!     ClientProfile::Desktop,
//!     Arc::new(RtcTransportFactory),
//! );
//! let controls = CommandChannel::from_config(&config.control);
//!
//! let session = registry.ensure("cam1", "https://streaming.example.dev/cam/whep").await;
//! controls.send(&camlink::CameraCommand::pan_left("cam1")).await?;
//! ```

pub mod config;
pub mod control;
pub mod errors;
pub mod ice;
pub mod invariant_ppt;
pub mod registry;
pub mod retry;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(feature = "webrtc")]
pub mod rtc;

// Testing utilities - scripted seams for offline testing
pub mod testing;

// Re-exports for convenience
pub use config::{CamLinkConfig, ControlConfig, IceConfig, SessionConfig};
pub use control::{
    CameraCommand, ChannelState, CommandChannel, ControlEvent, ControlOptions, ControlStatus,
};
pub use errors::CamLinkError;
pub use ice::{ClientProfile, IceConfigResolver, IceServer, TransportConfig};
pub use registry::SessionRegistry;
pub use retry::RetryPolicy;
pub use session::{PeerSession, SessionOptions, SessionState};
pub use signaling::{HttpOfferExchange, OfferExchange};
pub use transport::{ConnectivityState, MediaTransport, SessionDescription, TransportFactory};

/// Initialize logging for the viewer
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "camlink=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}
