//! Transport seam for peer sessions
//!
//! The lifecycle manager drives any real-time transport through this trait:
//! create a session offer, wait for candidate gathering, apply the remote
//! answer, observe connectivity. The `rtc` module (feature `webrtc`) provides
//! the production implementation; `testing` provides scriptable mocks.

use crate::errors::CamLinkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ice::TransportConfig;

/// SDP (Session Description Protocol) type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// A description without ICE credentials cannot be negotiated; treat it
    /// as unrecoverable for the current attempt.
    pub fn has_ice_credentials(&self) -> bool {
        self.sdp.contains("a=ice-ufrag:") && self.sdp.contains("a=ice-pwd:")
    }
}

/// Connectivity state reported by the underlying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// States that require tearing down the current attempt and scheduling
    /// a reconnect rather than repairing the handle in place.
    pub fn is_lost(&self) -> bool {
        matches!(self, ConnectivityState::Failed | ConnectivityState::Disconnected)
    }
}

/// One real-time transport session. Owned exclusively by a single
/// `PeerSession`; never shared between keys.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Create the local session offer and install it as the local
    /// description. Candidate gathering starts as a side effect.
    async fn create_offer(&self) -> Result<SessionDescription, CamLinkError>;

    /// Current local description, refreshed with any candidates gathered
    /// since `create_offer`.
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Resolves once the transport reports candidate gathering complete.
    /// Callers bound this with a timeout; timing out must not abort
    /// gathering, late candidates are still accepted by the transport.
    async fn gathering_complete(&self);

    /// Apply the remote answer.
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), CamLinkError>;

    /// Subscribe to connectivity-state changes.
    fn connectivity(&self) -> broadcast::Receiver<ConnectivityState>;

    /// Release the transport. Idempotent; safe to call when already released.
    async fn close(&self);
}

/// Creates a fresh transport handle per connection attempt from an
/// immutable `TransportConfig`.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
    ) -> Result<std::sync::Arc<dyn MediaTransport>, CamLinkError>;
}
