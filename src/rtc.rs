//! WebRTC transport adapter
//!
//! `MediaTransport` over the `webrtc` crate for viewer-only (recvonly)
//! sessions. The lifecycle manager stays transport-agnostic; this module is
//! the only place that talks to webrtc-rs directly.

use crate::errors::CamLinkError;
use crate::ice::{BundlePolicy, IceServer, IceTransportPolicy, TransportConfig};
use crate::transport::{ConnectivityState, MediaTransport, SessionDescription, TransportFactory};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectivityState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => ConnectivityState::New,
            RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
            RTCPeerConnectionState::Connected => ConnectivityState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectivityState::Failed,
            RTCPeerConnectionState::Closed => ConnectivityState::Closed,
            RTCPeerConnectionState::Unspecified => ConnectivityState::New,
        }
    }
}

fn to_rtc_configuration(config: &TransportConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.ice_servers.iter().cloned().map(Into::into).collect(),
        ice_transport_policy: match config.ice_transport_policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        bundle_policy: match config.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

/// One webrtc-rs peer connection in recvonly mode.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    connectivity: broadcast::Sender<ConnectivityState>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CamLinkError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CamLinkError::NegotiationError(format!("create offer failed: {}", e)))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                CamLinkError::NegotiationError(format!("set local description failed: {}", e))
            })?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .map(|desc| SessionDescription::offer(desc.sdp))
    }

    async fn gathering_complete(&self) {
        let receiver = self.gathering.lock().await.take();
        if let Some(mut receiver) = receiver {
            let _ = receiver.recv().await;
        }
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), CamLinkError> {
        let desc = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| CamLinkError::NegotiationError(format!("invalid answer SDP: {}", e)))?;
        self.pc.set_remote_description(desc).await.map_err(|e| {
            CamLinkError::NegotiationError(format!("set remote description failed: {}", e))
        })
    }

    fn connectivity(&self) -> broadcast::Receiver<ConnectivityState> {
        self.connectivity.subscribe()
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            log::warn!("Failed to close peer connection: {}", e);
        }
    }
}

/// Creates recvonly webrtc-rs transports.
pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn MediaTransport>, CamLinkError> {
        let api = APIBuilder::new().build();

        let pc = Arc::new(
            api.new_peer_connection(to_rtc_configuration(config))
                .await
                .map_err(|e| {
                    CamLinkError::TransportError(format!("failed to create peer connection: {}", e))
                })?,
        );

        // Viewer only: one recvonly transceiver per media kind.
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                CamLinkError::TransportError(format!("failed to add transceiver: {}", e))
            })?;
        }

        let (connectivity, _) = broadcast::channel(16);
        let sender = connectivity.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::debug!("Peer connection state changed: {}", state);
            let _ = sender.send(state.into());
            Box::pin(async {})
        }));

        let gathering = pc.gathering_complete_promise().await;

        Ok(Arc::new(RtcTransport {
            pc,
            connectivity,
            gathering: Mutex::new(Some(gathering)),
        }))
    }
}
