//! Scriptable test doubles for the transport, exchange, and control seams
//!
//! Each mock yields to the scheduler once per simulated network operation so
//! current-thread tests observe intermediate lifecycle states.

use crate::errors::CamLinkError;
use crate::ice::TransportConfig;
use crate::signaling::OfferExchange;
use crate::testing::synthetic_sdp::{synthetic_answer, synthetic_sdp};
use crate::transport::{ConnectivityState, MediaTransport, SessionDescription, TransportFactory};
use crate::control::{ControlSink, ControlSource, ControlTransport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

/// Scriptable media transport. Tests push connectivity events and inspect
/// whether the handle was released.
pub struct MockMediaTransport {
    offer: SessionDescription,
    connectivity: broadcast::Sender<ConnectivityState>,
    closed: AtomicBool,
    gathering_completes: bool,
    applied: Mutex<Vec<SessionDescription>>,
}

impl MockMediaTransport {
    fn new(offer: SessionDescription, gathering_completes: bool) -> Self {
        let (connectivity, _) = broadcast::channel(16);
        Self {
            offer,
            connectivity,
            closed: AtomicBool::new(false),
            gathering_completes,
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a connectivity-state callback from the transport.
    pub fn push_connectivity(&self, state: ConnectivityState) {
        let _ = self.connectivity.send(state);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn applied_answers(&self) -> Vec<SessionDescription> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaTransport for MockMediaTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CamLinkError> {
        tokio::task::yield_now().await;
        Ok(self.offer.clone())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        tokio::task::yield_now().await;
        Some(self.offer.clone())
    }

    async fn gathering_complete(&self) {
        tokio::task::yield_now().await;
        if !self.gathering_completes {
            std::future::pending::<()>().await;
        }
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), CamLinkError> {
        tokio::task::yield_now().await;
        self.applied.lock().unwrap().push(answer);
        Ok(())
    }

    fn connectivity(&self) -> broadcast::Receiver<ConnectivityState> {
        self.connectivity.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out `MockMediaTransport`s and recording every handle it
/// created.
pub struct MockTransportFactory {
    with_credentials: bool,
    gathering_completes: bool,
    created: Mutex<Vec<Arc<MockMediaTransport>>>,
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self {
            with_credentials: true,
            gathering_completes: true,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Hand out offers that are missing ICE credentials.
    pub fn without_credentials(mut self) -> Self {
        self.with_credentials = false;
        self
    }

    /// Hand out transports whose candidate gathering never reports complete.
    pub fn with_stuck_gathering(mut self) -> Self {
        self.gathering_completes = false;
        self
    }

    pub fn created(&self) -> Vec<Arc<MockMediaTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<MockMediaTransport>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _config: &TransportConfig,
    ) -> Result<Arc<dyn MediaTransport>, CamLinkError> {
        tokio::task::yield_now().await;
        let offer =
            SessionDescription::offer(synthetic_sdp("viewer", self.with_credentials));
        let transport = Arc::new(MockMediaTransport::new(offer, self.gathering_completes));
        self.created.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// One scripted outcome for an offer/answer exchange.
#[derive(Debug, Clone)]
pub enum ExchangeScript {
    Succeed,
    FailStatus(u16),
    AnswerWithoutCredentials,
}

/// Offer exchange following a script; once the script runs out, every
/// exchange succeeds.
pub struct MockOfferExchange {
    script: Mutex<VecDeque<ExchangeScript>>,
    exchanged: Mutex<Vec<String>>,
}

impl MockOfferExchange {
    pub fn scripted(script: Vec<ExchangeScript>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            exchanged: Mutex::new(Vec::new()),
        }
    }

    pub fn always_succeed() -> Self {
        Self::scripted(Vec::new())
    }

    /// Endpoints POSTed to, in order.
    pub fn exchanged(&self) -> Vec<String> {
        self.exchanged.lock().unwrap().clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanged.lock().unwrap().len()
    }
}

#[async_trait]
impl OfferExchange for MockOfferExchange {
    async fn exchange(
        &self,
        endpoint: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, CamLinkError> {
        tokio::task::yield_now().await;
        assert!(
            offer.has_ice_credentials(),
            "sessions must not POST credential-less offers"
        );
        self.exchanged.lock().unwrap().push(endpoint.to_string());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ExchangeScript::Succeed);
        match next {
            ExchangeScript::Succeed => Ok(synthetic_answer()),
            ExchangeScript::FailStatus(code) => Err(CamLinkError::ExchangeError(format!(
                "server returned {} Internal Server Error",
                code
            ))),
            ExchangeScript::AnswerWithoutCredentials => {
                Ok(SessionDescription::answer(synthetic_sdp("server", false)))
            }
        }
    }
}

/// One scripted outcome for a control-channel dial.
#[derive(Debug, Clone)]
pub enum DialScript {
    Accept,
    Refuse,
}

/// One accepted control connection, as seen from the controller side.
pub struct MockControlLink {
    sent: Arc<Mutex<Vec<String>>>,
    to_client: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl MockControlLink {
    /// Frames the channel wrote to this connection, in write order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Push a controller frame to the client.
    pub fn push(&self, frame: impl Into<String>) {
        if let Some(tx) = self.to_client.lock().unwrap().as_ref() {
            let _ = tx.send(frame.into());
        }
    }

    /// Drop the connection from the controller side.
    pub fn close(&self) {
        self.to_client.lock().unwrap().take();
    }
}

struct MockControlSink {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ControlSink for MockControlSink {
    async fn send(&mut self, frame: String) -> Result<(), CamLinkError> {
        tokio::task::yield_now().await;
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self) {}
}

struct MockControlSource {
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ControlSource for MockControlSource {
    async fn next(&mut self) -> Option<Result<String, CamLinkError>> {
        self.from_server.recv().await.map(Ok)
    }
}

/// Control transport following a dial script; once the script runs out,
/// every dial is accepted. Accepted connections are recorded as links.
pub struct MockControlTransport {
    script: Mutex<VecDeque<DialScript>>,
    links: Mutex<Vec<Arc<MockControlLink>>>,
    dials: std::sync::atomic::AtomicUsize,
}

impl Default for MockControlTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControlTransport {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<DialScript>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            links: Mutex::new(Vec::new()),
            dials: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn links(&self) -> Vec<Arc<MockControlLink>> {
        self.links.lock().unwrap().clone()
    }

    /// Dials attempted, refused ones included.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn last_link(&self) -> Option<Arc<MockControlLink>> {
        self.links.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ControlTransport for MockControlTransport {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Box<dyn ControlSink>, Box<dyn ControlSource>), CamLinkError> {
        tokio::task::yield_now().await;
        self.dials.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DialScript::Accept);
        match next {
            DialScript::Refuse => Err(CamLinkError::ControlError(
                "connection refused".to_string(),
            )),
            DialScript::Accept => {
                let sent = Arc::new(Mutex::new(Vec::new()));
                let (to_client, from_server) = mpsc::unbounded_channel();
                let link = Arc::new(MockControlLink {
                    sent: Arc::clone(&sent),
                    to_client: Mutex::new(Some(to_client)),
                });
                self.links.lock().unwrap().push(link);
                Ok((
                    Box::new(MockControlSink { sent }),
                    Box::new(MockControlSource { from_server }),
                ))
            }
        }
    }
}
