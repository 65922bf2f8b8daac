//! Peer session lifecycle
//!
//! One `PeerSession` owns exactly one real-time transport handle for one
//! named stream and drives it through connect -> monitor -> (reconnect |
//! close). State transitions are the single source of truth: connectivity
//! callbacks and timers only propose transitions, they never mutate the
//! session from the side.

use crate::assert_invariant;
use crate::config::SessionConfig;
use crate::errors::CamLinkError;
use crate::ice::{ClientProfile, IceConfigResolver};
use crate::retry::RetryPolicy;
use crate::signaling::OfferExchange;
use crate::transport::{ConnectivityState, MediaTransport, TransportFactory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Peer session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Negotiating,
    GatheringCandidates,
    AwaitingAnswer,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl SessionState {
    /// States in which `connect()` is a no-op: an attempt is already in
    /// flight or the session is established.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Negotiating
                | SessionState::GatheringCandidates
                | SessionState::AwaitingAnswer
                | SessionState::Connected
        )
    }

    /// States a connect cycle ends in.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Failed | SessionState::Closed
        )
    }
}

/// Tunables for one session's connect cycle.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Connection attempts per connect cycle before the session fails
    pub max_connect_attempts: u32,
    pub retry: RetryPolicy,
    /// Bound on the candidate-gathering wait
    pub gathering_timeout: Duration,
    /// Bound on the offer/answer round trip
    pub exchange_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            retry: RetryPolicy::default(),
            gathering_timeout: Duration::from_secs(5),
            exchange_timeout: Duration::from_secs(15),
        }
    }
}

impl SessionOptions {
    /// Mobile relay negotiation is slower; the profile widens the
    /// candidate-gathering bound accordingly.
    pub fn from_config(config: &SessionConfig, profile: ClientProfile) -> Self {
        let gathering_ms = match profile {
            ClientProfile::Desktop => config.gathering_timeout_desktop_ms,
            ClientProfile::Mobile => config.gathering_timeout_mobile_ms,
        };
        Self {
            max_connect_attempts: config.max_connect_attempts,
            retry: RetryPolicy::new(config.base_backoff_ms, config.cap_backoff_ms),
            gathering_timeout: Duration::from_millis(gathering_ms),
            exchange_timeout: Duration::from_millis(config.exchange_timeout_ms),
        }
    }
}

struct SessionInner {
    attempt: u32,
    transport: Option<Arc<dyn MediaTransport>>,
    pending_timer: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    driving: bool,
}

/// One peer session per stream key. Cloneable handle; all clones share the
/// same underlying session.
#[derive(Clone)]
pub struct PeerSession {
    key: String,
    endpoint: String,
    opts: SessionOptions,
    resolver: Arc<IceConfigResolver>,
    factory: Arc<dyn TransportFactory>,
    exchange: Arc<dyn OfferExchange>,
    state_tx: Arc<watch::Sender<SessionState>>,
    inner: Arc<Mutex<SessionInner>>,
}

impl PeerSession {
    pub fn new(
        key: impl Into<String>,
        endpoint: impl Into<String>,
        opts: SessionOptions,
        resolver: Arc<IceConfigResolver>,
        factory: Arc<dyn TransportFactory>,
        exchange: Arc<dyn OfferExchange>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            key: key.into(),
            endpoint: endpoint.into(),
            opts,
            resolver,
            factory,
            exchange,
            state_tx: Arc::new(state_tx),
            inner: Arc::new(Mutex::new(SessionInner {
                attempt: 0,
                transport: None,
                pending_timer: None,
                monitor: None,
                driving: false,
            })),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions; receivers can `wait_for` a target state.
    pub fn observe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Connection attempts since the last success.
    pub async fn attempt(&self) -> u32 {
        self.inner.lock().await.attempt
    }

    /// Drive the session until it settles in `Connected` or `Failed`.
    ///
    /// No-op while an attempt is already in flight or the session is
    /// `Connected`; a `Failed` session retries from a fresh attempt budget;
    /// a `Closed` session cannot be revived.
    pub async fn connect(&self) -> Result<(), CamLinkError> {
        {
            let mut inner = self.inner.lock().await;
            let state = self.state();
            if state == SessionState::Closed {
                return Err(CamLinkError::SessionClosed(self.key.clone()));
            }
            if state.is_active() || inner.driving {
                log::debug!("Session {}: connect() ignored while {:?}", self.key, state);
                return Ok(());
            }
            if state == SessionState::Failed {
                log::info!("Session {}: explicit retry after failure, resetting attempts", self.key);
                inner.attempt = 0;
            }
            inner.driving = true;
        }

        let result = self.drive().await;
        self.inner.lock().await.driving = false;
        result
    }

    /// Cancel pending work, release the transport, and park the session in
    /// `Closed`. Idempotent; `Closed` is terminal.
    pub async fn close(&self) {
        let (timer, monitor, transport) = {
            let mut inner = self.inner.lock().await;
            (
                inner.pending_timer.take(),
                inner.monitor.take(),
                inner.transport.take(),
            )
        };
        // Pending timers go first so no reconnect fires against a key that
        // has moved on.
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.transition(SessionState::Closed);
    }

    fn transition(&self, next: SessionState) {
        let key = self.key.clone();
        self.state_tx.send_if_modified(|state| {
            // Nothing leaves Closed; any state may enter it.
            if *state == SessionState::Closed || *state == next {
                return false;
            }
            log::info!("Session {}: {:?} -> {:?}", key, *state, next);
            *state = next;
            true
        });
    }

    async fn drive(&self) -> Result<(), CamLinkError> {
        loop {
            if self.state() == SessionState::Closed {
                return Err(CamLinkError::SessionClosed(self.key.clone()));
            }

            let attempt = {
                let mut inner = self.inner.lock().await;
                inner.attempt += 1;
                inner.attempt
            };
            if attempt > self.opts.max_connect_attempts {
                self.transition(SessionState::Failed);
                return Err(CamLinkError::RetriesExhausted(format!(
                    "session {} exceeded {} connection attempts",
                    self.key, self.opts.max_connect_attempts
                )));
            }

            log::info!(
                "Session {}: connection attempt {}/{}",
                self.key,
                attempt,
                self.opts.max_connect_attempts
            );
            self.transition(SessionState::Negotiating);

            match self.establish().await {
                Ok(()) => {
                    self.inner.lock().await.attempt = 0;
                    self.transition(SessionState::Connected);
                    self.spawn_monitor().await;
                    return Ok(());
                }
                Err(e) => {
                    if self.state() == SessionState::Closed {
                        return Err(CamLinkError::SessionClosed(self.key.clone()));
                    }
                    log::warn!("Session {}: attempt {} failed: {}", self.key, attempt, e);
                    self.release_transport().await;
                    self.transition(SessionState::Reconnecting);

                    if !self
                        .opts
                        .retry
                        .should_retry(attempt, self.opts.max_connect_attempts)
                    {
                        self.transition(SessionState::Failed);
                        return Err(CamLinkError::RetriesExhausted(format!(
                            "session {} failed after {} attempts: {}",
                            self.key, attempt, e
                        )));
                    }

                    let delay = self.opts.retry.next_delay(attempt - 1);
                    log::info!("Session {}: retrying in {:?}", self.key, delay);
                    if !self.backoff(delay).await {
                        return Err(CamLinkError::SessionClosed(self.key.clone()));
                    }
                }
            }
        }
    }

    /// One connection attempt: fresh config, fresh handle, offer, bounded
    /// gathering wait, offer/answer exchange, remote description applied.
    async fn establish(&self) -> Result<(), CamLinkError> {
        let config = self.resolver.resolve().await;

        // At-most-one-handle: fully release any prior transport before
        // creating the next one.
        self.release_transport().await;

        let transport = self.factory.create(&config).await?;
        let handle_id = Uuid::new_v4();
        {
            let mut inner = self.inner.lock().await;
            if self.state() == SessionState::Closed {
                drop(inner);
                transport.close().await;
                return Err(CamLinkError::SessionClosed(self.key.clone()));
            }
            assert_invariant!(
                inner.transport.is_none(),
                "Prior transport handle is released before a new one is created",
                "session"
            );
            inner.transport = Some(Arc::clone(&transport));
        }
        log::debug!("Session {}: created transport handle {}", self.key, handle_id);

        let offer = transport.create_offer().await?;

        self.transition(SessionState::GatheringCandidates);
        match tokio::time::timeout(self.opts.gathering_timeout, transport.gathering_complete()).await
        {
            Ok(()) => log::debug!("Session {}: candidate gathering complete", self.key),
            Err(_) => log::warn!(
                "Session {}: candidate gathering timed out after {:?}, proceeding with available candidates",
                self.key,
                self.opts.gathering_timeout
            ),
        }

        // The local description picks up candidates gathered since the offer
        // was created.
        let local = transport.local_description().await.unwrap_or(offer);
        if !local.has_ice_credentials() {
            return Err(CamLinkError::NegotiationError(
                "local description is missing ICE credentials".to_string(),
            ));
        }

        self.transition(SessionState::AwaitingAnswer);
        let answer = tokio::time::timeout(
            self.opts.exchange_timeout,
            self.exchange.exchange(&self.endpoint, &local),
        )
        .await
        .map_err(|_| {
            CamLinkError::ExchangeError(format!(
                "no answer from {} within {:?}",
                self.endpoint, self.opts.exchange_timeout
            ))
        })??;

        if !answer.has_ice_credentials() {
            return Err(CamLinkError::NegotiationError(
                "remote description is missing ICE credentials".to_string(),
            ));
        }

        transport.apply_answer(answer).await?;
        Ok(())
    }

    async fn spawn_monitor(&self) {
        let transport = self.inner.lock().await.transport.clone();
        let Some(transport) = transport else {
            return;
        };
        let mut events = transport.connectivity();
        let session = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(state) if state.is_lost() => {
                        session.on_connectivity_lost(state).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!(
                            "Session {}: connectivity monitor lagged by {} events",
                            session.key,
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.monitor.replace(handle) {
            old.abort();
        }
    }

    /// Connectivity loss starts a new attempt cycle after a backoff; the
    /// existing handle is not repaired in place.
    async fn on_connectivity_lost(&self, observed: ConnectivityState) {
        if self.state() != SessionState::Connected {
            return;
        }
        log::warn!(
            "Session {}: connectivity reported {:?}, scheduling reconnect",
            self.key,
            observed
        );
        self.transition(SessionState::Reconnecting);
        let attempt = self.inner.lock().await.attempt;
        let delay = self.opts.retry.next_delay(attempt);
        self.schedule_reconnect(delay).await;
    }

    /// Type-erased wrapper around `connect()`. The boxed `dyn Future + Send`
    /// return type gives callers a concrete `Send` future so the compiler
    /// does not recurse into `connect()`'s opaque future to decide `Send`
    /// across the reconnect spawn boundary.
    fn connect_boxed(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CamLinkError>> + Send + '_>>
    {
        Box::pin(self.connect())
    }

    async fn schedule_reconnect(&self, delay: Duration) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            if session.backoff(delay).await {
                // Route the recursive reconnect through the type-erased
                // `connect_boxed` boundary: this keeps the compiler from
                // having to resolve the auto-trait (Send) of `connect()`'s
                // opaque future by introspecting it within its own defining
                // scope, which it does not support.
                if let Err(e) = session.connect_boxed().await {
                    log::warn!("Session {}: scheduled reconnect failed: {}", session.key, e);
                }
            }
        });
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.pending_timer.replace(handle) {
            old.abort();
        }
    }

    /// Sleep for `delay`, interrupted by `close()`. Returns false when the
    /// session closed during the wait.
    async fn backoff(&self, delay: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = rx.wait_for(|s| *s == SessionState::Closed) => false,
        }
    }

    async fn release_transport(&self) {
        let (transport, monitor) = {
            let mut inner = self.inner.lock().await;
            (inner.transport.take(), inner.monitor.take())
        };
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
    }
}
