//! Session registry
//!
//! Owns the set of active peer sessions keyed by stream. Every mutation of
//! the key -> session map goes through one async mutex, so UI switch
//! handlers, connectivity callbacks, and teardown can never race the
//! at-most-one-session-per-key invariant away.

use crate::assert_invariant;
use crate::ice::{ClientProfile, IceConfigResolver};
use crate::session::{PeerSession, SessionOptions};
use crate::signaling::OfferExchange;
use crate::transport::TransportFactory;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Inter-start delays when several streams are loaded together. Purely a
/// local resource-contention measure, never a correctness requirement.
#[derive(Debug, Clone)]
pub struct StaggerPolicy {
    pub desktop: Duration,
    pub mobile: Duration,
}

impl Default for StaggerPolicy {
    fn default() -> Self {
        Self {
            desktop: Duration::from_millis(500),
            mobile: Duration::from_millis(2_000),
        }
    }
}

impl StaggerPolicy {
    pub fn delay(&self, profile: ClientProfile) -> Duration {
        match profile {
            ClientProfile::Desktop => self.desktop,
            ClientProfile::Mobile => self.mobile,
        }
    }
}

/// Registry of active peer sessions, at most one per key.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, PeerSession>>>,
    opts: SessionOptions,
    stagger: StaggerPolicy,
    resolver: Arc<IceConfigResolver>,
    factory: Arc<dyn TransportFactory>,
    exchange: Arc<dyn OfferExchange>,
}

impl SessionRegistry {
    pub fn new(
        opts: SessionOptions,
        resolver: Arc<IceConfigResolver>,
        factory: Arc<dyn TransportFactory>,
        exchange: Arc<dyn OfferExchange>,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            opts,
            stagger: StaggerPolicy::default(),
            resolver,
            factory,
            exchange,
        }
    }

    pub fn with_stagger(mut self, stagger: StaggerPolicy) -> Self {
        self.stagger = stagger;
        self
    }

    /// Wire a registry from file configuration: HTTP offer exchange, ICE
    /// resolution with the configured fallback, per-profile timeouts.
    pub fn from_config(
        config: &crate::config::CamLinkConfig,
        profile: ClientProfile,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let opts = SessionOptions::from_config(&config.session, profile);
        let resolver = Arc::new(
            IceConfigResolver::new(config.ice.config_url.clone(), profile)
                .with_fallback(config.ice.fallback_servers()),
        );
        let exchange = Arc::new(crate::signaling::HttpOfferExchange::new(
            opts.exchange_timeout,
        ));
        let stagger = StaggerPolicy {
            desktop: Duration::from_millis(config.session.stagger_delay_desktop_ms),
            mobile: Duration::from_millis(config.session.stagger_delay_mobile_ms),
        };
        Self::new(opts, resolver, factory, exchange).with_stagger(stagger)
    }

    /// Ensure a fresh session exists for `key` and start connecting it.
    ///
    /// Any prior session under the key is closed first, even across rapid UI
    /// switches, so the key never owns two live transport handles. The
    /// connect cycle runs in the background; callers observe progress via
    /// `PeerSession::observe`.
    pub async fn ensure(&self, key: &str, endpoint: &str) -> PeerSession {
        let mut sessions = self.sessions.lock().await;

        if let Some(prior) = sessions.remove(key) {
            log::info!("Registry: replacing session for {}", key);
            prior.close().await;
        }
        assert_invariant!(
            !sessions.contains_key(key),
            "At most one live session per stream key",
            "registry"
        );

        let session = PeerSession::new(
            key,
            endpoint,
            self.opts.clone(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.factory),
            Arc::clone(&self.exchange),
        );
        sessions.insert(key.to_string(), session.clone());

        let connecting = session.clone();
        tokio::spawn(async move {
            if let Err(e) = connecting.connect().await {
                log::warn!("Registry: session {} did not connect: {}", connecting.key(), e);
            }
        });

        session
    }

    /// Ensure sessions for several streams, staggering the starts by the
    /// profile's inter-start delay (mobile waits longer between starts).
    pub async fn ensure_many(&self, streams: &[(&str, &str)]) -> Vec<PeerSession> {
        let delay = self.stagger.delay(self.resolver.profile());
        let mut sessions = Vec::with_capacity(streams.len());
        for (index, (key, endpoint)) in streams.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            sessions.push(self.ensure(key, endpoint).await);
        }
        sessions
    }

    /// Look up the live session for `key`, pruning it if it was closed
    /// behind the registry's back.
    pub async fn get(&self, key: &str) -> Option<PeerSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(key) {
            if session.state() == crate::session::SessionState::Closed {
                sessions.remove(key);
                return None;
            }
            return Some(session.clone());
        }
        None
    }

    pub async fn keys(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Close and remove the session for `key`, if any.
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.sessions.lock().await.remove(key);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every registered session and empty the map. Called on page
    /// teardown and when the top-level stream source switches, so no
    /// orphaned transport handle keeps network or hardware resources alive.
    pub async fn close_all(&self) {
        let drained: Vec<(String, PeerSession)> =
            self.sessions.lock().await.drain().collect();
        for (key, session) in drained {
            log::info!("Registry: closing session {}", key);
            session.close().await;
        }
    }
}
