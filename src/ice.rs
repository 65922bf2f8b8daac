//! ICE transport configuration resolution
//!
//! Builds the relay/reflexive server configuration used for each connection
//! attempt. Operator-supplied TURN servers are fetched from a configured
//! endpoint and merged ahead of a static STUN fallback; any failure along the
//! way degrades to the fallback list, so `resolve()` never fails.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ICE server descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceTransportPolicy {
    All,
    Relay,
}

/// Bundle policy for the transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

/// Client profile the viewer runs on. Mobile clients trade connection setup
/// latency for traversal success (relay-biased gathering, longer waits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientProfile {
    Desktop,
    Mobile,
}

/// Immutable transport configuration, produced fresh per connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Relay servers first, to bias negotiation toward them
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub ice_candidate_pool_size: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_stun_fallback(),
            ice_transport_policy: IceTransportPolicy::All,
            bundle_policy: BundlePolicy::MaxBundle,
            ice_candidate_pool_size: 10,
        }
    }
}

/// Static reflexive-only fallback, usable even when the TURN endpoint is
/// unreachable.
pub fn default_stun_fallback() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
        IceServer::stun("stun:stun2.l.google.com:19302"),
    ]
}

// Wire shape of the operator TURN endpoint. `urls` arrives as a string or an
// array of strings depending on the deployment.
#[derive(Debug, Deserialize)]
struct IceConfigPayload {
    #[serde(rename = "iceServers")]
    ice_servers: Option<Vec<IceServerPayload>>,
}

#[derive(Debug, Deserialize)]
struct IceServerPayload {
    urls: Option<UrlsField>,
    username: Option<String>,
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UrlsField {
    One(String),
    Many(Vec<String>),
}

impl IceServerPayload {
    fn into_server(self) -> Option<IceServer> {
        let urls = match self.urls? {
            UrlsField::One(url) => vec![url],
            UrlsField::Many(urls) => urls,
        };
        let urls: Vec<String> = urls.into_iter().filter(|u| !u.is_empty()).collect();
        if urls.is_empty() {
            return None;
        }
        Some(IceServer {
            urls,
            username: self.username,
            credential: self.credential,
        })
    }
}

fn parse_ice_payload(payload: IceConfigPayload) -> Vec<IceServer> {
    payload
        .ice_servers
        .unwrap_or_default()
        .into_iter()
        .filter_map(IceServerPayload::into_server)
        .collect()
}

/// Resolves the transport configuration for each connection attempt.
pub struct IceConfigResolver {
    client: reqwest::Client,
    config_url: Option<String>,
    profile: ClientProfile,
    fetch_timeout: Duration,
    fallback: Vec<IceServer>,
}

impl IceConfigResolver {
    pub fn new(config_url: Option<String>, profile: ClientProfile) -> Self {
        Self {
            client: reqwest::Client::new(),
            config_url,
            profile,
            fetch_timeout: Duration::from_secs(5),
            fallback: default_stun_fallback(),
        }
    }

    /// Override the static fallback list (e.g. self-hosted STUN).
    pub fn with_fallback(mut self, fallback: Vec<IceServer>) -> Self {
        if !fallback.is_empty() {
            self.fallback = fallback;
        }
        self
    }

    pub fn profile(&self) -> ClientProfile {
        self.profile
    }

    /// Build a fresh transport configuration. Never fails: any fetch or
    /// parse problem degrades to the static fallback list.
    pub async fn resolve(&self) -> TransportConfig {
        let mut servers = Vec::new();

        if let Some(url) = &self.config_url {
            match self.fetch_servers(url).await {
                Ok(fetched) if !fetched.is_empty() => {
                    if fetched.iter().any(IceServer::is_relay) {
                        log::info!("TURN servers loaded from {} ({} entries)", url, fetched.len());
                    } else {
                        log::warn!(
                            "ICE config from {} has no TURN servers; traversal across networks may fail",
                            url
                        );
                    }
                    servers.extend(fetched);
                }
                Ok(_) => {
                    log::warn!("ICE config from {} was empty, using STUN fallback only", url);
                }
                Err(e) => {
                    log::warn!("Failed to load ICE config from {}: {}; using STUN fallback", url, e);
                }
            }
        }

        // Relay servers stay in front; the fallback is appended, not merged in.
        servers.extend(self.fallback.clone());

        let has_relay = servers.iter().any(IceServer::is_relay);
        let (policy, pool_size) = match self.profile {
            ClientProfile::Mobile if has_relay => (IceTransportPolicy::Relay, 16),
            ClientProfile::Mobile => {
                log::warn!("Mobile profile without relay servers; keeping non-relay gathering");
                (IceTransportPolicy::All, 16)
            }
            ClientProfile::Desktop => (IceTransportPolicy::All, 10),
        };

        TransportConfig {
            ice_servers: servers,
            ice_transport_policy: policy,
            bundle_policy: BundlePolicy::MaxBundle,
            ice_candidate_pool_size: pool_size,
        }
    }

    async fn fetch_servers(&self, url: &str) -> Result<Vec<IceServer>, String> {
        let response = self
            .client
            .get(url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("unexpected status {}", response.status()));
        }

        let payload: IceConfigPayload = response
            .json()
            .await
            .map_err(|e| format!("malformed payload: {}", e))?;

        Ok(parse_ice_payload(payload))
    }
}
