//! Offer/answer exchange with the streaming server
//!
//! WHEP-style signaling: the local SDP offer is POSTed to the stream's
//! endpoint and the response body is the remote answer. Kept behind a trait
//! so session tests run against scripted exchanges.

use crate::errors::CamLinkError;
use crate::transport::SessionDescription;
use async_trait::async_trait;
use std::time::Duration;

/// Exchanges a local session offer for a remote answer.
#[async_trait]
pub trait OfferExchange: Send + Sync {
    async fn exchange(
        &self,
        endpoint: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, CamLinkError>;
}

/// HTTP exchange: `POST <endpoint>` with `Content-Type: application/sdp`.
pub struct HttpOfferExchange {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpOfferExchange {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl OfferExchange for HttpOfferExchange {
    async fn exchange(
        &self,
        endpoint: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, CamLinkError> {
        let response = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .header(reqwest::header::ACCEPT, "application/sdp")
            .body(offer.sdp.clone())
            .send()
            .await
            .map_err(|e| CamLinkError::ExchangeError(format!("POST {} failed: {}", endpoint, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CamLinkError::ExchangeError(format!("reading answer failed: {}", e)))?;

        if !status.is_success() {
            // The server's body is the most useful failure reason we have.
            return Err(CamLinkError::ExchangeError(format!(
                "server returned {}: {}",
                status,
                body.trim()
            )));
        }

        if body.trim().is_empty() {
            return Err(CamLinkError::ExchangeError(
                "server returned an empty answer".to_string(),
            ));
        }

        Ok(SessionDescription::answer(body))
    }
}
