use std::fmt;

#[derive(Debug)]
pub enum CamLinkError {
    ConfigError(String),
    NegotiationError(String),
    ExchangeError(String),
    TransportError(String),
    ControlError(String),
    SessionClosed(String),
    RetriesExhausted(String),
}

impl fmt::Display for CamLinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CamLinkError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            CamLinkError::NegotiationError(msg) => write!(f, "Negotiation error: {}", msg),
            CamLinkError::ExchangeError(msg) => write!(f, "Exchange error: {}", msg),
            CamLinkError::TransportError(msg) => write!(f, "Transport error: {}", msg),
            CamLinkError::ControlError(msg) => write!(f, "Control channel error: {}", msg),
            CamLinkError::SessionClosed(msg) => write!(f, "Session closed: {}", msg),
            CamLinkError::RetriesExhausted(msg) => write!(f, "Retries exhausted: {}", msg),
        }
    }
}

impl std::error::Error for CamLinkError {}
