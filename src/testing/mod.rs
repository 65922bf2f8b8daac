//! Testing utilities for CamLink
//!
//! Offline test doubles: synthetic session descriptions plus scriptable
//! transport, exchange, and control-socket mocks, so lifecycle behavior can
//! be exercised without a network.

pub mod mocks;
pub mod synthetic_sdp;

pub use mocks::{
    DialScript, ExchangeScript, MockControlLink, MockControlTransport, MockMediaTransport,
    MockOfferExchange, MockTransportFactory,
};
pub use synthetic_sdp::{synthetic_answer, synthetic_offer, synthetic_sdp};
