//! Error handling module for the gateway
//!
//! One error enum covers the tool proxy, agents and workflows so callers can
//! map any failure to an HTTP status or a retry decision.

mod error;

pub use error::{GatewayError, GuardianErrorKind, Result};
