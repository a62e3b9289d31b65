#![forbid(unsafe_code)]

use crate::auth::AuthError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the load-testing harness.
///
/// Per-operation failures (connect, send, delivery) are normally absorbed into
/// the metrics counters by the sampler; they surface as values of this type so
/// callers can log them. `NotAuthenticated` and `Config` are contract
/// violations and are the only variants the orchestrator treats as hard errors.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("User {0} not authenticated")]
    NotAuthenticated(String),

    #[error("WebSocket connection failed for {0}")]
    ConnectFailed(String),

    #[error("Failed to send message from {0}")]
    SendFailed(String),

    #[error("Message {id} not received by {receiver} within {window:?}")]
    DeliveryTimeout {
        id: String,
        receiver: String,
        window: Duration,
    },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
