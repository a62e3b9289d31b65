#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    /// The service answered with a non-success status (duplicate username,
    /// bad password, missing or stale bearer token).
    #[error("Authentication rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Credential request pool closed")]
    PoolClosed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AuthError {
    /// True when the service itself refused the request, as opposed to a
    /// transport problem reaching it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AuthError::Rejected { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Body of `/api/auth/register` and `/api/auth/login`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub username: String,
}
