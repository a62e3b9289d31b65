#![forbid(unsafe_code)]

pub mod provider;
pub mod types;

pub use provider::CredentialProvider;
pub use types::{AuthError, AuthResponse, Credentials};
