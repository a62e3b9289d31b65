#![forbid(unsafe_code)]

use crate::auth::types::{AuthError, AuthResponse, Credentials};
use reqwest::header::AUTHORIZATION;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Obtains bearer credentials for simulated users.
///
/// Holds nothing but the username -> token map. Every request/response
/// exchange takes a permit from a bounded pool so provisioning a few hundred
/// users does not open a few hundred simultaneous HTTP requests.
pub struct CredentialProvider {
    http: reqwest::Client,
    base_url: String,
    tokens: RwLock<HashMap<String, String>>,
    permits: Arc<Semaphore>,
}

impl CredentialProvider {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, max_in_flight: usize) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST /api/auth/register
    pub async fn register(&self, username: &str, password: &str) -> Result<AuthResponse, AuthError> {
        let resp = self.exchange("register", username, password).await?;
        info!("{}: registered", username);
        Ok(resp)
    }

    /// POST /api/auth/login
    pub async fn login(&self, username: &str, password: &str) -> Result<AuthResponse, AuthError> {
        let resp = self.exchange("login", username, password).await?;
        debug!("{}: logged in", username);
        Ok(resp)
    }

    /// POST /api/auth/logout with the user's bearer token.
    ///
    /// Returns false (and keeps the credential) if the service refuses.
    pub async fn logout(&self, username: &str) -> bool {
        let Some(token) = self.token(username) else {
            error!("Logout failed for user {}: no credential on record", username);
            return false;
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        let result = self
            .http
            .post(format!("{}/api/auth/logout", self.base_url))
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                self.forget(username);
                info!("{}: logged out", username);
                true
            }
            Ok(resp) => {
                error!("Logout failed for user {}: status {}", username, resp.status());
                false
            }
            Err(e) => {
                error!("Logout failed for user {}: {}", username, e);
                false
            }
        }
    }

    /// Current credential for `username`, if any.
    pub fn token(&self, username: &str) -> Option<String> {
        let map = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        map.get(username).cloned()
    }

    pub fn is_authenticated(&self, username: &str) -> bool {
        let map = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        map.contains_key(username)
    }

    /// Records a credential obtained out of band.
    pub fn insert_token(&self, username: &str, token: String) {
        let mut map = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        map.insert(username.to_string(), token);
    }

    pub fn forget(&self, username: &str) -> Option<String> {
        let mut map = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        map.remove(username)
    }

    pub fn authenticated_count(&self) -> usize {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn exchange(&self, action: &str, username: &str, password: &str) -> Result<AuthResponse, AuthError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AuthError::PoolClosed)?;

        let body = Credentials {
            username: username.to_string(),
            password: password.to_string(),
        };

        let resp = self
            .http
            .post(format!("{}/api/auth/{action}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("{} failed for user {}: {}", action, username, e);
                AuthError::Http(e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("{} failed for user {}: status {} ({})", action, username, status, body.trim());
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let data: AuthResponse = resp.json().await?;
        self.insert_token(username, data.token.clone());
        Ok(data)
    }
}
