#![forbid(unsafe_code)]

// Client registry - the active simulated clients of one run, keyed by username

use crate::auth::CredentialProvider;
use crate::client::SimulatedClient;
use crate::error::HarnessError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Creates, tracks and tears down simulated clients.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, Arc<SimulatedClient>>>>,
    provider: Arc<CredentialProvider>,
    ws_url: String,
    connect_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(provider: Arc<CredentialProvider>, ws_url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            provider,
            ws_url: ws_url.into(),
            connect_timeout,
        }
    }

    /// Builds a client for `username`, registers it and connects it. The
    /// listen task is only started when the connect succeeded.
    ///
    /// The client is returned whether or not it connected; check
    /// `is_connected`. Fails only when no credential is on record.
    pub async fn setup(&self, username: &str) -> Result<Arc<SimulatedClient>, HarnessError> {
        let token = self
            .provider
            .token(username)
            .ok_or_else(|| HarnessError::NotAuthenticated(username.to_string()))?;

        let client = Arc::new(SimulatedClient::new(username, self.ws_url.as_str(), token, self.connect_timeout));

        let replaced = {
            let mut map = self.clients.write().unwrap_or_else(|e| e.into_inner());
            map.insert(username.to_string(), Arc::clone(&client))
        };
        if let Some(old) = replaced {
            warn!("{}: replacing existing client", username);
            old.disconnect().await;
        }

        if client.connect().await {
            client.spawn_listener();
        }
        Ok(client)
    }

    pub fn get(&self, username: &str) -> Option<Arc<SimulatedClient>> {
        let map = self.clients.read().unwrap_or_else(|e| e.into_inner());
        map.get(username).cloned()
    }

    /// Disconnects and forgets one client. Returns false if it was not tracked.
    pub async fn remove(&self, username: &str) -> bool {
        let removed = {
            let mut map = self.clients.write().unwrap_or_else(|e| e.into_inner());
            map.remove(username)
        };
        match removed {
            Some(client) => {
                client.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Disconnects every tracked client and clears the registry.
    ///
    /// Safe for never-connected or already-disconnected clients, and safe to
    /// call again on an empty registry.
    pub async fn teardown_all(&self) {
        let drained: Vec<Arc<SimulatedClient>> = {
            let mut map = self.clients.write().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, client)| client).collect()
        };
        if drained.is_empty() {
            debug!("Teardown: no clients tracked");
            return;
        }

        let count = drained.len();
        let mut tasks = JoinSet::new();
        for client in drained {
            tasks.spawn(async move { client.disconnect().await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Teardown task failed: {}", e);
            }
        }
        info!("Teardown: disconnected {} clients", count);
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connected_count(&self) -> usize {
        let map = self.clients.read().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|c| c.is_connected()).count()
    }

    pub fn usernames(&self) -> Vec<String> {
        let map = self.clients.read().unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }
}
