#![forbid(unsafe_code)]
#![allow(dead_code)]

// In-process chat service used by the integration tests.
//
// Speaks the same contract as the real service: JSON auth endpoints issuing
// JWT bearer tokens, a bearer-protected history endpoint, and a broadcast
// WebSocket at /api/ws authenticated through the `access_token|<token>`
// subprotocol.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

const JWT_SECRET: &str = "chatload-test-secret";
const TOKEN_LIFETIME_SECS: u64 = 15 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    exp: usize,
}

#[derive(Deserialize)]
struct CredentialsBody {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

#[derive(Clone, Serialize)]
struct StoredMessage {
    id: i64,
    content: String,
    user_id: i64,
    username: String,
    created_at: i64,
}

struct User {
    id: i64,
    password: String,
}

#[derive(Default)]
struct Inner {
    users: Mutex<HashMap<String, User>>,
    sessions: Mutex<HashSet<String>>,
    history: Mutex<Vec<StoredMessage>>,
    online: Mutex<HashMap<String, usize>>,
    next_id: AtomicI64,
    /// Usernames matching this rule are refused at the WebSocket upgrade
    refuse_ws: Mutex<Option<fn(&str) -> bool>>,
}

#[derive(Clone)]
struct MockState {
    inner: Arc<Inner>,
    hub: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

pub struct MockServer {
    pub base_url: String,
    state: MockState,
}

impl MockServer {
    /// Closes every open WebSocket from the server side.
    pub fn kick_all(&self) {
        let _ = self.state.kick.send(());
    }

    /// Refuse the WebSocket upgrade (403) for every user matching `rule`.
    pub fn refuse_upgrades(&self, rule: fn(&str) -> bool) {
        *self.state.inner.refuse_ws.lock().unwrap() = Some(rule);
    }

    pub fn history_len(&self) -> usize {
        self.state.inner.history.lock().unwrap().len()
    }

    pub fn online(&self) -> Vec<String> {
        self.state.roster()
    }
}

pub async fn spawn_mock() -> MockServer {
    let (hub, _) = broadcast::channel(8192);
    let (kick, _) = broadcast::channel(16);
    let state = MockState {
        inner: Arc::new(Inner::default()),
        hub,
        kick,
    };

    let app = Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/messages/recent", get(recent))
        .route("/api/ws", get(ws_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockServer {
        base_url: format!("http://{addr}"),
        state,
    }
}

/// Bare WebSocket endpoint at /api/ws that accepts any subprotocol, sends
/// `frames` in order, then idles until the client goes away. Returns its URL.
pub async fn spawn_scripted_ws(frames: Vec<String>) -> String {
    let app = Router::new().route(
        "/api/ws",
        get(move |ws: WebSocketUpgrade, headers: HeaderMap| {
            let frames = frames.clone();
            async move {
                let protocol = headers
                    .get(header::SEC_WEBSOCKET_PROTOCOL)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .unwrap_or_default();
                ws.protocols([protocol]).on_upgrade(move |mut socket| async move {
                    for frame in frames {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                    while let Some(Ok(_)) = socket.recv().await {}
                })
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/api/ws")
}

/// True for `load_test_user_<i>_<run>` with an odd `i`.
pub fn odd_load_test_user(username: &str) -> bool {
    username
        .strip_prefix("load_test_user_")
        .and_then(|rest| rest.split('_').next())
        .and_then(|i| i.parse::<usize>().ok())
        .is_some_and(|i| i % 2 == 1)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

impl MockState {
    fn issue_token(&self, user_id: i64, username: &str) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            name: username.to_string(),
            exp: (now_secs() + TOKEN_LIFETIME_SECS) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .unwrap();
        self.inner.sessions.lock().unwrap().insert(token.clone());
        token
    }

    fn validate(&self, token: &str) -> Option<Claims> {
        if !self.inner.sessions.lock().unwrap().contains(token) {
            return None;
        }
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(JWT_SECRET.as_bytes()),
            &Validation::default(),
        )
        .ok()
        .map(|data| data.claims)
    }

    fn bearer(&self, headers: &HeaderMap) -> Option<(String, Claims)> {
        let token = headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?
            .to_string();
        let claims = self.validate(&token)?;
        Some((token, claims))
    }

    fn roster(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.online.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn publish(&self, envelope: serde_json::Value) {
        let _ = self.hub.send(envelope.to_string());
    }

    fn join(&self, username: &str) {
        *self
            .inner
            .online
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_insert(0) += 1;
        self.publish(json!({ "type": "join", "payload": { "username": username } }));
        self.publish(json!({ "type": "users", "payload": self.roster() }));
    }

    fn leave(&self, username: &str) {
        {
            let mut online = self.inner.online.lock().unwrap();
            if let Some(count) = online.get_mut(username) {
                *count -= 1;
                if *count == 0 {
                    online.remove(username);
                }
            }
        }
        self.publish(json!({ "type": "leave", "payload": { "username": username } }));
        self.publish(json!({ "type": "users", "payload": self.roster() }));
    }

    fn chat(&self, claims: &Claims, content: String) {
        let msg = StoredMessage {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            content,
            user_id: claims.sub.parse().unwrap_or(0),
            username: claims.name.clone(),
            created_at: now_secs() as i64,
        };
        self.inner.history.lock().unwrap().push(msg.clone());
        self.publish(json!({
            "type": "chat",
            "payload": {
                "content": msg.content,
                "user_id": msg.user_id,
                "username": msg.username,
                "created_at": msg.created_at,
            }
        }));
    }
}

async fn register(State(state): State<MockState>, Json(body): Json<CredentialsBody>) -> Response {
    if body.username.is_empty() || body.password.is_empty() {
        return (StatusCode::BAD_REQUEST, "username and password required").into_response();
    }
    let id = {
        let mut users = state.inner.users.lock().unwrap();
        if users.contains_key(&body.username) {
            return (StatusCode::CONFLICT, "Username already exists").into_response();
        }
        let id = users.len() as i64 + 1;
        users.insert(
            body.username.clone(),
            User {
                id,
                password: body.password,
            },
        );
        id
    };
    let token = state.issue_token(id, &body.username);
    Json(json!({ "token": token, "username": body.username })).into_response()
}

async fn login(State(state): State<MockState>, Json(body): Json<CredentialsBody>) -> Response {
    let id = {
        let users = state.inner.users.lock().unwrap();
        match users.get(&body.username) {
            Some(user) if user.password == body.password => user.id,
            _ => return (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response(),
        }
    };
    let token = state.issue_token(id, &body.username);
    Json(json!({ "token": token, "username": body.username })).into_response()
}

async fn logout(State(state): State<MockState>, headers: HeaderMap) -> Response {
    match state.bearer(&headers) {
        Some((token, _)) => {
            state.inner.sessions.lock().unwrap().remove(&token);
            Json(json!({ "status": "logged out" })).into_response()
        }
        None => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
    }
}

async fn recent(
    State(state): State<MockState>,
    headers: HeaderMap,
    Query(query): Query<RecentQuery>,
) -> Response {
    if state.bearer(&headers).is_none() {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let history = state.inner.history.lock().unwrap();
    let limit = query.limit.unwrap_or(50).min(history.len());
    let recent: Vec<StoredMessage> = history[history.len() - limit..].to_vec();
    Json(recent).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<MockState>, headers: HeaderMap) -> Response {
    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(',')
                .map(str::trim)
                .find(|p| p.starts_with("access_token|"))
                .map(str::to_string)
        });
    let Some(protocol) = protocol else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    let token = protocol.trim_start_matches("access_token|");
    let Some(claims) = state.validate(token) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    let refused = state.inner.refuse_ws.lock().unwrap().is_some_and(|rule| rule(&claims.name));
    if refused {
        return (StatusCode::FORBIDDEN, "Connection refused").into_response();
    }

    // Subscribe before the upgrade so the session sees its own join
    let rx = state.hub.subscribe();
    let kick = state.kick.subscribe();
    ws.protocols([protocol])
        .on_upgrade(move |socket| session(socket, state, claims, rx, kick))
}

async fn session(
    socket: WebSocket,
    state: MockState,
    claims: Claims,
    mut rx: broadcast::Receiver<String>,
    mut kick: broadcast::Receiver<()>,
) {
    let (mut sink, mut stream) = socket.split();
    state.join(&claims.name);

    let forward = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = kick.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => state.chat(&claims, text.to_string()),
            Message::Close(_) => break,
            _ => {}
        }
    }

    forward.abort();
    state.leave(&claims.name);
}
