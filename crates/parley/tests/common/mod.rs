//! Test utilities: an in-process fake chat service.
#![allow(dead_code)]

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parley::{ChatClient, ClientConfig, FeedConfig};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Service epoch served by `/setup.json`, in Unix milliseconds.
pub const EPOCH_MS: i64 = 1_600_000_000_000;

/// Milliseconds after the epoch at which seeded messages start.
/// Large enough that every identifier is above 2^53.
pub const SEED_OFFSET_MS: u64 = 1 << 40;

/// Build a snowflake from an offset in milliseconds and a sequence number.
pub fn snowflake(offset_ms: u64, seq: u16) -> u64 {
    (offset_ms << 16) | u64::from(seq)
}

pub fn user_json(id: u64, username: &str) -> Value {
    json!({"id": id, "username": username, "permissions": 1})
}

pub fn channel_json(id: u64, name: &str, owner: &Value) -> Value {
    json!({"id": id, "name": name, "description": format!("about {name}"), "owner": owner})
}

pub fn message_json(id: u64, content: &str, author: &Value, channel: &Value) -> Value {
    json!({"id": id, "content": content, "author": author, "channel": channel})
}

/// One request as seen by the fake service.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
}

impl RecordedRequest {
    /// Decoded query parameters.
    pub fn params(&self) -> HashMap<String, String> {
        self.query
            .as_deref()
            .map(parse_query)
            .unwrap_or_default()
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// What the feed socket does for one connection.
#[derive(Debug, Clone)]
pub struct FeedScript {
    /// Text frames pushed right after the handshake.
    pub frames: Vec<String>,
    /// Close the socket after the frames instead of holding it open.
    pub close: bool,
}

/// A scripted answer to one setup document request.
#[derive(Debug, Clone)]
pub enum SetupReply {
    /// 503, as if the service were still starting.
    Unavailable,
    /// 200 with this raw body.
    Body(String),
}

#[derive(Debug)]
struct Account {
    password: String,
    user: Value,
}

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    tokens: HashMap<String, String>,
    channels: Vec<Value>,
    /// Channel ID -> messages, in insertion order
    messages: HashMap<u64, Vec<Value>>,
    next_seq: u16,
    next_user_id: u64,
    /// Served before the real setup document, front first
    setup_replies: VecDeque<SetupReply>,
    feed_scripts: VecDeque<FeedScript>,
    feed_connections: u32,
    /// Close connections that have no script right after the handshake
    close_unscripted_feeds: bool,
    /// Handshakes accepted before the feed starts answering 503
    feed_accept_limit: Option<u32>,
    requests: Vec<RecordedRequest>,
}

/// Shared state of the fake service.
#[derive(Clone, Default)]
pub struct FakeState {
    inner: Arc<Mutex<Inner>>,
}

impl FakeState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Add an account and return its user record.
    pub fn add_account(&self, username: &str, password: &str) -> Value {
        let mut inner = self.lock();
        inner.next_user_id += 1;
        let user = user_json(snowflake(inner.next_user_id, 0), username);
        inner.accounts.insert(
            username.to_string(),
            Account {
                password: password.to_string(),
                user: user.clone(),
            },
        );
        user
    }

    pub fn add_channel(&self, id: u64, name: &str, owner: &Value) -> Value {
        let channel = channel_json(id, name, owner);
        self.lock().channels.push(channel.clone());
        channel
    }

    /// Seed `count` messages with strictly increasing identifiers.
    pub fn seed_messages(&self, channel: &Value, author: &Value, count: u64) -> Vec<u64> {
        let channel_id = channel["id"].as_u64().unwrap();
        let mut inner = self.lock();
        let mut ids = Vec::new();
        for n in 0..count {
            let id = snowflake(SEED_OFFSET_MS + n, 1);
            let message = message_json(id, &format!("message {n}"), author, channel);
            inner.messages.entry(channel_id).or_default().push(message);
            ids.push(id);
        }
        ids
    }

    /// Make the next `n` setup document requests fail.
    pub fn fail_setup(&self, n: u32) {
        let mut inner = self.lock();
        for _ in 0..n {
            inner.setup_replies.push_back(SetupReply::Unavailable);
        }
    }

    /// Answer one setup document request with `body` and a 200.
    pub fn push_setup_body(&self, body: &str) {
        self.lock()
            .setup_replies
            .push_back(SetupReply::Body(body.to_string()));
    }

    pub fn push_feed_script(&self, frames: Vec<String>, close: bool) {
        self.lock().feed_scripts.push_back(FeedScript { frames, close });
    }

    /// Refuse feed handshakes once `n` connections have been accepted.
    pub fn limit_feed_connections(&self, n: u32) {
        self.lock().feed_accept_limit = Some(n);
    }

    /// Accept unscripted feed handshakes and close them straight away.
    pub fn close_unscripted_feeds(&self) {
        self.lock().close_unscripted_feeds = true;
    }

    pub fn feed_connections(&self) -> u32 {
        self.lock().feed_connections
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Recorded requests whose path equals `path`.
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    fn user_for(&self, headers: &HeaderMap) -> Option<Value> {
        let token = headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?
            .to_string();
        let inner = self.lock();
        let username = inner.tokens.get(&token)?;
        inner.accounts.get(username).map(|a| a.user.clone())
    }

    fn channel(&self, id: u64) -> Option<Value> {
        self.lock()
            .channels
            .iter()
            .find(|c| c["id"].as_u64() == Some(id))
            .cloned()
    }
}

/// A running fake service bound to an ephemeral port.
pub struct FakeServer {
    pub addr: SocketAddr,
    pub state: FakeState,
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Client configuration with short retry delays.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url(),
            request_timeout_secs: 5,
            epoch_retry_ms: 10,
            feed: FeedConfig {
                initial_backoff_ms: 10,
                max_backoff_ms: 50,
                ..FeedConfig::default()
            },
            ..ClientConfig::default()
        }
    }

    pub fn client(&self) -> ChatClient {
        ChatClient::new(self.config()).unwrap()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a fake service with no accounts, channels or messages.
pub async fn fake_server() -> FakeServer {
    let state = FakeState::default();
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeServer {
        addr,
        state,
        handle,
    }
}

fn router(state: FakeState) -> Router {
    Router::new()
        .route("/setup.json", get(setup))
        .route("/auth/token", post(token))
        .route("/auth/@me", get(me))
        .route("/auth/create", post(create_account))
        .route("/channels", get(list_channels).post(create_channel))
        .route("/channels/{id}", get(get_channel))
        .route("/channels/{id}/messages", get(list_messages).post(post_message))
        .route("/channels/{id}/ws", get(feed))
        .layer(middleware::from_fn_with_state(state.clone(), record))
        .with_state(state)
}

async fn record(State(state): State<FakeState>, request: Request, next: Next) -> Response {
    let recorded = RecordedRequest {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        query: request.uri().query().map(str::to_string),
        authorization: request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    state.lock().requests.push(recorded);
    next.run(request).await
}

async fn setup(State(state): State<FakeState>) -> Response {
    match state.lock().setup_replies.pop_front() {
        Some(SetupReply::Unavailable) => {
            (StatusCode::SERVICE_UNAVAILABLE, "starting up").into_response()
        }
        Some(SetupReply::Body(body)) => {
            ([(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        None => Json(json!({"epoch": EPOCH_MS})).into_response(),
    }
}

async fn token(
    State(state): State<FakeState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let username = form.get("username").cloned().unwrap_or_default();
    let password = form.get("password").cloned().unwrap_or_default();
    let mut inner = state.lock();

    let valid = form.get("grant_type").map(String::as_str) == Some("password")
        && inner
            .accounts
            .get(&username)
            .is_some_and(|a| a.password == password);
    if !valid {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Incorrect username or password"})),
        )
            .into_response();
    }

    let token = format!("token-{}-{}", username, inner.tokens.len());
    inner.tokens.insert(token.clone(), username);
    Json(json!({"access_token": token, "token_type": "bearer"})).into_response()
}

async fn me(State(state): State<FakeState>, headers: HeaderMap) -> Response {
    match state.user_for(&headers) {
        Some(user) => Json(user).into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn create_account(State(state): State<FakeState>, headers: HeaderMap) -> Response {
    let field = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let (username, password) = (field("username"), field("password"));

    if username.is_empty() || password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "message": "Username and password required"})),
        )
            .into_response();
    }
    if state.lock().accounts.contains_key(&username) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "message": "Username already taken"})),
        )
            .into_response();
    }
    state.add_account(&username, &password);
    Json(json!({"success": true, "message": "Account created"})).into_response()
}

async fn list_channels(State(state): State<FakeState>) -> Json<Vec<Value>> {
    Json(state.lock().channels.clone())
}

#[derive(Deserialize)]
struct NewChannel {
    name: String,
    description: String,
}

async fn create_channel(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Json(body): Json<NewChannel>,
) -> Response {
    let Some(owner) = state.user_for(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let mut inner = state.lock();
    inner.next_seq += 1;
    let id = snowflake(SEED_OFFSET_MS * 2, inner.next_seq);
    let channel = json!({
        "id": id,
        "name": body.name,
        "description": body.description,
        "owner": owner,
    });
    inner.channels.push(channel.clone());
    Json(channel).into_response()
}

async fn get_channel(State(state): State<FakeState>, Path(id): Path<u64>) -> Response {
    match state.channel(id) {
        Some(channel) => Json(channel).into_response(),
        None => (StatusCode::NOT_FOUND, "channel not found").into_response(),
    }
}

#[derive(Deserialize)]
struct HistoryParams {
    newest: bool,
    before_id: u64,
    after_id: u64,
    limit: usize,
}

/// Inclusive bounds; newest first when `newest`, oldest first otherwise.
async fn list_messages(
    State(state): State<FakeState>,
    Path(id): Path<u64>,
    Query(params): Query<HistoryParams>,
) -> Response {
    if state.channel(id).is_none() {
        return (StatusCode::NOT_FOUND, "channel not found").into_response();
    }
    let inner = state.lock();
    let mut page: Vec<Value> = inner
        .messages
        .get(&id)
        .map(|all| {
            all.iter()
                .filter(|m| {
                    let mid = m["id"].as_u64().unwrap_or_default();
                    mid <= params.before_id && mid >= params.after_id
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    page.sort_by_key(|m| m["id"].as_u64());
    if params.newest {
        page.reverse();
    }
    page.truncate(params.limit);
    Json(page).into_response()
}

#[derive(Deserialize)]
struct NewMessage {
    content: String,
}

async fn post_message(
    State(state): State<FakeState>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(body): Json<NewMessage>,
) -> Response {
    let Some(author) = state.user_for(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(channel) = state.channel(id) else {
        return (StatusCode::NOT_FOUND, "channel not found").into_response();
    };
    let mut inner = state.lock();
    inner.next_seq += 1;
    let message_id = snowflake(SEED_OFFSET_MS * 2, inner.next_seq);
    let message = message_json(message_id, &body.content, &author, &channel);
    inner.messages.entry(id).or_default().push(message.clone());
    Json(message).into_response()
}

async fn feed(
    State(state): State<FakeState>,
    Path(id): Path<u64>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.channel(id).is_none() {
        return (StatusCode::NOT_FOUND, "channel not found").into_response();
    }
    let script = {
        let mut inner = state.lock();
        if inner
            .feed_accept_limit
            .is_some_and(|limit| inner.feed_connections >= limit)
        {
            return (StatusCode::SERVICE_UNAVAILABLE, "feed unavailable").into_response();
        }
        inner.feed_connections += 1;
        inner.feed_scripts.pop_front().or_else(|| {
            inner.close_unscripted_feeds.then(|| FeedScript {
                frames: Vec::new(),
                close: true,
            })
        })
    };
    ws.on_upgrade(move |socket| run_feed_socket(socket, script))
}

async fn run_feed_socket(mut socket: WebSocket, script: Option<FeedScript>) {
    let close = match script {
        Some(script) => {
            for frame in script.frames {
                if socket.send(WsFrame::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            script.close
        }
        None => false,
    };

    if close {
        let _ = socket.send(WsFrame::Close(None)).await;
        return;
    }
    // Hold the connection until the client goes away.
    while let Some(Ok(frame)) = socket.recv().await {
        if matches!(frame, WsFrame::Close(_)) {
            break;
        }
    }
}
