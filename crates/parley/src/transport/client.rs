//! Authenticated HTTP and WebSocket transport.

use log::debug;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{ClientError, ClientResult};

/// A connected feed socket.
pub type FeedSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// HTTP/WebSocket transport for the chat service.
///
/// Holds the bearer token. When a token is present it is attached to every
/// request and to the WebSocket handshake; without one, requests go out
/// unauthenticated and the service decides.
pub struct Transport {
    /// HTTP client.
    client: Client,
    /// Base URL for HTTP requests (e.g., "http://localhost:8000").
    base_url: String,
    /// Base URL for WebSocket connections (e.g., "ws://localhost:8000").
    ws_url: String,
    /// Bearer token from the last successful login.
    token: RwLock<Option<String>>,
}

impl Transport {
    /// Create a transport for `base_url`.
    ///
    /// `ws_url` defaults to `base_url` with its scheme switched to `ws`/`wss`.
    pub fn new(base_url: &str, ws_url: Option<&str>, timeout: Duration) -> ClientResult<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidUrl(format!(
                "base URL must use http or https: {base_url}"
            )));
        }

        let ws_url = match ws_url {
            Some(url) => {
                let url = url.trim_end_matches('/').to_string();
                if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                    return Err(ClientError::InvalidUrl(format!(
                        "WebSocket URL must use ws or wss: {url}"
                    )));
                }
                url
            }
            None => derive_ws_url(&base_url),
        };

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            ws_url,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn ws_base_url(&self) -> &str {
        &self.ws_url
    }

    /// Absolute HTTP URL for `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Absolute WebSocket URL for `path`.
    pub fn ws_url(&self, path: &str) -> String {
        format!("{}{}", self.ws_url, path)
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    pub async fn clear_token(&self) {
        *self.token.write().await = None;
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Start a request to `path`, with the bearer token attached when present.
    pub async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match self.token.read().await.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// `GET path` and parse the JSON body.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let builder = self.request(Method::GET, path).await;
        self.send(Method::GET, path, builder).await
    }

    /// `GET path?query` and parse the JSON body.
    pub async fn get_with_query<T, Q>(&self, path: &str, query: &Q) -> ClientResult<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let builder = self.request(Method::GET, path).await.query(query);
        self.send(Method::GET, path, builder).await
    }

    /// `POST path` with a JSON body.
    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> ClientResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let builder = self.request(Method::POST, path).await.json(body);
        self.send(Method::POST, path, builder).await
    }

    /// `POST path` with an `application/x-www-form-urlencoded` body.
    pub async fn post_form<T, F>(&self, path: &str, form: &F) -> ClientResult<T>
    where
        T: DeserializeOwned,
        F: Serialize + ?Sized,
    {
        let builder = self.request(Method::POST, path).await.form(form);
        self.send(Method::POST, path, builder).await
    }

    /// Send a prepared request and parse a success response.
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        builder: RequestBuilder,
    ) -> ClientResult<T> {
        debug!("{} {}", method, path);
        let response = builder.send().await?;
        self.handle_response(method, path, response).await
    }

    /// Handle response and parse JSON or error.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        response: Response,
    ) -> ClientResult<T> {
        let status = response.status();
        // Read as text so integers are parsed by serde_json, never via f64.
        let body = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|source| ClientError::Parse {
                path: path.to_string(),
                source,
            })
        } else {
            Err(ClientError::Status {
                method,
                path: path.to_string(),
                status,
                body,
            })
        }
    }

    /// Open a WebSocket to `path`, authenticated like HTTP requests.
    pub async fn connect_websocket(&self, path: &str) -> ClientResult<FeedSocket> {
        let url = self.ws_url(path);
        let mut request = url.as_str().into_client_request()?;

        if let Some(token) = self.token().await {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                ClientError::Authentication(format!("token is not a valid header value: {e}"))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!("Connecting WebSocket {}", url);
        let (socket, _response) = connect_async(request).await?;
        Ok(socket)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("base_url", &self.base_url)
            .field("ws_url", &self.ws_url)
            .finish_non_exhaustive()
    }
}

fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}
