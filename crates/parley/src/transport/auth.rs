//! Password-grant login and account registration.

use log::{debug, info, warn};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::RwLock;

use super::Transport;
use crate::error::{ClientError, ClientResult};
use crate::models::{Hydrate, Status, User};

/// Token endpoint (OAuth2 password grant).
pub const TOKEN_PATH: &str = "/auth/token";

/// Endpoint returning the authenticated user.
pub const ME_PATH: &str = "/auth/@me";

/// Account registration endpoint.
pub const REGISTER_PATH: &str = "/auth/create";

/// Username and password for the password grant.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token issued by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountToken {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    grant_type: &'static str,
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Default)]
struct SessionState {
    credentials: Option<Credentials>,
    user: Option<User>,
}

/// Locally held login state: remembered credentials and the current user.
///
/// The bearer token itself lives in the [`Transport`] so that every request
/// can pick it up.
#[derive(Debug, Default)]
pub struct Session {
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchange `credentials` for a bearer token and fetch the current user.
    ///
    /// Any failure clears the token, remembered credentials and user before
    /// returning [`ClientError::Authentication`].
    pub async fn login(
        &self,
        transport: &Transport,
        credentials: Credentials,
    ) -> ClientResult<User> {
        match Self::exchange(transport, &credentials).await {
            Ok(user) => {
                info!("Logged in as {}", user.username);
                let mut state = self.state.write().await;
                state.credentials = Some(credentials);
                state.user = Some(user.clone());
                Ok(user)
            }
            Err(e) => {
                warn!("Login failed for {}: {}", credentials.username, e);
                self.logout(transport).await;
                Err(ClientError::Authentication(e.to_string()))
            }
        }
    }

    /// Repeat the password grant with the remembered credentials.
    pub async fn relogin(&self, transport: &Transport) -> ClientResult<User> {
        let credentials = self.state.read().await.credentials.clone();
        match credentials {
            Some(credentials) => self.login(transport, credentials).await,
            None => Err(ClientError::Authentication(
                "no stored credentials".to_string(),
            )),
        }
    }

    async fn exchange(transport: &Transport, credentials: &Credentials) -> ClientResult<User> {
        let grant = PasswordGrant {
            grant_type: "password",
            username: &credentials.username,
            password: &credentials.password,
        };
        let token: AccountToken = transport.post_form(TOKEN_PATH, &grant).await?;
        if !token.token_type.eq_ignore_ascii_case("bearer") {
            debug!("Unexpected token type {:?}, using it as bearer", token.token_type);
        }
        transport.set_token(token.access_token).await;

        let raw: Value = transport.get(ME_PATH).await?;
        Ok(User::ensure(raw)?)
    }

    /// Drop the token, remembered credentials and current user.
    pub async fn logout(&self, transport: &Transport) {
        transport.clear_token().await;
        let mut state = self.state.write().await;
        state.credentials = None;
        state.user = None;
    }

    pub async fn current_user(&self) -> Option<User> {
        self.state.read().await.user.clone()
    }

    pub async fn is_logged_in(&self) -> bool {
        self.state.read().await.user.is_some()
    }
}

/// Register a new account.
///
/// The service reports the outcome as a [`Status`] body on both success and
/// failure responses. A connection failure is reported the same way.
pub async fn register(transport: &Transport, username: &str, password: &str) -> Status {
    let builder = transport
        .request(Method::POST, REGISTER_PATH)
        .await
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Username", username)
        .header("Password", password);

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Registration request failed: {}", e);
            return Status::new(false, "Connection error");
        }
    };

    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read registration response: {}", e);
            return Status::new(false, "Connection error");
        }
    };

    match serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|raw| Status::ensure(raw).ok())
    {
        Some(result) => result,
        None => Status::new(false, format!("Unexpected response ({status})")),
    }
}
