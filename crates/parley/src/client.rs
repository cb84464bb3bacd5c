//! High-level chat client.
//!
//! [`ChatClient`] ties the transport, login session, channel cache and
//! service epoch together. It is cheap to clone; clones share all state.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::feed::{self, FeedHandle};
use crate::history::{self, HistoryQuery};
use crate::models::{
    Channel, CreateChannelRequest, CreateMessageRequest, Hydrate, Identified, Message, Status,
    User,
};
use crate::snowflake::{Epoch, Snowflake};
use crate::store::ChannelStore;
use crate::transport::{self, Credentials, Session, Transport};

/// Path of the channel collection.
pub const CHANNELS_PATH: &str = "/channels";

fn channel_path(id: Snowflake) -> String {
    format!("{CHANNELS_PATH}/{id}")
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    transport: Arc<Transport>,
    session: Arc<Session>,
    channels: Arc<ChannelStore>,
    epoch: Arc<Epoch>,
    config: Arc<ClientConfig>,
}

impl ChatClient {
    /// Create a client with a fresh channel cache and an unloaded epoch.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        Self::with_parts(config, Arc::new(ChannelStore::new()), Arc::new(Epoch::new()))
    }

    /// Create a client around an existing channel cache and epoch.
    pub fn with_parts(
        config: ClientConfig,
        channels: Arc<ChannelStore>,
        epoch: Arc<Epoch>,
    ) -> ClientResult<Self> {
        let transport = Transport::new(
            &config.base_url,
            config.ws_url.as_deref(),
            config.request_timeout(),
        )?;
        debug!(
            "Chat client for {} (feed {})",
            transport.base_url(),
            transport.ws_base_url()
        );

        Ok(Self {
            transport: Arc::new(transport),
            session: Arc::new(Session::new()),
            channels,
            epoch,
            config: Arc::new(config),
        })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn channels(&self) -> &Arc<ChannelStore> {
        &self.channels
    }

    pub fn epoch(&self) -> &Arc<Epoch> {
        &self.epoch
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    pub async fn login(&self, credentials: Credentials) -> ClientResult<User> {
        self.session.login(&self.transport, credentials).await
    }

    pub async fn relogin(&self) -> ClientResult<User> {
        self.session.relogin(&self.transport).await
    }

    pub async fn logout(&self) {
        self.session.logout(&self.transport).await;
        info!("Logged out");
    }

    pub async fn current_user(&self) -> Option<User> {
        self.session.current_user().await
    }

    pub async fn register(&self, username: &str, password: &str) -> Status {
        transport::register(&self.transport, username, password).await
    }

    // ------------------------------------------------------------------
    // Epoch
    // ------------------------------------------------------------------

    /// Fetch the setup document until it succeeds and install the epoch.
    pub async fn load_epoch(&self) -> DateTime<Utc> {
        self.epoch
            .load(
                &self.transport,
                &self.config.setup_path,
                self.config.epoch_retry_delay(),
            )
            .await
    }

    /// Run [`ChatClient::load_epoch`] on a background task.
    pub fn spawn_epoch_loader(&self) -> JoinHandle<DateTime<Utc>> {
        let client = self.clone();
        tokio::spawn(async move { client.load_epoch().await })
    }

    /// Creation time of `entity`, or the Unix epoch while the service epoch
    /// is still unknown.
    pub fn created_at<T: Identified>(&self, entity: &T) -> DateTime<Utc> {
        entity.created_at(&self.epoch)
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Fetch every channel, refresh the cache and return them sorted by ID.
    pub async fn query_channels(&self) -> ClientResult<Arc<[Arc<Channel>]>> {
        let raw: Vec<Value> = self.transport.get(CHANNELS_PATH).await?;
        let channels = Channel::ensure_all(raw)?;
        Ok(self.channels.replace_all(channels))
    }

    /// Fetch one channel from the service and cache it.
    pub async fn fetch_channel(&self, id: Snowflake) -> ClientResult<Arc<Channel>> {
        let raw: Value = self.transport.get(&channel_path(id)).await?;
        Ok(self.channels.upsert(Channel::ensure(raw)?))
    }

    /// Cached channel, without touching the network.
    pub fn get_channel(&self, id: Snowflake) -> Option<Arc<Channel>> {
        self.channels.get(id)
    }

    /// Create a channel. The result is not cached until the next query.
    pub async fn create_channel(&self, name: &str, description: &str) -> ClientResult<Channel> {
        let body = CreateChannelRequest {
            name: name.to_string(),
            description: description.to_string(),
        };
        let raw: Value = self.transport.post_json(CHANNELS_PATH, &body).await?;
        let channel = Channel::ensure(raw)?;
        info!("Created channel {} ({})", channel.name, channel.id);
        Ok(channel)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn send_message(
        &self,
        channel_id: Snowflake,
        content: &str,
    ) -> ClientResult<Message> {
        let body = CreateMessageRequest {
            content: content.to_string(),
        };
        let raw: Value = self
            .transport
            .post_json(&history::messages_path(channel_id), &body)
            .await?;
        Ok(Message::ensure(raw)?)
    }

    /// Fetch a window of a channel's history.
    pub async fn history(
        &self,
        channel_id: Snowflake,
        query: HistoryQuery,
    ) -> ClientResult<Vec<Message>> {
        history::paginate(&*self.transport, channel_id, query).await
    }

    /// Deliver new messages in `channel_id` to `handler` until closed.
    pub async fn subscribe<F>(&self, channel_id: Snowflake, handler: F) -> ClientResult<FeedHandle>
    where
        F: FnMut(Message) + Send + 'static,
    {
        feed::subscribe(
            Arc::clone(&self.transport),
            channel_id,
            self.config.feed.clone(),
            handler,
        )
        .await
    }
}
