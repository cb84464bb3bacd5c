//! Live feed of new messages for one channel.
//!
//! A background task holds the channel's WebSocket, turns each text frame
//! into a [`Message`] and hands it to the subscriber's handler in arrival
//! order. Frames that do not decode are logged and skipped. When the socket
//! drops, the task reconnects with full-jitter exponential backoff unless
//! reconnection is disabled.

use futures::StreamExt;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{ClientError, ClientResult};
use crate::models::{Hydrate, Message};
use crate::snowflake::Snowflake;
use crate::transport::{FeedSocket, Transport};

/// WebSocket path of a channel's feed.
pub fn feed_path(channel_id: Snowflake) -> String {
    format!("/channels/{channel_id}/ws")
}

/// Reconnection policy for the live feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Reconnect after the socket drops.
    pub reconnect: bool,
    /// Upper bound of the first reconnect delay, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Ceiling for the reconnect delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Consecutive failed connects before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl FeedConfig {
    /// Upper bound of the delay before reconnect attempt `attempt` (0-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Full jitter: uniform in `[0, backoff_ceiling(attempt)]`.
    pub fn backoff_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rng.random_range(0..=ceiling))
    }

    /// Whether a finished connection counts as healthy enough to reset the
    /// backoff: it delivered at least one message or stayed up for the
    /// longest backoff delay.
    pub fn is_stable(&self, delivered: usize, uptime: Duration) -> bool {
        delivered > 0 || uptime >= Duration::from_millis(self.max_backoff_ms)
    }
}

/// Decode one feed frame into a message.
pub fn decode_frame(channel_id: Snowflake, text: &str) -> ClientResult<Message> {
    let raw: Value = serde_json::from_str(text).map_err(|source| ClientError::Parse {
        path: feed_path(channel_id),
        source,
    })?;
    Ok(Message::ensure(raw)?)
}

/// Handle to a running feed subscription.
///
/// The feed lives as long as its handle: dropping the handle stops the task
/// and closes the socket, just like [`FeedHandle::close`].
#[derive(Debug)]
pub struct FeedHandle {
    channel_id: Snowflake,
    cancel: CancellationToken,
    task: JoinHandle<ClientResult<()>>,
    _guard: DropGuard,
}

impl FeedHandle {
    pub fn channel_id(&self) -> Snowflake {
        self.channel_id
    }

    /// Stop delivering messages and close the socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the feed task to end.
    ///
    /// Returns the connect error that made it give up, if any.
    pub async fn join(self) -> ClientResult<()> {
        let Self { task, _guard, .. } = self;
        task.await?
    }

    /// Close the feed and wait for the task to end.
    pub async fn shutdown(self) -> ClientResult<()> {
        self.close();
        self.join().await
    }
}

/// Open the feed for `channel_id` and deliver messages to `handler`.
///
/// The first connect happens before this returns so that an unreachable
/// service or a rejected token is reported to the caller directly.
pub async fn subscribe<F>(
    transport: Arc<Transport>,
    channel_id: Snowflake,
    config: FeedConfig,
    handler: F,
) -> ClientResult<FeedHandle>
where
    F: FnMut(Message) + Send + 'static,
{
    let socket = transport.connect_websocket(&feed_path(channel_id)).await?;
    info!("Feed connected for channel {}", channel_id);

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let task = tokio::spawn(run_feed(
        transport,
        channel_id,
        config,
        socket,
        cancel.clone(),
        handler,
    ));

    Ok(FeedHandle {
        channel_id,
        cancel,
        task,
        _guard,
    })
}

enum PumpEnd {
    Cancelled,
    Closed,
    Failed(ClientError),
}

async fn run_feed<F>(
    transport: Arc<Transport>,
    channel_id: Snowflake,
    config: FeedConfig,
    socket: FeedSocket,
    cancel: CancellationToken,
    mut handler: F,
) -> ClientResult<()>
where
    F: FnMut(Message) + Send + 'static,
{
    let path = feed_path(channel_id);
    let mut socket = Some(socket);
    // Grows with every reconnect; only a stable connection resets it.
    let mut backoff_step: u32 = 0;
    // Consecutive failed connects, checked against `max_attempts`.
    let mut failures: u32 = 0;

    loop {
        if let Some(connected) = socket.take() {
            let started = Instant::now();
            let mut delivered = 0;
            match pump(connected, channel_id, &cancel, &mut delivered, &mut handler).await {
                PumpEnd::Cancelled => return Ok(()),
                PumpEnd::Closed => info!("Feed for channel {} closed by server", channel_id),
                PumpEnd::Failed(e) => warn!("Feed for channel {} dropped: {}", channel_id, e),
            }
            if !config.reconnect {
                return Ok(());
            }
            if config.is_stable(delivered, started.elapsed()) {
                backoff_step = 0;
            }
        }

        let delay = config.backoff_delay(backoff_step, &mut rand::rng());
        backoff_step = backoff_step.saturating_add(1);
        debug!(
            "Reconnecting feed for channel {} in {:?} (step {})",
            channel_id, delay, backoff_step
        );
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }

        let connected = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = transport.connect_websocket(&path) => result,
        };
        match connected {
            Ok(s) => {
                info!("Feed reconnected for channel {}", channel_id);
                failures = 0;
                socket = Some(s);
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(
                    "Feed reconnect for channel {} failed (attempt {}): {}",
                    channel_id, failures, e
                );
                if config.max_attempts.is_some_and(|max| failures >= max) {
                    return Err(e);
                }
            }
        }
    }
}

/// Read frames until the socket ends, counting delivered messages.
async fn pump<F>(
    mut socket: FeedSocket,
    channel_id: Snowflake,
    cancel: &CancellationToken,
    delivered: &mut usize,
    handler: &mut F,
) -> PumpEnd
where
    F: FnMut(Message),
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => None,
            frame = socket.next() => Some(frame),
        };
        let Some(frame) = frame else {
            if let Err(e) = socket.close(None).await {
                debug!("Error closing feed socket: {}", e);
            }
            return PumpEnd::Cancelled;
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                *delivered += usize::from(deliver(channel_id, text.as_str(), handler));
            }
            Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => *delivered += usize::from(deliver(channel_id, text, handler)),
                Err(_) => debug!("Ignoring non-UTF-8 binary frame on channel {}", channel_id),
            },
            Some(Ok(WsMessage::Close(_))) | None => return PumpEnd::Closed,
            Some(Ok(_)) => {}
            Some(Err(e)) => return PumpEnd::Failed(e.into()),
        }
    }
}

fn deliver<F: FnMut(Message)>(channel_id: Snowflake, text: &str, handler: &mut F) -> bool {
    match decode_frame(channel_id, text) {
        Ok(message) => {
            handler(message);
            true
        }
        Err(e) => {
            warn!("Skipping undecodable frame on channel {}: {}", channel_id, e);
            false
        }
    }
}
