//! Service epoch and identifier-to-time conversion.

use chrono::{DateTime, TimeDelta, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use super::Snowflake;
use crate::transport::Transport;

/// The setup document published by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupDocument {
    /// Service epoch in Unix milliseconds.
    pub epoch: i64,
}

impl SetupDocument {
    pub fn epoch_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.epoch)
    }
}

/// Creation time of `id` relative to `epoch`.
///
/// Returns the Unix epoch when no service epoch is known yet.
pub fn time_of(id: Snowflake, epoch: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let Some(epoch) = epoch else {
        return DateTime::<Utc>::UNIX_EPOCH;
    };
    // elapsed_millis() is at most 2^48, always a valid TimeDelta.
    let elapsed = TimeDelta::milliseconds(id.elapsed_millis() as i64);
    epoch
        .checked_add_signed(elapsed)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Process-wide service epoch. Installed once, by the first successful load.
#[derive(Debug, Default)]
pub struct Epoch {
    value: OnceLock<DateTime<Utc>>,
}

impl Epoch {
    pub fn new() -> Self {
        Self::default()
    }

    /// An epoch that is already known (tests, offline tools).
    pub fn fixed(epoch: DateTime<Utc>) -> Self {
        let value = OnceLock::new();
        let _ = value.set(epoch);
        Self { value }
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.value.get().copied()
    }

    pub fn is_loaded(&self) -> bool {
        self.value.get().is_some()
    }

    /// Install `epoch` unless one is already present; returns the epoch in effect.
    pub fn install(&self, epoch: DateTime<Utc>) -> DateTime<Utc> {
        *self.value.get_or_init(|| epoch)
    }

    pub fn time_of(&self, id: Snowflake) -> DateTime<Utc> {
        time_of(id, self.get())
    }

    /// Fetch the setup document until it succeeds, then install its epoch.
    ///
    /// Transport errors, error statuses and malformed documents are logged and
    /// retried after `retry_delay`, without limit.
    pub async fn load(
        &self,
        transport: &Transport,
        setup_path: &str,
        retry_delay: Duration,
    ) -> DateTime<Utc> {
        if let Some(epoch) = self.get() {
            return epoch;
        }

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match transport.get::<SetupDocument>(setup_path).await {
                Ok(doc) => match doc.epoch_time() {
                    Some(epoch) => {
                        let epoch = self.install(epoch);
                        info!("Loaded service epoch {} after {} attempt(s)", epoch, attempt);
                        return epoch;
                    }
                    None => warn!(
                        "Setup document epoch {} is out of range (attempt {})",
                        doc.epoch, attempt
                    ),
                },
                Err(e) => warn!("Failed to load setup document (attempt {}): {}", attempt, e),
            }
            tokio::time::sleep(retry_delay).await;
        }
    }
}
