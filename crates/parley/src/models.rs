//! Chat entities and their hydration from wire records.
//!
//! The service sends loosely-typed JSON. [`Hydrate::ensure`] is the single
//! place where a raw record becomes a typed entity: nested users and channels
//! are decoded recursively, identifiers keep full 64-bit precision, and any
//! missing or mistyped field surfaces as a [`HydrateError`] naming the entity.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::snowflake::{Epoch, Snowflake};

/// A wire record that failed to decode.
#[derive(Debug, Error)]
#[error("Failed to decode {entity}: {source}")]
pub struct HydrateError {
    pub entity: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// Typed reconstruction of an entity from a raw JSON record.
pub trait Hydrate: DeserializeOwned {
    /// Entity name used in decode errors.
    const KIND: &'static str;

    fn ensure(raw: Value) -> Result<Self, HydrateError> {
        serde_json::from_value(raw).map_err(|source| HydrateError {
            entity: Self::KIND,
            source,
        })
    }

    /// Hydrate every record, failing on the first bad one.
    fn ensure_all(raw: Vec<Value>) -> Result<Vec<Self>, HydrateError> {
        raw.into_iter().map(Self::ensure).collect()
    }
}

/// Entities addressed by a [`Snowflake`].
pub trait Identified {
    fn id(&self) -> Snowflake;

    /// Creation time derived from the identifier.
    fn created_at(&self, epoch: &Epoch) -> DateTime<Utc> {
        epoch.time_of(self.id())
    }
}

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    /// Permission bitmask.
    pub permissions: u64,
}

impl User {
    pub fn has_permissions(&self, mask: u64) -> bool {
        self.permissions & mask == mask
    }
}

/// A chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Snowflake,
    pub name: String,
    pub description: String,
    pub owner: User,
}

/// A message posted to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Snowflake,
    pub content: String,
    pub author: User,
    pub channel: Channel,
}

/// Acknowledgement returned by account operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub success: bool,
    pub message: String,
}

impl Status {
    pub fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
        }
    }
}

impl Hydrate for User {
    const KIND: &'static str = "user";
}

impl Hydrate for Channel {
    const KIND: &'static str = "channel";
}

impl Hydrate for Message {
    const KIND: &'static str = "message";
}

impl Hydrate for Status {
    const KIND: &'static str = "status";
}

impl Identified for User {
    fn id(&self) -> Snowflake {
        self.id
    }
}

impl Identified for Channel {
    fn id(&self) -> Snowflake {
        self.id
    }
}

impl Identified for Message {
    fn id(&self) -> Snowflake {
        self.id
    }
}

/// Body of `POST /channels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    pub description: String,
}

/// Body of `POST /channels/{id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
}
