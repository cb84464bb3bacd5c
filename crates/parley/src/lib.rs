//! Parley client library
//!
//! Data-access layer for the parley chat service: time-ordered identifiers,
//! an authenticated HTTP/WebSocket transport, a channel cache, cursor-based
//! history pagination and a live message feed.

pub mod client;
pub mod config;
pub mod error;
pub mod feed;
pub mod history;
pub mod models;
pub mod snowflake;
pub mod store;
pub mod transport;

pub use client::ChatClient;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use feed::{FeedConfig, FeedHandle};
pub use history::{HistoryQuery, MAX_PAGE_SIZE};
pub use models::{Channel, Hydrate, HydrateError, Identified, Message, Status, User};
pub use snowflake::{Epoch, Snowflake};
pub use store::ChannelStore;
pub use transport::Credentials;
