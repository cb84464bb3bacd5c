//! Transport layer: authenticated HTTP, the feed WebSocket, and login.

mod auth;
mod client;

pub use auth::{
    AccountToken, Credentials, ME_PATH, REGISTER_PATH, Session, TOKEN_PATH, register,
};
pub use client::{FeedSocket, Transport};
