//! Paginated message history.
//!
//! The service returns at most [`MAX_PAGE_SIZE`] messages per request. A
//! [`HistoryQuery`] describes the whole window the caller wants; [`paginate`]
//! walks it page by page. One bound of the window is a cursor that moves past
//! every page consumed, the opposite bound never changes, so the window is
//! never exceeded and no message is requested twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::ClientResult;
use crate::models::{Hydrate, Message};
use crate::snowflake::Snowflake;
use crate::transport::Transport;

/// Largest page the service returns, whatever limit is requested.
pub const MAX_PAGE_SIZE: u32 = 50;

/// Path of a channel's message collection.
pub fn messages_path(channel_id: Snowflake) -> String {
    format!("/channels/{channel_id}/messages")
}

/// The message window a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Walk from `before_id` downwards (true) or from `after_id` upwards (false).
    pub newest: bool,
    /// Upper bound of the window.
    pub before_id: Snowflake,
    /// Lower bound of the window.
    pub after_id: Snowflake,
    /// Total number of messages wanted.
    pub limit: u32,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            newest: true,
            before_id: Snowflake::MAX,
            after_id: Snowflake::MIN,
            limit: MAX_PAGE_SIZE,
        }
    }
}

impl HistoryQuery {
    /// Newest messages first.
    pub fn newest(limit: u32) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Oldest messages first.
    pub fn oldest(limit: u32) -> Self {
        Self {
            newest: false,
            limit,
            ..Self::default()
        }
    }

    pub fn before(mut self, id: Snowflake) -> Self {
        self.before_id = id;
        self
    }

    pub fn after(mut self, id: Snowflake) -> Self {
        self.after_id = id;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

/// Query parameters of a single page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub newest: bool,
    pub before_id: Snowflake,
    pub after_id: Snowflake,
    pub limit: u32,
}

/// Something that can fetch one raw page of a channel's history.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, channel_id: Snowflake, page: &PageRequest)
    -> ClientResult<Vec<Value>>;
}

#[async_trait]
impl PageSource for Transport {
    async fn fetch_page(
        &self,
        channel_id: Snowflake,
        page: &PageRequest,
    ) -> ClientResult<Vec<Value>> {
        self.get_with_query(&messages_path(channel_id), page).await
    }
}

/// Fetch every message in `query`'s window, one bounded page at a time.
///
/// Pages are requested strictly in sequence and appended in the order the
/// service returned them. Pagination ends when the limit is spent, a page
/// comes back empty, or the cursor can no longer move inside the window. Any
/// failure aborts the whole walk; partial results are dropped.
#[instrument(level = "debug", skip(source), fields(pages = tracing::field::Empty))]
pub async fn paginate<S>(
    source: &S,
    channel_id: Snowflake,
    query: HistoryQuery,
) -> ClientResult<Vec<Message>>
where
    S: PageSource + ?Sized,
{
    let HistoryQuery {
        newest,
        before_id,
        after_id,
        mut limit,
    } = query;

    let mut cursor = if newest { before_id } else { after_id };
    let mut result = Vec::new();
    let mut pages: u32 = 0;

    while limit > 0 {
        let size = limit.min(MAX_PAGE_SIZE);
        limit -= size;

        let page = PageRequest {
            newest,
            before_id: if newest { cursor } else { before_id },
            after_id: if newest { after_id } else { cursor },
            limit: size,
        };
        let raw = source.fetch_page(channel_id, &page).await?;
        pages += 1;

        if raw.is_empty() {
            debug!(pages, "empty page, history exhausted");
            break;
        }

        let messages = Message::ensure_all(raw)?;
        let next = advance(newest, &messages);
        result.extend(messages);

        // Past the fixed bound or off the end of the id space: nothing left.
        match next {
            Some(next) if in_window(newest, next, before_id, after_id) => {
                cursor = next;
                debug!(pages, total = result.len(), cursor = %cursor, "page consumed");
            }
            _ => {
                debug!(pages, total = result.len(), "window exhausted");
                break;
            }
        }
    }

    tracing::Span::current().record("pages", pages);
    Ok(result)
}

/// Move the cursor strictly past every message in `page`.
///
/// Walking down, the new upper bound sits one below the oldest message seen;
/// walking up, the new lower bound sits one above the newest. For pages in
/// descending order that is `last - 1` or `first + 1`. `None` when the page is
/// empty or the cursor would leave the id space.
fn advance(newest: bool, page: &[Message]) -> Option<Snowflake> {
    let ids = page.iter().map(|m| m.id);
    if newest {
        ids.min().and_then(Snowflake::checked_pred)
    } else {
        ids.max().and_then(Snowflake::checked_succ)
    }
}

/// Whether a moved cursor still leaves room against the fixed bound.
fn in_window(newest: bool, cursor: Snowflake, before_id: Snowflake, after_id: Snowflake) -> bool {
    if newest {
        cursor >= after_id
    } else {
        cursor <= before_id
    }
}
