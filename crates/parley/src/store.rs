//! Channel cache.
//!
//! An identifier-keyed map of every channel observed so far plus the list of
//! all known channels from the last full query. Writes are upserts
//! (last write wins); nothing is ever evicted. The store is shared by `Arc`
//! with whichever component needs it.

use dashmap::DashMap;
use log::debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::models::Channel;
use crate::snowflake::Snowflake;

#[derive(Debug)]
pub struct ChannelStore {
    /// Channel ID -> latest observed channel
    by_id: DashMap<Snowflake, Arc<Channel>>,

    /// Result of the last full query, ascending by ID
    all: RwLock<Arc<[Arc<Channel>]>>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self {
            by_id: DashMap::new(),
            all: RwLock::new(Arc::from(Vec::<Arc<Channel>>::new())),
        }
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached channel for `id`, if one has been observed.
    pub fn get(&self, id: Snowflake) -> Option<Arc<Channel>> {
        self.by_id.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert or overwrite the cached copy of `channel`.
    pub fn upsert(&self, channel: Channel) -> Arc<Channel> {
        let channel = Arc::new(channel);
        self.by_id.insert(channel.id, Arc::clone(&channel));
        channel
    }

    /// Upsert every channel, sort them by ID and make them the known list.
    ///
    /// Readers see either the previous list or the new one, never a mix.
    pub fn replace_all(&self, channels: Vec<Channel>) -> Arc<[Arc<Channel>]> {
        let mut channels: Vec<Arc<Channel>> =
            channels.into_iter().map(|c| self.upsert(c)).collect();
        channels.sort_by_key(|c| c.id);

        let list: Arc<[Arc<Channel>]> = Arc::from(channels);
        *self.all.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&list);
        debug!("Channel list replaced ({} channels)", list.len());
        list
    }

    /// All channels from the last full query.
    pub fn all(&self) -> Arc<[Arc<Channel>]> {
        self.all.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of cached channels.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    fn channel(id: u64, name: &str) -> Channel {
        Channel {
            id: Snowflake::new(id),
            name: name.to_string(),
            description: String::new(),
            owner: User {
                id: Snowflake::new(1),
                username: "root".to_string(),
                permissions: 0,
            },
        }
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let store = ChannelStore::new();
        assert!(store.is_empty());
        store.upsert(channel(5, "old"));
        store.upsert(channel(5, "new"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(Snowflake::new(5)).unwrap().name, "new");
        assert!(store.get(Snowflake::new(6)).is_none());
    }

    #[test]
    fn test_replace_all_sorts_numerically() {
        let store = ChannelStore::new();
        let list = store.replace_all(vec![channel(100, "c"), channel(9, "a"), channel(20, "b")]);
        let ids: Vec<u64> = list.iter().map(|c| c.id.get()).collect();
        assert_eq!(ids, vec![9, 20, 100]);
        assert_eq!(store.all().len(), 3);
        for c in store.all().iter() {
            assert_eq!(store.get(c.id).unwrap().id, c.id);
        }
    }

    #[test]
    fn test_replace_all_swaps_list_but_keeps_cache() {
        let store = ChannelStore::new();
        store.replace_all(vec![channel(1, "a"), channel(2, "b")]);
        let before = store.all();
        store.replace_all(vec![channel(3, "c")]);

        assert_eq!(before.len(), 2);
        assert_eq!(store.all().len(), 1);
        // Never evicted.
        assert_eq!(store.len(), 3);
        assert!(store.get(Snowflake::new(1)).is_some());
    }
}
