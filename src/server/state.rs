use std::sync::Arc;

use dashmap::DashMap;

use crate::config::Config;
use crate::db::{DbPool, DbPooledConnection};
use crate::snapshot::{self, ChannelIndexEntry, SnapshotError};

use super::relay::RelaySessions;

/// Parsed channel indexes cached per snapshot id.
///
/// Snapshot artifacts are immutable once staged, so a parsed index can be
/// reused for the snapshot's whole lifetime. Bounded by clearing on growth;
/// at steady state only the active snapshots' indexes are resident.
const INDEX_CACHE_MAX: usize = 8;

/// Application state for the HTTP read surface.
///
/// Holds the database pool, the runtime configuration, the channel-index
/// cache and the relay session tracker.
#[derive(Clone)]
pub struct AppState {
    pool: DbPool,
    config: Arc<Config>,
    index_cache: Arc<DashMap<String, Arc<Vec<ChannelIndexEntry>>>>,
    sessions: Arc<RelaySessions>,
}

impl AppState {
    pub fn new(pool: DbPool, config: Config) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            index_cache: Arc::new(DashMap::new()),
            sessions: Arc::new(RelaySessions::new()),
        }
    }

    pub fn get_connection(&self) -> Result<DbPooledConnection, r2d2::Error> {
        self.pool.get()
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<RelaySessions> {
        &self.sessions
    }

    /// Load a snapshot's channel index through the cache.
    pub fn channel_index(
        &self,
        snapshot_id: &str,
        index_path: &str,
    ) -> Result<Arc<Vec<ChannelIndexEntry>>, SnapshotError> {
        if let Some(cached) = self.index_cache.get(snapshot_id) {
            return Ok(cached.clone());
        }
        let entries = Arc::new(snapshot::load_channel_index(index_path)?);
        if self.index_cache.len() >= INDEX_CACHE_MAX {
            self.index_cache.clear();
        }
        self.index_cache
            .insert(snapshot_id.to_string(), entries.clone());
        Ok(entries)
    }
}
