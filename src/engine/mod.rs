//! The search engine as seen from the write path.
//!
//! Everything the bulk pipeline needs from the engine goes through
//! [`SearchEngine`]: bulk writes, settings, refresh, force-merge and scroll.
//! `batter-http` implements it over REST; [`memory::MemoryEngine`] implements
//! it in-process.

pub mod memory;

use crate::error::EngineError;
use crate::types::{Batch, BulkResponse, IndexSettings, ScrollPage, ScrollRequest, SettingsUpdate};
use async_trait::async_trait;
use std::time::Duration;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Execute every action of `batch` as one bulk request.
    ///
    /// An `Ok` response may still contain item-level failures. An `Err` means
    /// the request as a whole was not applied.
    async fn bulk(&self, batch: &Batch) -> EngineResult<BulkResponse>;

    async fn get_settings(&self, index: &str) -> EngineResult<IndexSettings>;

    /// Apply all entries of `settings` in a single update.
    async fn put_settings(&self, index: &str, settings: &SettingsUpdate) -> EngineResult<()>;

    /// Merge the index's segments. May take a long time.
    async fn force_merge(&self, index: &str) -> EngineResult<()>;

    /// Make every write acknowledged so far visible to searches.
    async fn refresh(&self, index: &str) -> EngineResult<()>;

    async fn open_scroll(&self, request: &ScrollRequest) -> EngineResult<ScrollPage>;

    async fn scroll_next(&self, scroll_id: &str, keep_alive: Duration) -> EngineResult<ScrollPage>;

    async fn clear_scroll(&self, scroll_id: &str) -> EngineResult<()>;
}
