//! Delete-by-query: scan matching documents with a scroll cursor and feed
//! one delete per hit into the session's dispatcher.

use super::dispatcher::BatchDispatcher;
use crate::engine::SearchEngine;
use crate::error::{BatterError, Result};
use crate::types::{ScrollHit, ScrollRequest, WriteAction};
use std::time::Duration;

/// Hits fetched per scroll page.
pub const SCROLL_PAGE_SIZE: usize = 100;
/// How long the engine keeps the cursor alive between fetches.
pub const SCROLL_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

/// Scan request for a delete: storage order, no document bodies.
pub fn delete_scan_request(index: &str, query: serde_json::Value) -> ScrollRequest {
    ScrollRequest {
        index: index.to_string(),
        query,
        page_size: SCROLL_PAGE_SIZE,
        keep_alive: SCROLL_KEEP_ALIVE,
        sort: vec!["_doc".to_string()],
        fetch_source: false,
    }
}

/// Delete addressed exactly like the hit, routing included.
fn delete_for(hit: ScrollHit) -> WriteAction {
    let mut action = WriteAction::delete(hit.index, hit.id);
    if let Some(doc_type) = hit.doc_type {
        action = action.with_type(doc_type);
    }
    if let Some(routing) = hit.routing {
        action = action.with_routing(routing);
    }
    action
}

pub struct ScrollDeleter<'a> {
    engine: &'a dyn SearchEngine,
    index: &'a str,
}

impl<'a> ScrollDeleter<'a> {
    pub fn new(engine: &'a dyn SearchEngine, index: &'a str) -> Self {
        ScrollDeleter { engine, index }
    }

    /// Scan every document matching `query` and submit a delete for each.
    ///
    /// Returns once the scan is exhausted and the cursor released; the
    /// deletes themselves may still be in flight. Returns how many were
    /// submitted.
    ///
    /// # Errors
    ///
    /// [`BatterError::Scroll`] if the scan cannot be opened or continued.
    /// Deletes submitted before the failure stay submitted.
    pub async fn run(
        &self,
        query: serde_json::Value,
        dispatcher: &mut BatchDispatcher,
    ) -> Result<u64> {
        let request = delete_scan_request(self.index, query);
        let mut page = self
            .engine
            .open_scroll(&request)
            .await
            .map_err(|e| self.scroll_error(e))?;

        let mut pages = 0u64;
        let mut submitted = 0u64;
        while !page.hits.is_empty() {
            pages += 1;
            let scroll_id = page.scroll_id;
            for hit in page.hits {
                dispatcher.submit(delete_for(hit)).await;
                submitted += 1;
            }
            tracing::debug!(
                "[SCROLL {}] page {} scanned, {} deletes submitted so far",
                self.index,
                pages,
                submitted
            );

            page = match self.engine.scroll_next(&scroll_id, SCROLL_KEEP_ALIVE).await {
                Ok(next) => next,
                Err(e) => {
                    self.release(&scroll_id).await;
                    return Err(self.scroll_error(e));
                }
            };
        }

        self.release(&page.scroll_id).await;
        tracing::info!(
            "[SCROLL {}] scan complete: {} deletes submitted from {} page(s)",
            self.index,
            submitted,
            pages
        );
        Ok(submitted)
    }

    /// Free the cursor. Failure only costs server memory until keep-alive
    /// expires, so it is logged and swallowed.
    async fn release(&self, scroll_id: &str) {
        if let Err(e) = self.engine.clear_scroll(scroll_id).await {
            tracing::warn!(
                "[SCROLL {}] fail to clear scroll {}: {}",
                self.index,
                scroll_id,
                e
            );
        }
    }

    fn scroll_error(&self, e: crate::error::EngineError) -> BatterError {
        BatterError::Scroll {
            index: self.index.to_string(),
            reason: e.to_string(),
        }
    }
}
