//! In-process [`SearchEngine`] holding documents in memory.
//!
//! Useful for embedding the pipeline in tools that only need a local index,
//! and for exercising the pipeline deterministically: every call is journaled,
//! and failures, latency and item rejections can be injected.

use super::{EngineResult, SearchEngine};
use crate::error::EngineError;
use crate::types::{
    Batch, BulkItemResponse, BulkResponse, IndexSettings, ScrollHit, ScrollPage, ScrollRequest,
    SettingsUpdate, WriteAction, SETTING_NUMBER_OF_REPLICAS, SETTING_NUMBER_OF_SHARDS,
};
use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A call received by the engine, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Bulk {
        batch_id: u64,
        actions: usize,
        bytes: usize,
        failed: bool,
    },
    GetSettings(String),
    PutSettings(String, SettingsUpdate),
    ForceMerge(String),
    Refresh(String),
    OpenScroll {
        index: String,
        page_size: usize,
        keep_alive: Duration,
        returned: usize,
    },
    ScrollNext {
        scroll_id: String,
        returned: usize,
    },
    ClearScroll(String),
}

#[derive(Debug, Clone)]
struct StoredDoc {
    doc_type: Option<String>,
    routing: Option<String>,
    source: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
struct MemoryIndex {
    /// Latest state, including unrefreshed writes.
    docs: IndexMap<String, StoredDoc>,
    /// State as of the last refresh; what searches and scrolls see.
    visible: IndexMap<String, StoredDoc>,
    settings: IndexSettings,
}

struct OpenScroll {
    remaining: VecDeque<ScrollHit>,
    page_size: usize,
}

pub struct MemoryEngine {
    indices: DashMap<String, MemoryIndex>,
    scrolls: DashMap<String, OpenScroll>,
    journal: Mutex<Vec<EngineCall>>,
    scripted_bulk_errors: Mutex<VecDeque<EngineError>>,
    rejected_ids: DashMap<String, String>,
    bulk_latency_ms: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    fail_settings_reads: AtomicBool,
    fail_settings_writes: AtomicBool,
    fail_refresh: AtomicBool,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine {
            indices: DashMap::new(),
            scrolls: DashMap::new(),
            journal: Mutex::new(Vec::new()),
            scripted_bulk_errors: Mutex::new(VecDeque::new()),
            rejected_ids: DashMap::new(),
            bulk_latency_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            fail_settings_reads: AtomicBool::new(false),
            fail_settings_writes: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
        }
    }

    /// Settings given to indices created implicitly by a bulk write.
    pub fn default_settings() -> IndexSettings {
        let mut settings = IndexSettings::new();
        settings.insert(SETTING_NUMBER_OF_SHARDS.to_string(), "5".to_string());
        settings.insert(SETTING_NUMBER_OF_REPLICAS.to_string(), "1".to_string());
        settings
    }

    pub fn create_index(&self, index: &str, settings: IndexSettings) {
        self.indices.insert(
            index.to_string(),
            MemoryIndex {
                settings,
                ..Default::default()
            },
        );
    }

    /// Write `source` directly and make it visible, bypassing the journal.
    pub fn seed_document(
        &self,
        index: &str,
        id: &str,
        routing: Option<&str>,
        source: serde_json::Value,
    ) {
        let mut entry = self
            .indices
            .entry(index.to_string())
            .or_insert_with(|| MemoryIndex {
                settings: Self::default_settings(),
                ..Default::default()
            });
        let doc = StoredDoc {
            doc_type: None,
            routing: routing.map(str::to_string),
            source,
        };
        entry.docs.insert(id.to_string(), doc.clone());
        entry.visible.insert(id.to_string(), doc);
    }

    pub fn settings(&self, index: &str) -> Option<IndexSettings> {
        self.indices.get(index).map(|i| i.settings.clone())
    }

    /// Documents written so far, refreshed or not.
    pub fn document_count(&self, index: &str) -> usize {
        self.indices.get(index).map(|i| i.docs.len()).unwrap_or(0)
    }

    /// Documents a search would see right now.
    pub fn searchable_count(&self, index: &str) -> usize {
        self.indices.get(index).map(|i| i.visible.len()).unwrap_or(0)
    }

    pub fn get_document(&self, index: &str, id: &str) -> Option<serde_json::Value> {
        self.indices
            .get(index)
            .and_then(|i| i.docs.get(id).map(|d| d.source.clone()))
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Successful bulk calls as `(actions, bytes)` in arrival order.
    pub fn acknowledged_bulks(&self) -> Vec<(usize, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Bulk {
                    actions,
                    bytes,
                    failed: false,
                    ..
                } => Some((actions, bytes)),
                _ => None,
            })
            .collect()
    }

    pub fn open_scrolls(&self) -> usize {
        self.scrolls.len()
    }

    /// Highest number of bulk requests observed executing at the same time.
    /// Bulk requests currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// The next bulk calls fail with these errors, one per call, in order.
    pub fn script_bulk_errors(&self, errors: impl IntoIterator<Item = EngineError>) {
        if let Ok(mut queue) = self.scripted_bulk_errors.lock() {
            queue.extend(errors);
        }
    }

    /// Make every write to document `id` fail at item level with `reason`.
    pub fn reject_id(&self, id: &str, reason: &str) {
        self.rejected_ids.insert(id.to_string(), reason.to_string());
    }

    pub fn set_bulk_latency(&self, latency: Duration) {
        self.bulk_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_settings_reads(&self, fail: bool) {
        self.fail_settings_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_settings_writes(&self, fail: bool) {
        self.fail_settings_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: EngineCall) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(call);
        }
    }

    fn next_scripted_error(&self) -> Option<EngineError> {
        self.scripted_bulk_errors
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
    }

    fn apply(&self, action: &WriteAction) -> BulkItemResponse {
        let target = action.target();
        let mut item = BulkItemResponse {
            op: action.op_name().to_string(),
            index: target.index.clone(),
            doc_type: target.doc_type.clone(),
            id: target.id.clone(),
            status: 200,
            failure: None,
        };

        if let Some(reason) = self.rejected_ids.get(&target.id) {
            item.status = 409;
            item.failure = Some(reason.value().clone());
            return item;
        }

        let mut index = self
            .indices
            .entry(target.index.clone())
            .or_insert_with(|| MemoryIndex {
                settings: Self::default_settings(),
                ..Default::default()
            });

        match action {
            WriteAction::Index { source, .. } => match serde_json::from_str(source) {
                Ok(value) => {
                    let created = index
                        .docs
                        .insert(
                            target.id.clone(),
                            StoredDoc {
                                doc_type: target.doc_type.clone(),
                                routing: target.routing.clone(),
                                source: value,
                            },
                        )
                        .is_none();
                    item.status = if created { 201 } else { 200 };
                }
                Err(e) => {
                    item.status = 400;
                    item.failure = Some(format!("mapper_parsing_exception: {}", e));
                }
            },
            WriteAction::Delete { .. } => {
                if index.docs.shift_remove(&target.id).is_none() {
                    item.status = 404;
                }
            }
        }
        item
    }
}

fn query_matches(query: &serde_json::Value, id: &str, doc: &StoredDoc) -> Option<bool> {
    if query.get("match_all").is_some() {
        return Some(true);
    }
    if let Some(term) = query.get("term").and_then(|t| t.as_object()) {
        return Some(term.iter().all(|(field, expected)| {
            let expected = expected.get("value").unwrap_or(expected);
            doc.source.get(field) == Some(expected)
        }));
    }
    if let Some(values) = query
        .get("ids")
        .and_then(|i| i.get("values"))
        .and_then(|v| v.as_array())
    {
        return Some(values.iter().any(|v| v.as_str() == Some(id)));
    }
    None
}

/// Releases one in-flight slot, also when the request is cancelled mid-sleep.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SearchEngine for MemoryEngine {
    async fn bulk(&self, batch: &Batch) -> EngineResult<BulkResponse> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let latency = self.bulk_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let scripted = self.next_scripted_error();
        self.record(EngineCall::Bulk {
            batch_id: batch.id(),
            actions: batch.len(),
            bytes: batch.size_in_bytes(),
            failed: scripted.is_some(),
        });

        let result = match scripted {
            Some(e) => Err(e),
            None => Ok(BulkResponse {
                took_ms: latency,
                items: batch.actions().iter().map(|a| self.apply(a)).collect(),
            }),
        };

        result
    }

    async fn get_settings(&self, index: &str) -> EngineResult<IndexSettings> {
        self.record(EngineCall::GetSettings(index.to_string()));
        if self.fail_settings_reads.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("settings read refused".to_string()));
        }
        self.settings(index)
            .ok_or_else(|| EngineError::NotFound(format!("no such index [{}]", index)))
    }

    async fn put_settings(&self, index: &str, settings: &SettingsUpdate) -> EngineResult<()> {
        self.record(EngineCall::PutSettings(index.to_string(), settings.clone()));
        if self.fail_settings_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("settings write refused".to_string()));
        }
        let mut entry = self
            .indices
            .get_mut(index)
            .ok_or_else(|| EngineError::NotFound(format!("no such index [{}]", index)))?;
        for (name, value) in settings {
            match value {
                Some(v) => {
                    entry.settings.insert(name.clone(), v.clone());
                }
                None => {
                    entry.settings.remove(name);
                }
            }
        }
        Ok(())
    }

    async fn force_merge(&self, index: &str) -> EngineResult<()> {
        self.record(EngineCall::ForceMerge(index.to_string()));
        if !self.indices.contains_key(index) {
            return Err(EngineError::NotFound(format!("no such index [{}]", index)));
        }
        Ok(())
    }

    async fn refresh(&self, index: &str) -> EngineResult<()> {
        self.record(EngineCall::Refresh(index.to_string()));
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(EngineError::Status {
                status: 500,
                reason: "refresh failed".to_string(),
            });
        }
        // Refreshing an index nothing was ever written to is a no-op.
        if let Some(mut entry) = self.indices.get_mut(index) {
            let docs = entry.docs.clone();
            entry.visible = docs;
        }
        Ok(())
    }

    async fn open_scroll(&self, request: &ScrollRequest) -> EngineResult<ScrollPage> {
        let hits: VecDeque<ScrollHit> = {
            let index = self.indices.get(&request.index).ok_or_else(|| {
                EngineError::NotFound(format!("no such index [{}]", request.index))
            })?;
            let mut hits = VecDeque::new();
            for (id, doc) in &index.visible {
                match query_matches(&request.query, id, doc) {
                    Some(true) => hits.push_back(ScrollHit {
                        index: request.index.clone(),
                        doc_type: doc.doc_type.clone(),
                        id: id.clone(),
                        routing: doc.routing.clone(),
                    }),
                    Some(false) => {}
                    None => {
                        return Err(EngineError::Status {
                            status: 400,
                            reason: format!("unsupported query: {}", request.query),
                        })
                    }
                }
            }
            hits
        };

        let scroll_id = uuid::Uuid::new_v4().to_string();
        let mut scroll = OpenScroll {
            remaining: hits,
            page_size: request.page_size.max(1),
        };
        let page = take_page(&mut scroll);
        self.record(EngineCall::OpenScroll {
            index: request.index.clone(),
            page_size: request.page_size,
            keep_alive: request.keep_alive,
            returned: page.len(),
        });
        self.scrolls.insert(scroll_id.clone(), scroll);
        Ok(ScrollPage {
            scroll_id,
            hits: page,
        })
    }

    async fn scroll_next(&self, scroll_id: &str, _keep_alive: Duration) -> EngineResult<ScrollPage> {
        let page = {
            let mut scroll = self.scrolls.get_mut(scroll_id).ok_or_else(|| {
                EngineError::NotFound(format!("no search context found for id [{}]", scroll_id))
            })?;
            take_page(&mut scroll)
        };
        self.record(EngineCall::ScrollNext {
            scroll_id: scroll_id.to_string(),
            returned: page.len(),
        });
        Ok(ScrollPage {
            scroll_id: scroll_id.to_string(),
            hits: page,
        })
    }

    async fn clear_scroll(&self, scroll_id: &str) -> EngineResult<()> {
        self.record(EngineCall::ClearScroll(scroll_id.to_string()));
        self.scrolls
            .remove(scroll_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("no search context found for id [{}]", scroll_id)))
    }
}

fn take_page(scroll: &mut OpenScroll) -> Vec<ScrollHit> {
    let n = scroll.page_size.min(scroll.remaining.len());
    scroll.remaining.drain(..n).collect()
}
