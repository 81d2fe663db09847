//! # Batter
//!
//! Bulk writes into a search engine index: documents are grouped into
//! size-bounded batches, sent with bounded concurrency, retried with
//! exponential backoff when the engine pushes back, and made searchable with
//! a single refresh when the load is over.
//!
//! A [`BulkSession`] declares an [`Intent`]. A regular session is meant for
//! a limited number of documents on a live index. A large session is meant
//! for populating an index from scratch: replicas and periodic refresh are
//! turned off while it runs, the index is force-merged afterwards and its
//! original settings are put back.
//!
//! The engine sits behind the [`SearchEngine`] trait. [`MemoryEngine`] keeps
//! everything in process; the companion `batter-http` crate talks to an
//! Elasticsearch-compatible REST API.
//!
//! ## Quick start
//!
//! ```rust
//! use batter::{BulkSession, Intent, MemoryEngine, WriteAction};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> batter::Result<()> {
//! let engine = Arc::new(MemoryEngine::new());
//! engine.create_index("issues", MemoryEngine::default_settings());
//! let mut session = BulkSession::open(engine.clone(), "issues", Intent::Regular).await?;
//!
//! session
//!     .submit(WriteAction::index("issues", "AX-1", &json!({"rule": "S1234"})))
//!     .await?;
//! session.submit_delete_by_query(json!({"term": {"rule": "S42"}})).await?;
//!
//! let summary = session.close().await?;
//! assert_eq!(summary.processed, 1);
//! assert_eq!(engine.searchable_count("issues"), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`BulkConfig::from_env`] reads `BATTER_FLUSH_BYTES`,
//! `BATTER_DRAIN_TIMEOUT_SECS`, `BATTER_PROGRESS_INTERVAL_SECS`,
//! `BATTER_BACKOFF_INITIAL_MS` and `BATTER_BACKOFF_MAX_MS`.

pub mod bulk;
pub mod engine;
pub mod error;
pub mod types;

pub use bulk::{
    BackoffPolicy, BulkConfig, BulkSession, BulkSessionBuilder, BulkSummary, FixedParallelism,
    HostParallelism, Intent, Parallelism, SessionState,
};
pub use engine::memory::MemoryEngine;
pub use engine::{EngineResult, SearchEngine};
pub use error::{BatterError, EngineError, Result, SessionPhase};
pub use types::*;
