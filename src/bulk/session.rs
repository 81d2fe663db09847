//! One bulk load against one index, from open to close.

use super::config::BulkConfig;
use super::dispatcher::BatchDispatcher;
use super::progress::ProgressReporter;
use super::scroll::ScrollDeleter;
use super::settings_guard::SettingsGuard;
use super::sizing::{HostParallelism, Intent, Parallelism, SizingPlan};
use crate::engine::SearchEngine;
use crate::error::{BatterError, Result};
use crate::types::{ItemFailure, WriteAction};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// What a closed session did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkSummary {
    pub index: String,
    pub intent: Intent,
    /// Actions the engine acknowledged, including ones it rejected.
    pub processed: u64,
    pub failed_items: u64,
    /// Batches abandoned after a non-transient error.
    pub failed_batches: u64,
    pub batches: u64,
    pub bytes: u64,
    /// First rejected actions, in the order they were reported.
    pub failures: Vec<ItemFailure>,
    pub elapsed: Duration,
    /// Set when the original index settings could not be put back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_restore_error: Option<String>,
}

impl BulkSummary {
    /// Every action landed and the index is back to its own settings.
    pub fn is_clean(&self) -> bool {
        self.failed_items == 0 && self.failed_batches == 0 && self.settings_restore_error.is_none()
    }
}

pub struct BulkSessionBuilder {
    engine: Arc<dyn SearchEngine>,
    index: String,
    intent: Intent,
    config: BulkConfig,
    parallelism: Arc<dyn Parallelism>,
}

impl BulkSessionBuilder {
    pub fn intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    pub fn config(mut self, config: BulkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn parallelism(mut self, parallelism: Arc<dyn Parallelism>) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Start the session. A large session relaxes the index settings before
    /// returning.
    ///
    /// # Errors
    ///
    /// [`BatterError::SettingsRead`] or [`BatterError::SettingsUpdate`] when
    /// the settings cannot be relaxed; no document has been sent then.
    pub async fn open(self) -> Result<BulkSession> {
        let plan = SizingPlan::select(self.intent, self.parallelism.available_cores());
        let dispatcher = BatchDispatcher::new(
            Arc::clone(&self.engine),
            self.index.clone(),
            plan.concurrency,
            &self.config,
        );

        let mut session = BulkSession {
            engine: self.engine,
            index: self.index,
            plan,
            config: self.config,
            state: SessionState::Created,
            dispatcher,
            guard: None,
            progress: None,
            progress_ticks: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        };
        session.start().await?;
        Ok(session)
    }
}

/// Collects writes for one index, sends them in size-bounded batches and
/// leaves the index searchable when closed.
///
/// A regular session sends one batch at a time from the submitting task and
/// never touches index settings. A large session sends batches in the
/// background, disables replicas and periodic refresh while it runs and
/// reports progress.
pub struct BulkSession {
    engine: Arc<dyn SearchEngine>,
    index: String,
    plan: SizingPlan,
    config: BulkConfig,
    state: SessionState,
    dispatcher: BatchDispatcher,
    guard: Option<SettingsGuard>,
    progress: Option<ProgressReporter>,
    progress_ticks: Arc<AtomicU64>,
    started: Instant,
}

impl BulkSession {
    pub fn builder(engine: Arc<dyn SearchEngine>, index: impl Into<String>) -> BulkSessionBuilder {
        BulkSessionBuilder {
            engine,
            index: index.into(),
            intent: Intent::default(),
            config: BulkConfig::default(),
            parallelism: Arc::new(HostParallelism),
        }
    }

    /// Open a session with default tunables and the host's core count.
    pub async fn open(
        engine: Arc<dyn SearchEngine>,
        index: impl Into<String>,
        intent: Intent,
    ) -> Result<BulkSession> {
        Self::builder(engine, index).intent(intent).open().await
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn plan(&self) -> &SizingPlan {
        &self.plan
    }

    /// Actions acknowledged by the engine so far.
    pub fn processed(&self) -> u64 {
        self.dispatcher.stats().processed()
    }

    /// Progress lines logged so far; stays 0 for sessions that do not report.
    pub fn progress_ticks(&self) -> u64 {
        self.progress_ticks.load(Ordering::Relaxed)
    }

    async fn start(&mut self) -> Result<()> {
        if self.plan.relax_settings {
            let mut guard = SettingsGuard::new(Arc::clone(&self.engine), self.index.clone());
            guard.on_session_start().await?;
            self.guard = Some(guard);
        }
        if self.plan.report_progress {
            let progress = ProgressReporter::start(
                format!("Progress[BulkIndexer[{}]]", self.index),
                "requests",
                self.dispatcher.stats().processed_counter(),
                self.config.progress_interval,
            );
            self.progress_ticks = progress.tick_counter();
            self.progress = Some(progress);
        }
        self.state = SessionState::Started;
        tracing::info!(
            "[BULK {}] session started: intent={}, concurrency={}",
            self.index,
            self.plan.intent,
            self.plan.concurrency
        );
        Ok(())
    }

    fn ensure_started(&self) -> Result<()> {
        if self.state == SessionState::Started {
            Ok(())
        } else {
            Err(BatterError::SessionClosed {
                index: self.index.clone(),
            })
        }
    }

    /// Queue one write. May wait while the engine catches up.
    ///
    /// # Errors
    ///
    /// [`BatterError::SessionClosed`] once the session is closing or closed.
    /// Engine failures are not reported here; they show up in the summary.
    pub async fn submit(&mut self, action: WriteAction) -> Result<()> {
        self.ensure_started()?;
        self.dispatcher.submit(action).await;
        Ok(())
    }

    /// Queue a delete for every document of the session's index matching
    /// `query`, as seen at the last refresh. Returns how many were queued.
    ///
    /// # Errors
    ///
    /// [`BatterError::SessionClosed`] once closing, [`BatterError::Scroll`]
    /// if the scan fails part way. Deletes queued before a scan failure stay
    /// queued.
    pub async fn submit_delete_by_query(&mut self, query: serde_json::Value) -> Result<u64> {
        self.ensure_started()?;
        ScrollDeleter::new(self.engine.as_ref(), &self.index)
            .run(query, &mut self.dispatcher)
            .await
    }

    /// Send what is left, wait for every batch, refresh the index and put
    /// its settings back.
    ///
    /// # Errors
    ///
    /// - [`BatterError::SessionClosed`] if already closed.
    /// - [`BatterError::DrainTimeout`] if batches were still executing after
    ///   the drain timeout. They are cancelled, the index is not refreshed
    ///   and relaxed settings are left in place.
    /// - [`BatterError::Refresh`] if the final refresh failed. Settings are
    ///   still restored first.
    ///
    /// A failed settings restore is not an error; it is reported in
    /// [`BulkSummary::settings_restore_error`].
    pub async fn close(&mut self) -> Result<BulkSummary> {
        self.ensure_started()?;
        self.state = SessionState::Stopping;

        let drained =
            tokio::time::timeout(self.config.drain_timeout, self.dispatcher.flush_and_drain()).await;
        if drained.is_err() {
            let cancelled = self.dispatcher.abort_in_flight();
            tracing::error!(
                "[BULK {}] {} bulk request(s) still executing after {:?}, cancelled",
                self.index,
                cancelled,
                self.config.drain_timeout
            );
            self.alert_relaxed_settings();
            if let Some(progress) = self.progress.take() {
                progress.stop().await;
            }
            self.state = SessionState::Stopped;
            return Err(BatterError::DrainTimeout {
                index: self.index.clone(),
                waited_secs: self.config.drain_timeout.as_secs(),
            });
        }

        let refreshed = self.engine.refresh(&self.index).await;

        let settings_restore_error = match &mut self.guard {
            Some(guard) => guard.on_session_stop().await.err().map(|e| e.to_string()),
            None => None,
        };

        if let Some(progress) = self.progress.take() {
            progress.stop().await;
        }
        self.state = SessionState::Stopped;

        refreshed.map_err(|e| BatterError::Refresh {
            index: self.index.clone(),
            reason: e.to_string(),
        })?;

        let stats = self.dispatcher.stats();
        let summary = BulkSummary {
            index: self.index.clone(),
            intent: self.plan.intent,
            processed: stats.processed(),
            failed_items: stats.failed_items(),
            failed_batches: stats.failed_batches(),
            batches: stats.batches(),
            bytes: stats.bytes(),
            failures: stats.failures(),
            elapsed: self.started.elapsed(),
            settings_restore_error,
        };
        tracing::info!(
            "[BULK {}] session closed: {} processed, {} failed item(s), {} failed batch(es) in {:?}",
            self.index,
            summary.processed,
            summary.failed_items,
            summary.failed_batches,
            summary.elapsed
        );
        Ok(summary)
    }

    /// Operator message while the index still carries relaxed settings.
    fn relaxed_settings_alert(&self) -> Option<String> {
        let snapshot = self.guard.as_ref()?.snapshot()?;
        Some(format!(
            "ALERT: index {} left with bulk load settings, set {:?} manually",
            self.index,
            snapshot.as_update()
        ))
    }

    fn alert_relaxed_settings(&self) {
        if let Some(alert) = self.relaxed_settings_alert() {
            eprintln!("{}", alert);
        }
    }

    /// Delete every document of `index` matching `query` in a regular
    /// session of its own.
    pub async fn delete_by_query(
        engine: Arc<dyn SearchEngine>,
        index: impl Into<String>,
        query: serde_json::Value,
    ) -> Result<BulkSummary> {
        let mut session = BulkSession::open(engine, index, Intent::Regular).await?;
        let scanned = session.submit_delete_by_query(query).await;
        let closed = session.close().await;
        scanned?;
        closed
    }
}

impl Drop for BulkSession {
    fn drop(&mut self) {
        if self.state == SessionState::Started {
            tracing::warn!(
                "[BULK {}] session dropped without close: {} pending bytes discarded, {} batch(es) cancelled",
                self.index,
                self.dispatcher.pending_bytes(),
                self.dispatcher.in_flight()
            );
            self.alert_relaxed_settings();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::sizing::FixedParallelism;
    use crate::engine::memory::{EngineCall, MemoryEngine};
    use serde_json::json;

    fn engine_with_index() -> Arc<MemoryEngine> {
        let engine = Arc::new(MemoryEngine::new());
        engine.create_index("issues", MemoryEngine::default_settings());
        engine
    }

    #[tokio::test]
    async fn test_regular_session_lifecycle() {
        let engine = engine_with_index();
        let mut session = BulkSession::open(engine.clone(), "issues", Intent::Regular)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Started);

        for i in 0..3 {
            session
                .submit(WriteAction::index("issues", format!("AX-{}", i), &json!({"i": i})))
                .await
                .unwrap();
        }
        let summary = session.close().await.unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.batches, 1);
        assert!(summary.is_clean());
        assert_eq!(engine.searchable_count("issues"), 3);
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::GetSettings(_) | EngineCall::PutSettings(..))));
    }

    #[tokio::test]
    async fn test_submit_after_close_is_rejected() {
        let engine = engine_with_index();
        let mut session = BulkSession::open(engine.clone(), "issues", Intent::Regular)
            .await
            .unwrap();
        session.close().await.unwrap();

        let err = session
            .submit(WriteAction::delete("issues", "AX-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BatterError::SessionClosed { .. }));
        assert!(matches!(
            session.close().await,
            Err(BatterError::SessionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_session_still_refreshes() {
        let engine = engine_with_index();
        let mut session = BulkSession::open(engine.clone(), "issues", Intent::Regular)
            .await
            .unwrap();
        let summary = session.close().await.unwrap();

        assert_eq!(summary.processed, 0);
        assert_eq!(engine.calls(), vec![EngineCall::Refresh("issues".to_string())]);
    }

    #[tokio::test]
    async fn test_large_session_plan_follows_cores() {
        let engine = engine_with_index();
        let mut session = BulkSession::builder(engine.clone(), "issues")
            .intent(Intent::Large)
            .parallelism(Arc::new(FixedParallelism(20)))
            .open()
            .await
            .unwrap();
        assert_eq!(session.plan().concurrency, 3);
        assert!(session.plan().relax_settings);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_failure_still_restores_settings() {
        let engine = engine_with_index();
        let before = engine.settings("issues").unwrap();
        engine.set_fail_refresh(true);

        let mut session = BulkSession::builder(engine.clone(), "issues")
            .intent(Intent::Large)
            .parallelism(Arc::new(FixedParallelism(4)))
            .open()
            .await
            .unwrap();
        let err = session.close().await.unwrap_err();

        assert!(matches!(err, BatterError::Refresh { .. }));
        assert_eq!(err.phase(), crate::error::SessionPhase::Stop);
        assert_eq!(engine.settings("issues").unwrap(), before);
    }

    #[tokio::test]
    async fn test_summary_serializes_for_reporting() {
        let engine = engine_with_index();
        let mut session = BulkSession::open(engine.clone(), "issues", Intent::Regular)
            .await
            .unwrap();
        session
            .submit(WriteAction::index("issues", "AX-1", &json!({})))
            .await
            .unwrap();
        let summary = session.close().await.unwrap();

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["intent"], "regular");
        assert_eq!(value["processed"], 1);
        assert!(value.get("settings_restore_error").is_none());
    }

    #[tokio::test]
    async fn test_dropped_large_session_names_settings_to_restore() {
        let engine = engine_with_index();
        let mut session = BulkSession::builder(engine.clone(), "issues")
            .intent(Intent::Large)
            .parallelism(Arc::new(FixedParallelism(4)))
            .open()
            .await
            .unwrap();
        session
            .submit(WriteAction::index("issues", "AX-1", &json!({})))
            .await
            .unwrap();

        let alert = session.relaxed_settings_alert().unwrap();
        assert!(alert.starts_with("ALERT: index issues left with bulk load settings"));
        assert!(alert.contains(crate::types::SETTING_NUMBER_OF_REPLICAS));
        drop(session);

        assert_eq!(
            engine.settings("issues").unwrap()[crate::types::SETTING_NUMBER_OF_REPLICAS],
            "0"
        );
    }

    #[tokio::test]
    async fn test_closed_session_has_nothing_to_alert() {
        let engine = engine_with_index();
        let mut session = BulkSession::builder(engine.clone(), "issues")
            .intent(Intent::Large)
            .parallelism(Arc::new(FixedParallelism(4)))
            .open()
            .await
            .unwrap();
        session.close().await.unwrap();

        assert!(session.relaxed_settings_alert().is_none());
    }
}
