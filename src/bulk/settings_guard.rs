//! Relaxes an index's replica and refresh settings for the length of a
//! large load, then puts them back.
//!
//! The guard captures the exact prior values, not defaults, so settings an
//! operator configured by hand survive the load. Callers must not run two
//! large sessions against the same index at the same time: the second would
//! capture the first one's relaxed values as its restore point.

use crate::engine::SearchEngine;
use crate::error::{BatterError, Result};
use crate::types::{
    IndexSettings, SettingsUpdate, SETTING_NUMBER_OF_REPLICAS, SETTING_REFRESH_INTERVAL,
};
use std::sync::Arc;

/// Refresh interval value that turns periodic refresh off.
pub const REFRESH_DISABLED: &str = "-1";

/// Prior values of the settings a guard touched. A `None` value records a
/// setting that was not explicitly set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsSnapshot {
    values: SettingsUpdate,
}

impl SettingsSnapshot {
    /// Prior value of `name`: `None` if the guard did not touch it,
    /// `Some(None)` if it touched it but it was unset.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.values.get(name).map(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_update(&self) -> &SettingsUpdate {
        &self.values
    }
}

/// Compute what to remember and what to apply for a bulk load.
fn relax(current: &IndexSettings) -> std::result::Result<(SettingsSnapshot, SettingsUpdate), String> {
    let replicas_raw = current
        .get(SETTING_NUMBER_OF_REPLICAS)
        .ok_or_else(|| format!("setting {} is missing", SETTING_NUMBER_OF_REPLICAS))?;
    let replicas: u32 = replicas_raw.parse().map_err(|_| {
        format!(
            "setting {} is not a number: {}",
            SETTING_NUMBER_OF_REPLICAS, replicas_raw
        )
    })?;

    let mut snapshot = SettingsSnapshot::default();
    let mut temporary = SettingsUpdate::new();

    if replicas > 0 {
        snapshot.values.insert(
            SETTING_NUMBER_OF_REPLICAS.to_string(),
            Some(replicas_raw.clone()),
        );
        temporary.insert(SETTING_NUMBER_OF_REPLICAS.to_string(), Some("0".to_string()));
    }

    snapshot.values.insert(
        SETTING_REFRESH_INTERVAL.to_string(),
        current.get(SETTING_REFRESH_INTERVAL).cloned(),
    );
    temporary.insert(
        SETTING_REFRESH_INTERVAL.to_string(),
        Some(REFRESH_DISABLED.to_string()),
    );

    Ok((snapshot, temporary))
}

pub struct SettingsGuard {
    engine: Arc<dyn SearchEngine>,
    index: String,
    snapshot: Option<SettingsSnapshot>,
}

impl SettingsGuard {
    pub fn new(engine: Arc<dyn SearchEngine>, index: impl Into<String>) -> Self {
        SettingsGuard {
            engine,
            index: index.into(),
            snapshot: None,
        }
    }

    /// Captured restore point, present between a successful start and stop.
    pub fn snapshot(&self) -> Option<&SettingsSnapshot> {
        self.snapshot.as_ref()
    }

    /// Capture current settings and apply the relaxed ones in one update.
    ///
    /// # Errors
    ///
    /// [`BatterError::SettingsRead`] if the settings cannot be read or make no
    /// sense, [`BatterError::SettingsUpdate`] if the relaxed values cannot be
    /// applied. Either way nothing was changed on the index.
    pub async fn on_session_start(&mut self) -> Result<()> {
        let current = self
            .engine
            .get_settings(&self.index)
            .await
            .map_err(|e| BatterError::SettingsRead {
                index: self.index.clone(),
                reason: e.to_string(),
            })?;

        let (snapshot, temporary) = relax(&current).map_err(|reason| BatterError::SettingsRead {
            index: self.index.clone(),
            reason,
        })?;

        self.engine
            .put_settings(&self.index, &temporary)
            .await
            .map_err(|e| BatterError::SettingsUpdate {
                index: self.index.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            "[SETTINGS {}] relaxed for bulk load: {:?} (restore point {:?})",
            self.index,
            temporary,
            snapshot.as_update()
        );
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Force-merge the index, then re-apply the captured settings.
    ///
    /// Must only be called once no write to the index is in flight. A merge
    /// failure is logged and the restore still attempted.
    ///
    /// # Errors
    ///
    /// [`BatterError::SettingsRestore`] if the original settings could not be
    /// re-applied; the index is then left relaxed and needs manual repair.
    pub async fn on_session_stop(&mut self) -> Result<()> {
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };

        // Merge while replicas are still off so they copy merged segments.
        if let Err(e) = self.engine.force_merge(&self.index).await {
            tracing::warn!("[SETTINGS {}] force merge failed: {}", self.index, e);
        }

        match self.engine.put_settings(&self.index, snapshot.as_update()).await {
            Ok(()) => {
                tracing::info!(
                    "[SETTINGS {}] restored {:?}",
                    self.index,
                    snapshot.as_update()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "[SETTINGS {}] fail to restore {:?}: {}",
                    self.index,
                    snapshot.as_update(),
                    e
                );
                eprintln!(
                    "ALERT: index {} settings were not restored after bulk load, set {:?} manually",
                    self.index,
                    snapshot.as_update()
                );
                Err(BatterError::SettingsRestore {
                    index: self.index.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{EngineCall, MemoryEngine};

    fn settings(replicas: &str, refresh: Option<&str>) -> IndexSettings {
        let mut s = MemoryEngine::default_settings();
        s.insert(SETTING_NUMBER_OF_REPLICAS.into(), replicas.into());
        if let Some(r) = refresh {
            s.insert(SETTING_REFRESH_INTERVAL.into(), r.into());
        }
        s
    }

    #[test]
    fn test_relax_with_replicas_and_refresh() {
        let (snapshot, temporary) = relax(&settings("2", Some("30s"))).unwrap();
        assert_eq!(snapshot.get(SETTING_NUMBER_OF_REPLICAS), Some(Some("2")));
        assert_eq!(snapshot.get(SETTING_REFRESH_INTERVAL), Some(Some("30s")));
        assert_eq!(
            temporary.get(SETTING_NUMBER_OF_REPLICAS),
            Some(&Some("0".to_string()))
        );
        assert_eq!(
            temporary.get(SETTING_REFRESH_INTERVAL),
            Some(&Some("-1".to_string()))
        );
    }

    #[test]
    fn test_relax_without_replicas_leaves_them_alone() {
        let (snapshot, temporary) = relax(&settings("0", None)).unwrap();
        assert_eq!(snapshot.get(SETTING_NUMBER_OF_REPLICAS), None);
        assert_eq!(snapshot.get(SETTING_REFRESH_INTERVAL), Some(None));
        assert!(!temporary.contains_key(SETTING_NUMBER_OF_REPLICAS));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_relax_rejects_unreadable_replicas() {
        assert!(relax(&settings("many", None)).is_err());
        assert!(relax(&IndexSettings::new()).is_err());
    }

    #[tokio::test]
    async fn test_round_trip_restores_exact_values() {
        let engine = Arc::new(MemoryEngine::new());
        let before = settings("1", Some("-1"));
        engine.create_index("issues", before.clone());

        let mut guard = SettingsGuard::new(engine.clone(), "issues");
        guard.on_session_start().await.unwrap();
        let relaxed = engine.settings("issues").unwrap();
        assert_eq!(relaxed.get(SETTING_NUMBER_OF_REPLICAS).unwrap(), "0");
        assert_eq!(relaxed.get(SETTING_REFRESH_INTERVAL).unwrap(), "-1");
        assert!(guard.snapshot().is_some());

        guard.on_session_stop().await.unwrap();
        assert_eq!(engine.settings("issues").unwrap(), before);
        assert!(guard.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_stop_merges_before_restoring() {
        let engine = Arc::new(MemoryEngine::new());
        engine.create_index("issues", settings("1", None));

        let mut guard = SettingsGuard::new(engine.clone(), "issues");
        guard.on_session_start().await.unwrap();
        guard.on_session_stop().await.unwrap();

        let tail: Vec<_> = engine.calls().into_iter().skip(2).collect();
        assert!(matches!(tail[0], EngineCall::ForceMerge(_)));
        assert!(matches!(tail[1], EngineCall::PutSettings(_, _)));
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn test_read_failure_changes_nothing() {
        let engine = Arc::new(MemoryEngine::new());
        engine.create_index("issues", settings("1", None));
        engine.set_fail_settings_reads(true);

        let mut guard = SettingsGuard::new(engine.clone(), "issues");
        let err = guard.on_session_start().await.unwrap_err();
        assert!(matches!(err, BatterError::SettingsRead { .. }));
        assert_eq!(engine.settings("issues").unwrap(), settings("1", None));
    }

    #[tokio::test]
    async fn test_restore_failure_is_reported() {
        let engine = Arc::new(MemoryEngine::new());
        engine.create_index("issues", settings("1", None));

        let mut guard = SettingsGuard::new(engine.clone(), "issues");
        guard.on_session_start().await.unwrap();
        engine.set_fail_settings_writes(true);

        let err = guard.on_session_stop().await.unwrap_err();
        assert!(matches!(err, BatterError::SettingsRestore { .. }));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let engine = Arc::new(MemoryEngine::new());
        let mut guard = SettingsGuard::new(engine.clone(), "issues");
        guard.on_session_stop().await.unwrap();
        assert!(engine.calls().is_empty());
    }
}
