#![allow(dead_code)]

use batter::{
    BackoffPolicy, BulkConfig, BulkSession, FixedParallelism, IndexSettings, Intent, MemoryEngine,
    WriteAction, SETTING_NUMBER_OF_REPLICAS, SETTING_REFRESH_INTERVAL,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const INDEX: &str = "issues";

/// Engine holding an empty `issues` index with the given replicas and
/// refresh interval.
pub fn engine_with_index(replicas: &str, refresh: Option<&str>) -> Arc<MemoryEngine> {
    let engine = Arc::new(MemoryEngine::new());
    engine.create_index(INDEX, index_settings(replicas, refresh));
    engine
}

pub fn index_settings(replicas: &str, refresh: Option<&str>) -> IndexSettings {
    let mut settings = MemoryEngine::default_settings();
    settings.insert(SETTING_NUMBER_OF_REPLICAS.to_string(), replicas.to_string());
    if let Some(r) = refresh {
        settings.insert(SETTING_REFRESH_INTERVAL.to_string(), r.to_string());
    }
    settings
}

/// Backoff short enough not to slow tests down.
pub fn fast_config() -> BulkConfig {
    BulkConfig::default().with_backoff(BackoffPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(8),
    })
}

pub fn issue(i: usize) -> WriteAction {
    WriteAction::index(
        INDEX,
        format!("AX-{}", i),
        &json!({"key": format!("AX-{}", i), "project": if i % 2 == 0 { "p1" } else { "p2" }}),
    )
}

pub async fn large_session(
    engine: Arc<MemoryEngine>,
    cores: usize,
    config: BulkConfig,
) -> BulkSession {
    BulkSession::builder(engine, INDEX)
        .intent(Intent::Large)
        .parallelism(Arc::new(FixedParallelism(cores)))
        .config(config)
        .open()
        .await
        .unwrap()
}
