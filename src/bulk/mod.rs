pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod progress;
pub mod scroll;
pub mod session;
pub mod settings_guard;
pub mod sizing;

pub use backoff::BackoffPolicy;
pub use config::BulkConfig;
pub use dispatcher::{BatchDispatcher, DispatchStats};
pub use session::{BulkSession, BulkSessionBuilder, BulkSummary, SessionState};
pub use settings_guard::{SettingsGuard, SettingsSnapshot};
pub use sizing::{FixedParallelism, HostParallelism, Intent, Parallelism, SizingPlan};
