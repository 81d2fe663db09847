//! How hard a session may push the engine, from its declared intent.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Shard count an index is assumed to have when sizing concurrency.
// TODO: read the real number_of_shards of the target index instead.
const DEFAULT_NUMBER_OF_SHARDS: usize = 5;

/// Declared purpose of a bulk session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// A limited number of documents on a live index.
    #[default]
    Regular,
    /// Heavy load, generally populating an index from scratch. Replicas and
    /// automatic refresh are disabled while it runs and segments are merged
    /// at the end.
    Large,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Regular => write!(f, "regular"),
            Intent::Large => write!(f, "large"),
        }
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "regular" => Ok(Intent::Regular),
            "large" => Ok(Intent::Large),
            other => Err(format!("unknown intent '{}', expected regular or large", other)),
        }
    }
}

/// Source of the host's CPU parallelism, injected at session construction.
pub trait Parallelism: Send + Sync {
    fn available_cores(&self) -> usize;
}

/// Cores the current process may use, as reported by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostParallelism;

impl Parallelism for HostParallelism {
    fn available_cores(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// A fixed core count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedParallelism(pub usize);

impl Parallelism for FixedParallelism {
    fn available_cores(&self) -> usize {
        self.0
    }
}

/// Resolved policy of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizingPlan {
    pub intent: Intent,
    /// Batches allowed in flight besides the one being filled. Zero means the
    /// submitting task sends every batch itself, one at a time.
    pub concurrency: usize,
    /// Relax replicas and refresh while loading, force-merge at the end.
    pub relax_settings: bool,
    pub report_progress: bool,
}

impl SizingPlan {
    pub fn select(intent: Intent, cores: usize) -> SizingPlan {
        match intent {
            Intent::Regular => SizingPlan {
                intent,
                concurrency: 0,
                relax_settings: false,
                report_progress: false,
            },
            Intent::Large => SizingPlan {
                intent,
                // max() before the subtraction: never negative, may be 0.
                concurrency: std::cmp::max(1, cores / DEFAULT_NUMBER_OF_SHARDS) - 1,
                relax_settings: true,
                report_progress: true,
            },
        }
    }
}
