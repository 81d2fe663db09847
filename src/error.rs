use thiserror::Error;

/// Failure reported by a [`crate::engine::SearchEngine`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Connection refused, reset, timed out: the request never got an answer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The engine answered but refused the work for lack of capacity.
    #[error("Rejected by engine ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Engine returned {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Whether resending the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Rejected { .. })
    }

    /// Map an HTTP status to the matching error class.
    ///
    /// 429 and the gateway/unavailable family are capacity signals; any other
    /// non-success status is a permanent answer for this request.
    pub fn from_status(status: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match status {
            429 | 502 | 503 | 504 => EngineError::Rejected { status, reason },
            404 => EngineError::NotFound(reason),
            _ => EngineError::Status { status, reason },
        }
    }
}

/// Session phase an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Opening the session: reading and relaxing index settings.
    Start,
    /// Submitting and transmitting actions, including the final drain.
    Transmit,
    /// Closing the session: refresh, compaction and settings restore.
    Stop,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Start => write!(f, "start"),
            SessionPhase::Transmit => write!(f, "transmit"),
            SessionPhase::Stop => write!(f, "stop"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum BatterError {
    #[error("Bulk session on index {index} is closed")]
    SessionClosed { index: String },

    #[error("Fail to read settings of index {index}: {reason}")]
    SettingsRead { index: String, reason: String },

    #[error("Fail to update settings of index {index}: {reason}")]
    SettingsUpdate { index: String, reason: String },

    #[error("Fail to restore settings of index {index}: {reason}")]
    SettingsRestore { index: String, reason: String },

    #[error("Bulk requests on index {index} still being executed after {waited_secs} seconds")]
    DrainTimeout { index: String, waited_secs: u64 },

    #[error("Fail to refresh index {index}: {reason}")]
    Refresh { index: String, reason: String },

    #[error("Scroll on index {index} failed: {reason}")]
    Scroll { index: String, reason: String },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, BatterError>;

impl From<std::io::Error> for BatterError {
    fn from(e: std::io::Error) -> Self {
        BatterError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BatterError {
    fn from(e: serde_json::Error) -> Self {
        BatterError::Json(e.to_string())
    }
}

impl BatterError {
    pub fn phase(&self) -> SessionPhase {
        match self {
            BatterError::SettingsRead { .. } => SessionPhase::Start,
            BatterError::SettingsUpdate { .. } => SessionPhase::Start,
            BatterError::SessionClosed { .. } => SessionPhase::Transmit,
            BatterError::DrainTimeout { .. } => SessionPhase::Transmit,
            BatterError::Scroll { .. } => SessionPhase::Transmit,
            BatterError::InvalidAction(_) => SessionPhase::Transmit,
            BatterError::Json(_) => SessionPhase::Transmit,
            BatterError::Io(_) => SessionPhase::Transmit,
            BatterError::Refresh { .. } => SessionPhase::Stop,
            BatterError::SettingsRestore { .. } => SessionPhase::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_statuses_are_transient() {
        for status in [429, 502, 503, 504] {
            assert!(EngineError::from_status(status, "busy").is_transient());
        }
        assert!(EngineError::Transport("connection reset".into()).is_transient());
    }

    #[test]
    fn test_client_errors_are_permanent() {
        assert!(!EngineError::from_status(400, "mapper_parsing_exception").is_transient());
        assert!(!EngineError::from_status(500, "boom").is_transient());
        assert_eq!(
            EngineError::from_status(404, "index_not_found_exception"),
            EngineError::NotFound("index_not_found_exception".into())
        );
    }

    #[test]
    fn test_error_phases() {
        let start = BatterError::SettingsRead {
            index: "issues".into(),
            reason: "timeout".into(),
        };
        assert_eq!(start.phase(), SessionPhase::Start);

        let drain = BatterError::DrainTimeout {
            index: "issues".into(),
            waited_secs: 600,
        };
        assert_eq!(drain.phase(), SessionPhase::Transmit);
        assert_eq!(
            drain.to_string(),
            "Bulk requests on index issues still being executed after 600 seconds"
        );

        let restore = BatterError::SettingsRestore {
            index: "issues".into(),
            reason: "timeout".into(),
        };
        assert_eq!(restore.phase(), SessionPhase::Stop);
    }
}
