use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Index (collection) name, e.g. `"issues"`.
pub type IndexName = String;
/// Document identifier within an index.
pub type DocumentId = String;

/// Flat index settings as returned by the engine, e.g.
/// `"index.number_of_replicas" -> "1"`.
pub type IndexSettings = BTreeMap<String, String>;

/// Settings to apply in one atomic update. `None` resets the setting, which
/// restores an engine default that was never explicitly set.
pub type SettingsUpdate = BTreeMap<String, Option<String>>;

pub const SETTING_NUMBER_OF_SHARDS: &str = "index.number_of_shards";
pub const SETTING_NUMBER_OF_REPLICAS: &str = "index.number_of_replicas";
pub const SETTING_REFRESH_INTERVAL: &str = "index.refresh_interval";

/// Fixed per-request weight added to every action, whatever its payload.
pub const REQUEST_OVERHEAD_BYTES: usize = 50;

/// Address of a single document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRef {
    pub index: IndexName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<String>,
}

/// One write against the engine.
///
/// Built once and never mutated afterwards; the same value is resent as-is
/// when its batch is retried.
///
/// ```rust
/// use batter::WriteAction;
/// use serde_json::json;
///
/// let put = WriteAction::index("issues", "AX-1", &json!({"rule": "S1234"}))
///     .with_routing("project-7");
/// let del = WriteAction::delete("issues", "AX-2");
/// assert!(put.estimated_size() > del.estimated_size());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAction {
    /// Create or overwrite a document. `source` is its serialized JSON body.
    Index { target: DocRef, source: String },
    Delete { target: DocRef },
}

impl WriteAction {
    pub fn index(
        index: impl Into<String>,
        id: impl Into<String>,
        source: &serde_json::Value,
    ) -> Self {
        WriteAction::Index {
            target: DocRef {
                index: index.into(),
                doc_type: None,
                id: id.into(),
                routing: None,
            },
            source: source.to_string(),
        }
    }

    /// Index any serializable document.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BatterError::Json`] if `doc` cannot be serialized, or
    /// [`crate::BatterError::InvalidAction`] if it does not serialize to a
    /// JSON object.
    pub fn index_serialized<T: Serialize>(
        index: impl Into<String>,
        id: impl Into<String>,
        doc: &T,
    ) -> crate::error::Result<Self> {
        let value = serde_json::to_value(doc)?;
        if !value.is_object() {
            return Err(crate::error::BatterError::InvalidAction(
                "document source must be a JSON object".to_string(),
            ));
        }
        Ok(Self::index(index, id, &value))
    }

    pub fn delete(index: impl Into<String>, id: impl Into<String>) -> Self {
        WriteAction::Delete {
            target: DocRef {
                index: index.into(),
                doc_type: None,
                id: id.into(),
                routing: None,
            },
        }
    }

    pub fn with_type(mut self, doc_type: impl Into<String>) -> Self {
        self.target_mut().doc_type = Some(doc_type.into());
        self
    }

    pub fn with_routing(mut self, routing: impl Into<String>) -> Self {
        self.target_mut().routing = Some(routing.into());
        self
    }

    pub fn target(&self) -> &DocRef {
        match self {
            WriteAction::Index { target, .. } | WriteAction::Delete { target } => target,
        }
    }

    fn target_mut(&mut self) -> &mut DocRef {
        match self {
            WriteAction::Index { target, .. } | WriteAction::Delete { target } => target,
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            WriteAction::Index { source, .. } => Some(source),
            WriteAction::Delete { .. } => None,
        }
    }

    /// Bulk operation name on the wire.
    pub fn op_name(&self) -> &'static str {
        match self {
            WriteAction::Index { .. } => "index",
            WriteAction::Delete { .. } => "delete",
        }
    }

    /// Weight of this action when filling a batch: the payload length plus a
    /// fixed per-request overhead.
    pub fn estimated_size(&self) -> usize {
        self.source().map(str::len).unwrap_or(0) + REQUEST_OVERHEAD_BYTES
    }
}

/// Ordered group of actions sent to the engine in one bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: u64,
    actions: Vec<WriteAction>,
    size_in_bytes: usize,
}

impl Batch {
    pub fn new(id: u64) -> Self {
        Batch {
            id,
            actions: Vec::new(),
            size_in_bytes: 0,
        }
    }

    pub fn push(&mut self, action: WriteAction) {
        self.size_in_bytes += action.estimated_size();
        self.actions.push(action);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn actions(&self) -> &[WriteAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }
}

/// Outcome of one action inside a bulk response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemResponse {
    pub op: String,
    pub index: IndexName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub id: DocumentId,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl BulkItemResponse {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResponse {
    pub took_ms: u64,
    pub items: Vec<BulkItemResponse>,
}

impl BulkResponse {
    pub fn has_failures(&self) -> bool {
        self.items.iter().any(BulkItemResponse::is_failed)
    }
}

/// A rejected action, kept in the session summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub index: IndexName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub id: DocumentId,
    pub reason: String,
}

/// Opening request of a scroll scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollRequest {
    pub index: IndexName,
    pub query: serde_json::Value,
    pub page_size: usize,
    pub keep_alive: Duration,
    /// Sort keys; `_doc` is the engine's internal storage order.
    pub sort: Vec<String>,
    /// When false, hits carry identifiers and routing only.
    pub fetch_source: bool,
}

/// One document address returned by a scroll page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollHit {
    pub index: IndexName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollPage {
    /// Cursor to pass to the next fetch; the engine may rotate it per page.
    pub scroll_id: String,
    pub hits: Vec<ScrollHit>,
}
