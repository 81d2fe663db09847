//! Request and response bodies of the REST API.

use batter::{Batch, BulkItemResponse, BulkResponse, IndexSettings, ScrollHit, ScrollRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Keep-alive in the engine's time unit syntax.
pub fn keep_alive_param(keep_alive: Duration) -> String {
    format!("{}s", keep_alive.as_secs().max(1))
}

#[derive(Debug, Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<&'a str>,
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing: Option<&'a str>,
}

/// Newline-delimited bulk body: one metadata line per action, followed by
/// the source line for index actions.
pub fn bulk_body(batch: &Batch) -> Result<String, serde_json::Error> {
    let mut body = String::with_capacity(batch.size_in_bytes());
    for action in batch.actions() {
        let target = action.target();
        let meta = ActionMeta {
            index: &target.index,
            doc_type: target.doc_type.as_deref(),
            id: &target.id,
            routing: target.routing.as_deref(),
        };
        let mut line = serde_json::Map::new();
        line.insert(action.op_name().to_string(), serde_json::to_value(meta)?);
        body.push_str(&serde_json::Value::Object(line).to_string());
        body.push('\n');
        if let Some(source) = action.source() {
            body.push_str(source);
            body.push('\n');
        }
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
pub struct BulkReply {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub items: Vec<BTreeMap<String, BulkReplyItem>>,
}

#[derive(Debug, Deserialize)]
pub struct BulkReplyItem {
    #[serde(rename = "_index", default)]
    pub index: String,
    #[serde(rename = "_type", default)]
    pub doc_type: Option<String>,
    #[serde(rename = "_id", default)]
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// `{"type": "...", "reason": "..."}` or a bare string, as a single line.
fn error_message(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        other => {
            let kind = other.get("type").and_then(|t| t.as_str());
            let reason = other.get("reason").and_then(|r| r.as_str());
            match (kind, reason) {
                (Some(k), Some(r)) => format!("{}: {}", k, r),
                (Some(k), None) => k.to_string(),
                (None, Some(r)) => r.to_string(),
                (None, None) => other.to_string(),
            }
        }
    }
}

impl From<BulkReply> for BulkResponse {
    fn from(reply: BulkReply) -> Self {
        let items = reply
            .items
            .into_iter()
            .filter_map(|entry| entry.into_iter().next())
            .map(|(op, item)| BulkItemResponse {
                op,
                index: item.index,
                doc_type: item.doc_type,
                id: item.id,
                status: item.status,
                failure: item.error.as_ref().map(error_message),
            })
            .collect();
        BulkResponse {
            took_ms: reply.took,
            items,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SettingsEntry {
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

/// Flat settings of `index` from a `GET _settings?flat_settings=true` reply.
/// Numbers and booleans are kept in their string form.
pub fn flat_settings(
    reply: BTreeMap<String, SettingsEntry>,
    index: &str,
) -> Option<IndexSettings> {
    // Aliases answer under the concrete index name; take the only entry then.
    let entry = if reply.contains_key(index) {
        reply.into_iter().find(|(name, _)| name == index)
    } else if reply.len() == 1 {
        reply.into_iter().next()
    } else {
        None
    }?;
    Some(
        entry
            .1
            .settings
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect(),
    )
}

#[derive(Debug, Serialize)]
pub struct SearchBody<'a> {
    pub query: &'a serde_json::Value,
    pub size: usize,
    pub sort: &'a [String],
    #[serde(rename = "_source")]
    pub source: bool,
}

impl<'a> From<&'a ScrollRequest> for SearchBody<'a> {
    fn from(request: &'a ScrollRequest) -> Self {
        SearchBody {
            query: &request.query,
            size: request.page_size,
            sort: &request.sort,
            source: request.fetch_source,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScrollBody<'a> {
    pub scroll: String,
    pub scroll_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ClearScrollBody<'a> {
    pub scroll_id: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct SearchReply {
    #[serde(rename = "_scroll_id")]
    pub scroll_id: Option<String>,
    pub hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
pub struct HitsEnvelope {
    #[serde(default)]
    pub hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
pub struct Hit {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_type", default)]
    pub doc_type: Option<String>,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_routing", default)]
    pub routing: Option<String>,
}

impl From<Hit> for ScrollHit {
    fn from(hit: Hit) -> Self {
        ScrollHit {
            index: hit.index,
            doc_type: hit.doc_type,
            id: hit.id,
            routing: hit.routing,
        }
    }
}
