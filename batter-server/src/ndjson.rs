//! One document per line in, one index action per document out.

use batter::WriteAction;
use serde_json::Value;

/// Parse one input line. Blank lines yield `None`.
///
/// The document id comes from `_id` (removed from the source, the engine
/// rejects it there) or `objectID` (kept). Without either a random id is
/// generated. A `_routing` field is removed and used as routing.
pub fn action_from_line(index: &str, line: &str) -> Result<Option<WriteAction>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let mut doc: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let fields = doc
        .as_object_mut()
        .ok_or_else(|| "document must be a JSON object".to_string())?;

    let id = match fields.remove("_id").or_else(|| fields.get("objectID").cloned()) {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => return Err(format!("unsupported id: {}", other)),
        None => uuid::Uuid::new_v4().to_string(),
    };
    let routing = match fields.remove("_routing") {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => return Err(format!("unsupported routing: {}", other)),
        None => None,
    };

    let action = WriteAction::index(index, id, &doc);
    Ok(Some(match routing {
        Some(r) => action.with_routing(r),
        None => action,
    }))
}
