use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error body returned by the backend for non-2xx responses.
///
/// `detail` is either a plain string or a list of validation entries, each
/// carrying a `msg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub detail: Value,
}

impl ApiError {
    pub fn message(&self) -> Option<String> {
        match &self.detail {
            Value::String(text) => Some(text.clone()),
            Value::Array(entries) => {
                let parts: Vec<String> = entries
                    .iter()
                    .filter_map(|entry| entry.get("msg").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect();
                (!parts.is_empty()).then(|| parts.join("; "))
            }
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Best-effort decode of a raw response body; `None` when it carries no detail.
    pub fn detail_from_body(body: &[u8]) -> Option<String> {
        serde_json::from_slice::<ApiError>(body)
            .ok()
            .and_then(|error| error.message())
    }
}
