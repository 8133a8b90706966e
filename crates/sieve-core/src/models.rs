use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One extracted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedItem {
    pub id: Uuid,
    pub source_url: String,
    pub data: Map<String, Value>,
    pub extracted_at: DateTime<Utc>,
    /// SHA-256 of the canonical JSON of `data` (for change detection)
    pub hash: String,
}

impl ExtractedItem {
    pub fn new(source_url: impl Into<String>, data: Map<String, Value>) -> Self {
        let hash = item_hash(&data);
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.into(),
            data,
            extracted_at: Utc::now(),
            hash,
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable JSON rendering: object keys sorted at every depth, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hash of an item's data, independent of key insertion order.
pub fn item_hash(data: &Map<String, Value>) -> String {
    compute_hash(&canonical_json(&Value::Object(data.clone())))
}

/// Signature of a page's item set, independent of item order.
pub fn page_signature<'a>(hashes: impl IntoIterator<Item = &'a str>) -> String {
    let mut hashes: Vec<&str> = hashes.into_iter().collect();
    hashes.sort_unstable();
    compute_hash(&hashes.join(","))
}
