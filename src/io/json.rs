//! JSON checkpoint helpers for run state handed between process launches

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::RESERVED_PREFIX;

/// Convert any serializable value into a JSON tree, dropping every object key
/// that starts with [`RESERVED_PREFIX`]. Arrays are converted element-wise.
pub fn to_record<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let value = serde_json::to_value(value).context("Failed to convert value to JSON")?;
    Ok(strip_reserved(value))
}

fn strip_reserved(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !key.starts_with(RESERVED_PREFIX))
                .map(|(key, val)| (key, strip_reserved(val)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_reserved).collect()),
        other => other,
    }
}

/// Write `value` as pretty JSON to `<stem>.json` and return the file path
pub async fn to_json_file<T: Serialize + ?Sized>(value: &T, stem: impl AsRef<Path>) -> Result<PathBuf> {
    let mut path = stem.as_ref().as_os_str().to_owned();
    path.push(".json");
    let path = PathBuf::from(path);

    let record = to_record(value)?;
    let json = serde_json::to_string_pretty(&record).context("Failed to serialize record")?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    fs::write(&path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(path)
}

/// Read a JSON file back into a concrete type
pub async fn from_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Read a JSON file as a generic tree, for files with no known schema
pub async fn from_json_generic(path: impl AsRef<Path>) -> Result<Value> {
    from_json_file::<Value>(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Receiver {
        name: String,
        #[serde(rename = "_handle", default)]
        handle: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct State {
        iteration: u32,
        misfit: f64,
        receivers: Vec<Receiver>,
        #[serde(rename = "_cache", default)]
        cache: Vec<f64>,
    }

    fn state() -> State {
        State {
            iteration: 3,
            misfit: 0.25,
            receivers: vec![
                Receiver {
                    name: "r0".to_string(),
                    handle: 7,
                },
                Receiver {
                    name: "r1".to_string(),
                    handle: 8,
                },
            ],
            cache: vec![1.0, 2.0],
        }
    }

    fn has_reserved_key(value: &Value) -> bool {
        match value {
            Value::Object(map) => map
                .iter()
                .any(|(k, v)| k.starts_with(RESERVED_PREFIX) || has_reserved_key(v)),
            Value::Array(items) => items.iter().any(has_reserved_key),
            _ => false,
        }
    }

    #[test]
    fn test_to_record_drops_reserved_keys_recursively() {
        let record = to_record(&state()).unwrap();
        assert!(!has_reserved_key(&record));
        assert_eq!(
            record,
            json!({
                "iteration": 3,
                "misfit": 0.25,
                "receivers": [{"name": "r0"}, {"name": "r1"}],
            })
        );
    }

    #[test]
    fn test_to_record_keeps_plain_values() {
        assert_eq!(to_record(&5).unwrap(), json!(5));
        assert_eq!(to_record(&vec!["a", "b"]).unwrap(), json!(["a", "b"]));

        let nested = json!({"keep": {"_drop": 1, "also": [{"_x": 0, "y": 1}]}});
        assert_eq!(to_record(&nested).unwrap(), json!({"keep": {"also": [{"y": 1}]}}));
    }

    #[tokio::test]
    async fn test_json_round_trip_preserves_non_reserved() {
        let dir = TempDir::new().unwrap();
        let original = state();

        let path = to_json_file(&original, dir.path().join("checkpoint"))
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("checkpoint.json"));

        let restored: State = from_json_file(&path).await.unwrap();
        assert_eq!(restored.iteration, original.iteration);
        assert_eq!(restored.misfit, original.misfit);
        assert_eq!(
            restored.receivers.iter().map(|r| &r.name).collect::<Vec<_>>(),
            original.receivers.iter().map(|r| &r.name).collect::<Vec<_>>()
        );
        // reserved fields fall back to their defaults
        assert!(restored.cache.is_empty());
        assert!(restored.receivers.iter().all(|r| r.handle == 0));

        let generic = from_json_generic(&path).await.unwrap();
        assert_eq!(generic, to_record(&original).unwrap());
    }

    #[tokio::test]
    async fn test_json_file_has_no_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let path = to_json_file(&json!({"a": 1}), dir.path().join("nested/out"))
            .await
            .unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!contents.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_from_json_file_missing_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(from_json_generic(dir.path().join("missing.json")).await.is_err());
    }
}
