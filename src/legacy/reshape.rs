//! Turns raw legacy payloads into canonical-shaped values.

use crate::core::record::{new_record_id, now_iso, rename_keys_deep, snake_to_camel};
use crate::core::{CanonicalKey, Result, VaultError, record_id};
use serde_json::{Map, Value};
use tracing::{Level, event};

/// Parses stored bytes as JSON, falling back to the raw text.
pub fn parse_raw(bytes: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Reshapes a parsed legacy payload for `key`.
pub fn reshape(key: CanonicalKey, raw: Value) -> Result<Value> {
    if key.is_collection() {
        let records = unwrap_collection(key, raw)?;
        Ok(Value::Array(
            records
                .into_iter()
                .filter_map(|record| reshape_record(key, record))
                .collect(),
        ))
    } else {
        match raw {
            Value::Object(map) => {
                let map = unwrap_named(key, map);
                Ok(rename_keys_deep(Value::Object(map), &snake_to_camel))
            }
            other => Err(VaultError::Validation(format!(
                "legacy '{}' is not an object (found {})",
                key,
                json_kind(&other)
            ))),
        }
    }
}

fn unwrap_collection(key: CanonicalKey, raw: Value) -> Result<Vec<Value>> {
    match raw {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for wrapper in ["items", "data", key.as_str()] {
                if matches!(map.get(wrapper), Some(Value::Array(_))) {
                    if let Some(Value::Array(items)) = map.remove(wrapper) {
                        return Ok(items);
                    }
                }
            }
            Ok(vec![Value::Object(map)])
        }
        Value::String(text) if !text.trim().is_empty() => {
            let mut record = Map::new();
            record.insert("content".to_string(), Value::String(text));
            Ok(vec![Value::Object(record)])
        }
        other => Err(VaultError::Validation(format!(
            "legacy '{}' holds {} instead of a collection",
            key,
            json_kind(&other)
        ))),
    }
}

fn unwrap_named(key: CanonicalKey, mut map: Map<String, Value>) -> Map<String, Value> {
    for wrapper in ["data", key.as_str()] {
        if matches!(map.get(wrapper), Some(Value::Object(_))) && map.len() == 1 {
            if let Some(Value::Object(inner)) = map.remove(wrapper) {
                return inner;
            }
        }
    }
    map
}

fn reshape_record(key: CanonicalKey, record: Value) -> Option<Value> {
    let record = match record {
        Value::Object(map) => Value::Object(map),
        Value::String(text) => {
            let mut map = Map::new();
            map.insert("content".to_string(), Value::String(text));
            Value::Object(map)
        }
        other => {
            event!(Level::WARN, key = %key, kind = json_kind(&other), "dropping non-record legacy entry");
            return None;
        }
    };

    let id = record_id(&record).unwrap_or_else(new_record_id);
    let Value::Object(mut map) = rename_keys_deep(record, &snake_to_camel) else {
        return None;
    };

    apply_aliases(key, &mut map);
    map.insert("id".to_string(), Value::String(id));

    if matches!(
        key,
        CanonicalKey::Templates | CanonicalKey::Workflows | CanonicalKey::Folders
    ) && !map.contains_key("name")
    {
        map.insert("name".to_string(), Value::String("Untitled".to_string()));
    }
    if !map.contains_key("createdAt") {
        map.insert("createdAt".to_string(), Value::String(now_iso()));
    }
    if !map.contains_key("updatedAt") {
        let created = map.get("createdAt").cloned().unwrap_or(Value::Null);
        map.insert("updatedAt".to_string(), created);
    }
    Some(Value::Object(map))
}

fn apply_aliases(key: CanonicalKey, map: &mut Map<String, Value>) {
    let aliases: &[(&str, &str)] = match key {
        CanonicalKey::Templates => &[
            ("title", "name"),
            ("templateContent", "content"),
            ("body", "content"),
            ("text", "content"),
        ],
        CanonicalKey::Snippets => &[("title", "name"), ("body", "content"), ("text", "content")],
        CanonicalKey::Workflows | CanonicalKey::Folders => &[("title", "name")],
        _ => &[],
    };
    for (from, to) in aliases {
        if map.contains_key(*to) {
            continue;
        }
        if let Some(value) = map.remove(*from) {
            map.insert((*to).to_string(), value);
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snake_fields_and_aliases_become_canonical() {
        let raw = json!([{"id": 7, "title": "Greeting", "body": "Hi", "created_at": "2023-01-01"}]);
        let shaped = reshape(CanonicalKey::Templates, raw).unwrap();
        assert_eq!(
            shaped,
            json!([{
                "id": "7",
                "name": "Greeting",
                "content": "Hi",
                "createdAt": "2023-01-01",
                "updatedAt": "2023-01-01"
            }])
        );
    }

    #[test]
    fn wrapped_and_raw_payloads_are_unwrapped() {
        let wrapped = reshape(CanonicalKey::Folders, json!({"items": [{"id": "f1", "name": "A"}]}))
            .unwrap();
        assert_eq!(wrapped[0]["id"], "f1");

        let named = reshape(CanonicalKey::Snippets, json!({"snippets": [{"id": "s", "text": "x"}]}))
            .unwrap();
        assert_eq!(named[0]["content"], "x");

        let raw = reshape(CanonicalKey::Snippets, parse_raw(b"just text")).unwrap();
        assert_eq!(raw[0]["content"], "just text");
        assert!(raw[0]["id"].is_string());
    }

    #[test]
    fn object_keys_reject_non_objects() {
        assert!(reshape(CanonicalKey::UserSettings, json!("dark")).is_err());
        let prefs = reshape(
            CanonicalKey::UiPreferences,
            json!({"data": {"dark_mode": true, "font_size": 14}}),
        )
        .unwrap();
        assert_eq!(prefs, json!({"darkMode": true, "fontSize": 14}));
    }
}
