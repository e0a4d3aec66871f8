//! Helpers for JSON records: identity, timestamps, field casing and
//! canonical serialization.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type RecordMap = Map<String, Value>;

/// Field carrying the schema-version tag on every canonical record.
pub const VERSION_FIELD: &str = "version";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Returns the record identity, accepting string or numeric ids.
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for (idx, ch) in name.chars().enumerate() {
        if ch == '_' && idx > 0 {
            upper_next = true;
            continue;
        }
        if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (idx, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if idx > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

pub fn is_snake_case_field(name: &str) -> bool {
    name.trim_start_matches('_').contains('_')
}

/// Rewrites object keys with `rename`, descending into nested objects and arrays.
pub fn rename_keys_deep(value: Value, rename: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let renamed = rename(&key);
                let inner = rename_keys_deep(inner, rename);
                // A camelCase field that already exists wins over its snake_case twin.
                if renamed != key && out.contains_key(&renamed) {
                    continue;
                }
                out.insert(renamed, inner);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| rename_keys_deep(item, rename))
                .collect(),
        ),
        other => other,
    }
}

/// Serializes with object keys sorted at every depth, independent of map ordering.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    canonical_json(a) == canonical_json(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn casing_round_trips_common_fields() {
        assert_eq!(snake_to_camel("created_at"), "createdAt");
        assert_eq!(snake_to_camel("folder_id"), "folderId");
        assert_eq!(snake_to_camel("_private"), "_private");
        assert_eq!(camel_to_snake("createdAt"), "created_at");
        assert!(is_snake_case_field("updated_at"));
        assert!(!is_snake_case_field("updatedAt"));
    }

    #[test]
    fn rename_keeps_existing_camel_field() {
        let renamed = rename_keys_deep(
            json!({"createdAt": "new", "created_at": "old", "steps": [{"template_id": "t"}]}),
            &|k| snake_to_camel(k),
        );
        assert_eq!(renamed["createdAt"], "new");
        assert_eq!(renamed["steps"][0]["templateId"], "t");
        assert!(renamed.get("created_at").is_none());
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert!(canonical_eq(&a, &b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
    }

    #[test]
    fn record_id_accepts_numbers() {
        assert_eq!(record_id(&json!({"id": 5})), Some("5".to_string()));
        assert_eq!(record_id(&json!({"id": "a"})), Some("a".to_string()));
        assert_eq!(record_id(&json!({"id": ""})), None);
    }
}
