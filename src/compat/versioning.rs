//! Schema version detection and the ordered record transform chain.

use crate::core::record::{is_snake_case_field, rename_keys_deep, snake_to_camel};
use crate::core::{CanonicalKey, RecordMap, Result, VERSION_FIELD, VaultError};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const CURRENT_SCHEMA_VERSION: u32 = 3;
pub const OLDEST_SCHEMA_VERSION: u32 = 1;

lazy_static! {
    static ref PLACEHOLDER: Option<Regex> =
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").ok();
}

pub type RecordTransform = Arc<dyn Fn(CanonicalKey, &mut RecordMap) -> Result<()> + Send + Sync>;

/// One `from -> to` upgrade applied to a single record.
#[derive(Clone)]
pub struct TransformStep {
    pub from_version: u32,
    pub to_version: u32,
    pub description: String,
    transform: RecordTransform,
}

impl fmt::Debug for TransformStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStep")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("description", &self.description)
            .finish()
    }
}

impl TransformStep {
    pub fn new<F>(from_version: u32, to_version: u32, description: impl Into<String>, transform: F) -> Self
    where
        F: Fn(CanonicalKey, &mut RecordMap) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            from_version,
            to_version,
            description: description.into(),
            transform: Arc::new(transform),
        }
    }

    /// Runs the transform and stamps `to_version` on the record.
    pub fn apply(&self, key: CanonicalKey, record: &mut RecordMap) -> Result<()> {
        (self.transform)(key, record).map_err(|err| match err {
            VaultError::Transform { .. } => err,
            other => VaultError::Transform {
                from_version: self.from_version,
                to_version: self.to_version,
                message: other.to_string(),
            },
        })?;
        record.insert(VERSION_FIELD.to_string(), Value::from(self.to_version));
        Ok(())
    }
}

/// Ordered version ladder ending at `current_version`.
#[derive(Debug, Clone)]
pub struct TransformChain {
    current_version: u32,
    steps: Vec<TransformStep>,
}

impl Default for TransformChain {
    fn default() -> Self {
        default_chain()
    }
}

impl TransformChain {
    pub fn new(current_version: u32) -> Self {
        Self {
            current_version,
            steps: Vec::new(),
        }
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    pub fn add_step(&mut self, step: TransformStep) -> Result<()> {
        self.steps.push(step);
        self.steps.sort_by_key(|step| step.from_version);
        self.validate()
    }

    pub fn with_step(mut self, step: TransformStep) -> Result<Self> {
        self.add_step(step)?;
        Ok(self)
    }

    /// Checks versions are >= 1, steps move forward, stay within the target
    /// and no two steps start at the same version.
    pub fn validate(&self) -> Result<()> {
        if self.current_version == 0 {
            return Err(VaultError::Validation(
                "schema version must be >= 1".to_string(),
            ));
        }
        let mut seen_from = HashMap::<u32, &str>::new();
        for step in &self.steps {
            if step.from_version == 0 || step.to_version <= step.from_version {
                return Err(VaultError::Validation(format!(
                    "transform step {} -> {} is invalid",
                    step.from_version, step.to_version
                )));
            }
            if step.to_version > self.current_version {
                return Err(VaultError::Validation(format!(
                    "transform step {} -> {} exceeds schema version {}",
                    step.from_version, step.to_version, self.current_version
                )));
            }
            if let Some(existing) = seen_from.insert(step.from_version, &step.description) {
                return Err(VaultError::Validation(format!(
                    "duplicate transform step at version {} ('{}')",
                    step.from_version, existing
                )));
            }
        }
        Ok(())
    }

    /// Ordered steps taking `from_version` up to the current version.
    pub fn resolve_chain(&self, from_version: u32) -> Result<Vec<&TransformStep>> {
        if from_version >= self.current_version {
            return Ok(Vec::new());
        }
        let by_from = self
            .steps
            .iter()
            .map(|step| (step.from_version, step))
            .collect::<HashMap<_, _>>();

        let mut cursor = from_version;
        let mut chain = Vec::new();
        while cursor < self.current_version {
            let step = by_from.get(&cursor).copied().ok_or_else(|| VaultError::Transform {
                from_version: cursor,
                to_version: self.current_version,
                message: format!("no transform step starts at version {}", cursor),
            })?;
            chain.push(step);
            cursor = step.to_version;
        }
        Ok(chain)
    }

    /// Upgrades one record in place. Records newer than the chain are left untouched.
    pub fn upgrade_record(&self, key: CanonicalKey, record: &mut RecordMap) -> Result<bool> {
        let detected = detect_version(key, record);
        if detected > self.current_version {
            return Ok(false);
        }
        let mut changed = false;
        for step in self.resolve_chain(detected)? {
            step.apply(key, record)?;
            changed = true;
        }
        if record.get(VERSION_FIELD).and_then(Value::as_u64) != Some(u64::from(self.current_version)) {
            record.insert(VERSION_FIELD.to_string(), Value::from(self.current_version));
            changed = true;
        }
        Ok(changed)
    }

    /// Upgrades a whole dataset value; returns whether anything changed.
    pub fn upgrade_value(&self, key: CanonicalKey, value: Value) -> Result<(Value, bool)> {
        let mut changed = false;
        let upgraded = map_records(key, value, |record| {
            changed |= self.upgrade_record(key, record)?;
            Ok(())
        })?;
        Ok((upgraded, changed))
    }

    /// Applies a single step to every record currently at its starting version.
    pub fn apply_step(&self, step: &TransformStep, key: CanonicalKey, value: Value) -> Result<Value> {
        map_records(key, value, |record| {
            if detect_version(key, record) == step.from_version {
                step.apply(key, record)?;
            }
            Ok(())
        })
    }

    /// Stamps the current version on every record of a value about to be written.
    pub fn stamp(&self, key: CanonicalKey, value: Value) -> Result<Value> {
        map_records(key, value, |record| {
            record.insert(VERSION_FIELD.to_string(), Value::from(self.current_version));
            Ok(())
        })
    }
}

/// Calls `visit` on each record: array elements for collections, the object
/// itself otherwise. Non-object entries pass through.
pub fn map_records<F>(key: CanonicalKey, value: Value, mut visit: F) -> Result<Value>
where
    F: FnMut(&mut RecordMap) -> Result<()>,
{
    match value {
        Value::Array(items) if key.is_collection() => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Object(mut record) => {
                        visit(&mut record)?;
                        out.push(Value::Object(record));
                    }
                    other => out.push(other),
                }
            }
            Ok(Value::Array(out))
        }
        Value::Object(mut record) if !key.is_collection() => {
            visit(&mut record)?;
            Ok(Value::Object(record))
        }
        other => Ok(other),
    }
}

/// Explicit `version` field, then a structural fingerprint, then the oldest version.
pub fn detect_version(key: CanonicalKey, record: &RecordMap) -> u32 {
    if let Some(version) = record.get(VERSION_FIELD) {
        let explicit = match version {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        if let Some(version) = explicit.and_then(|v| u32::try_from(v).ok()) {
            return version;
        }
    }

    if record.keys().any(|field| is_snake_case_field(field))
        || matches!(record.get("id"), Some(Value::Number(_)))
    {
        return 1;
    }

    let looks_v2 = match key {
        CanonicalKey::Templates => {
            matches!(record.get("tags"), Some(Value::Array(_))) && !record.contains_key("variables")
        }
        CanonicalKey::UiPreferences => matches!(record.get("darkMode"), Some(Value::Bool(_))),
        CanonicalKey::Workflows => record
            .get("steps")
            .and_then(Value::as_array)
            .map(|steps| {
                steps
                    .iter()
                    .any(|step| step.is_object() && step.get("order").is_none())
            })
            .unwrap_or(false),
        _ => false,
    };
    if looks_v2 { 2 } else { OLDEST_SCHEMA_VERSION }
}

/// `{{name}}` placeholders in order of first appearance.
pub fn extract_variables(content: &str) -> Vec<String> {
    let mut names = Vec::new();
    let Some(pattern) = PLACEHOLDER.as_ref() else {
        return names;
    };
    for capture in pattern.captures_iter(content) {
        if let Some(name) = capture.get(1) {
            let name = name.as_str().to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

fn upgrade_v1_to_v2(key: CanonicalKey, record: &mut RecordMap) -> Result<()> {
    let renamed = rename_keys_deep(Value::Object(std::mem::take(record)), &snake_to_camel);
    if let Value::Object(map) = renamed {
        *record = map;
    }

    if let Some(Value::Number(id)) = record.get("id") {
        let id = id.to_string();
        record.insert("id".to_string(), Value::String(id));
    }

    if key == CanonicalKey::Templates {
        if let Some(Value::String(tags)) = record.get("tags") {
            let tags = tags
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(|tag| Value::String(tag.to_string()))
                .collect::<Vec<_>>();
            record.insert("tags".to_string(), Value::Array(tags));
        }
    }
    Ok(())
}

fn upgrade_v2_to_v3(key: CanonicalKey, record: &mut RecordMap) -> Result<()> {
    match key {
        CanonicalKey::Templates => {
            record.entry("folderId").or_insert(Value::Null);
            if !record.contains_key("variables") {
                let variables = record
                    .get("content")
                    .and_then(Value::as_str)
                    .map(extract_variables)
                    .unwrap_or_default();
                record.insert(
                    "variables".to_string(),
                    Value::Array(variables.into_iter().map(Value::String).collect()),
                );
            }
        }
        CanonicalKey::Workflows => {
            if let Some(Value::Array(steps)) = record.get_mut("steps") {
                for (index, step) in steps.iter_mut().enumerate() {
                    let Value::Object(step) = step else {
                        return Err(VaultError::Transform {
                            from_version: 2,
                            to_version: 3,
                            message: format!("workflow step {} is not an object", index),
                        });
                    };
                    step.entry("order").or_insert(Value::from(index as u64));
                    if !step.contains_key("templateId") {
                        let template = match step.remove("template") {
                            Some(Value::Number(n)) => Value::String(n.to_string()),
                            Some(Value::String(s)) => Value::String(s),
                            _ => Value::Null,
                        };
                        step.insert("templateId".to_string(), template);
                    }
                }
            }
        }
        CanonicalKey::Snippets => {
            record.entry("shortcut").or_insert(Value::Null);
        }
        CanonicalKey::UiPreferences => {
            if let Some(Value::Bool(dark)) = record.get("darkMode").cloned() {
                record.remove("darkMode");
                record
                    .entry("theme")
                    .or_insert(Value::String(if dark { "dark" } else { "light" }.to_string()));
            }
        }
        CanonicalKey::Folders | CanonicalKey::UserSettings => {}
    }
    Ok(())
}

/// The built-in ladder: 1 -> 2 -> 3.
pub fn default_chain() -> TransformChain {
    TransformChain {
        current_version: CURRENT_SCHEMA_VERSION,
        steps: vec![
            TransformStep::new(1, 2, "camelCase fields, string ids, tag arrays", upgrade_v1_to_v2),
            TransformStep::new(
                2,
                3,
                "folder links, template variables, step order, snippet shortcuts, theme",
                upgrade_v2_to_v3,
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RecordMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn detection_prefers_explicit_version_then_fingerprint() {
        let key = CanonicalKey::Templates;
        assert_eq!(detect_version(key, &record(json!({"version": 2, "created_at": 1}))), 2);
        assert_eq!(detect_version(key, &record(json!({"created_at": 1}))), 1);
        assert_eq!(detect_version(key, &record(json!({"id": "a", "tags": ["x", "y"]}))), 2);
        assert_eq!(detect_version(key, &record(json!({"id": "a", "tags": "x,y"}))), 1);
        assert_eq!(
            detect_version(CanonicalKey::UiPreferences, &record(json!({"darkMode": true}))),
            2
        );
        assert_eq!(detect_version(key, &record(json!({"id": "a"}))), 1);
    }

    #[test]
    fn v1_template_reaches_current_shape() {
        let chain = default_chain();
        let (value, changed) = chain
            .upgrade_value(
                CanonicalKey::Templates,
                json!([{"id": 4, "tags": "a, b,", "template_content": "x", "content": "Hi {{ name }} {{name}} {{team}}"}]),
            )
            .unwrap();
        assert!(changed);
        assert_eq!(
            value,
            json!([{
                "id": "4",
                "tags": ["a", "b"],
                "templateContent": "x",
                "content": "Hi {{ name }} {{name}} {{team}}",
                "folderId": null,
                "variables": ["name", "team"],
                "version": 3
            }])
        );

        let (again, changed) = chain.upgrade_value(CanonicalKey::Templates, value.clone()).unwrap();
        assert!(!changed);
        assert_eq!(again, value);
    }

    #[test]
    fn workflow_steps_and_preferences_upgrade() {
        let chain = default_chain();
        let (workflows, _) = chain
            .upgrade_value(
                CanonicalKey::Workflows,
                json!([{"id": "w", "steps": [{"template": 5}, {"templateId": "t"}]}]),
            )
            .unwrap();
        assert_eq!(
            workflows[0]["steps"],
            json!([{"order": 0, "templateId": "5"}, {"order": 1, "templateId": "t"}])
        );

        let (prefs, _) = chain
            .upgrade_value(CanonicalKey::UiPreferences, json!({"darkMode": true, "version": 2}))
            .unwrap();
        assert_eq!(prefs, json!({"theme": "dark", "version": 3}));
    }

    #[test]
    fn failing_step_surfaces_transform_error() {
        let chain = default_chain();
        let err = chain
            .upgrade_value(
                CanonicalKey::Workflows,
                json!([{"id": "w", "version": 2, "steps": ["bad"]}]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::Transform {
                from_version: 2,
                to_version: 3,
                ..
            }
        ));
    }

    #[test]
    fn chain_validation_rejects_gaps_and_duplicates() {
        let chain = TransformChain::new(3)
            .with_step(TransformStep::new(1, 2, "a", |_, _| Ok(())))
            .unwrap();
        assert!(chain.resolve_chain(1).is_err());
        assert!(chain.clone().with_step(TransformStep::new(1, 3, "b", |_, _| Ok(()))).is_err());
        assert!(TransformChain::new(2).with_step(TransformStep::new(2, 4, "c", |_, _| Ok(()))).is_err());
    }

    #[test]
    fn newer_records_are_left_alone() {
        let chain = default_chain();
        let (value, changed) = chain
            .upgrade_value(CanonicalKey::Snippets, json!([{"id": "s", "version": 9}]))
            .unwrap();
        assert!(!changed);
        assert_eq!(value, json!([{"id": "s", "version": 9}]));
    }
}
