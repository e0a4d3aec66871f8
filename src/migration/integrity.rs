//! Post-migration integrity rules over all canonical datasets.

use crate::core::{CanonicalKey, record_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueKind {
    MissingField,
    DuplicateId,
    DanglingReference,
    InvalidShape,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub kind: IntegrityIssueKind,
    pub key: CanonicalKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub valid: bool,
    pub checked_records: usize,
    pub issues: Vec<IntegrityIssue>,
}

/// Fields every record of `key` must carry. Templates may be untitled.
pub fn required_fields(key: CanonicalKey) -> &'static [&'static str] {
    match key {
        CanonicalKey::Templates => &["id"],
        CanonicalKey::Workflows | CanonicalKey::Folders => &["id", "name"],
        CanonicalKey::Snippets => &["id", "content"],
        CanonicalKey::UiPreferences | CanonicalKey::UserSettings => &[],
    }
}

/// Runs required-field, duplicate-identity, shape and reference checks.
///
/// Datasets absent from `datasets` are treated as empty.
pub fn check_integrity(datasets: &BTreeMap<CanonicalKey, Value>) -> IntegrityReport {
    let mut issues = Vec::new();
    let mut checked_records = 0usize;
    let mut ids: BTreeMap<CanonicalKey, HashSet<String>> = BTreeMap::new();

    for (key, value) in datasets {
        if !key.is_collection() {
            if !value.is_object() {
                issues.push(IntegrityIssue {
                    kind: IntegrityIssueKind::InvalidShape,
                    key: *key,
                    entity_id: None,
                    field: None,
                    message: format!("'{}' should be an object", key),
                });
            }
            continue;
        }

        let Some(records) = value.as_array() else {
            issues.push(IntegrityIssue {
                kind: IntegrityIssueKind::InvalidShape,
                key: *key,
                entity_id: None,
                field: None,
                message: format!("'{}' should be an array", key),
            });
            continue;
        };

        let seen = ids.entry(*key).or_default();
        for (index, record) in records.iter().enumerate() {
            checked_records += 1;
            if !record.is_object() {
                issues.push(IntegrityIssue {
                    kind: IntegrityIssueKind::InvalidShape,
                    key: *key,
                    entity_id: None,
                    field: None,
                    message: format!("{} entry {} is not an object", key.entity_type(), index),
                });
                continue;
            }
            let id = record_id(record);
            for field in required_fields(*key) {
                let present = match *field {
                    "id" => id.is_some(),
                    other => record.get(other).is_some_and(|value| !value.is_null()),
                };
                if !present {
                    issues.push(IntegrityIssue {
                        kind: IntegrityIssueKind::MissingField,
                        key: *key,
                        entity_id: id.clone(),
                        field: Some((*field).to_string()),
                        message: format!(
                            "{} entry {} is missing '{}'",
                            key.entity_type(),
                            index,
                            field
                        ),
                    });
                }
            }
            if let Some(id) = id {
                if !seen.insert(id.clone()) {
                    issues.push(IntegrityIssue {
                        kind: IntegrityIssueKind::DuplicateId,
                        key: *key,
                        entity_id: Some(id.clone()),
                        field: Some("id".to_string()),
                        message: format!("duplicate {} id '{}'", key.entity_type(), id),
                    });
                }
            }
        }
    }

    let empty = HashSet::new();
    let folders = ids.get(&CanonicalKey::Folders).unwrap_or(&empty);
    let templates = ids.get(&CanonicalKey::Templates).unwrap_or(&empty);

    let folder_links = [
        (CanonicalKey::Templates, "folderId"),
        (CanonicalKey::Snippets, "folderId"),
        (CanonicalKey::Folders, "parentId"),
    ];
    for (key, field) in folder_links {
        for record in records_of(datasets, key) {
            let Some(reference) = reference_id(record.get(field)) else {
                continue;
            };
            if !folders.contains(&reference) {
                let entity_id = record_id(record);
                issues.push(IntegrityIssue {
                    kind: IntegrityIssueKind::DanglingReference,
                    key,
                    message: format!(
                        "{} '{}' references missing folder '{}'",
                        key.entity_type(),
                        entity_id.as_deref().unwrap_or_default(),
                        reference
                    ),
                    entity_id,
                    field: Some(field.to_string()),
                });
            }
        }
    }

    for workflow in records_of(datasets, CanonicalKey::Workflows) {
        let Some(steps) = workflow.get("steps").and_then(Value::as_array) else {
            continue;
        };
        for step in steps {
            let Some(reference) = reference_id(step.get("templateId")) else {
                continue;
            };
            if !templates.contains(&reference) {
                issues.push(IntegrityIssue {
                    kind: IntegrityIssueKind::DanglingReference,
                    key: CanonicalKey::Workflows,
                    entity_id: record_id(workflow),
                    field: Some("steps.templateId".to_string()),
                    message: format!(
                        "workflow '{}' step references missing template '{}'",
                        record_id(workflow).unwrap_or_default(),
                        reference
                    ),
                });
            }
        }
    }

    IntegrityReport {
        valid: issues.is_empty(),
        checked_records,
        issues,
    }
}

fn records_of(datasets: &BTreeMap<CanonicalKey, Value>, key: CanonicalKey) -> &[Value] {
    datasets
        .get(&key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn reference_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
