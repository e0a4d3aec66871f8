use super::versioning::CURRENT_SCHEMA_VERSION;
use crate::core::CanonicalKey;
use serde_json::{Value, json};

/// Built-in value returned when a dataset has never been written.
pub fn default_value(key: CanonicalKey) -> Value {
    match key {
        CanonicalKey::Templates
        | CanonicalKey::Workflows
        | CanonicalKey::Snippets
        | CanonicalKey::Folders => Value::Array(Vec::new()),
        CanonicalKey::UiPreferences => json!({
            "theme": "light",
            "fontSize": 14,
            "sidebarCollapsed": false,
            "version": CURRENT_SCHEMA_VERSION,
        }),
        CanonicalKey::UserSettings => json!({
            "language": "en",
            "autoSave": true,
            "syncEnabled": true,
            "version": CURRENT_SCHEMA_VERSION,
        }),
    }
}
