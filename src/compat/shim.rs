use super::{CompatibilityLayer, GetOptions};
use crate::core::{CanonicalKey, Result, VaultError, record_id};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Level, event};

/// Legacy method names routed to each collection: (get, save, delete).
const COLLECTION_METHODS: [(&str, &str, &str, CanonicalKey); 4] = [
    ("getTemplates", "saveTemplate", "deleteTemplate", CanonicalKey::Templates),
    ("getWorkflows", "saveWorkflow", "deleteWorkflow", CanonicalKey::Workflows),
    ("getSnippets", "saveSnippet", "deleteSnippet", CanonicalKey::Snippets),
    ("getFolders", "saveFolder", "deleteFolder", CanonicalKey::Folders),
];

const OBJECT_METHODS: [(&str, &str, CanonicalKey); 2] = [
    ("getSettings", "saveSettings", CanonicalKey::UserSettings),
    ("getPreferences", "savePreferences", CanonicalKey::UiPreferences),
];

/// Fixed set of legacy call signatures delegating to the compatibility layer.
pub struct LegacyApiShim {
    compat: Arc<CompatibilityLayer>,
}

impl LegacyApiShim {
    pub fn new(compat: Arc<CompatibilityLayer>) -> Self {
        Self { compat }
    }

    pub async fn get_templates(&self) -> Result<Value> {
        self.list(CanonicalKey::Templates).await
    }

    pub async fn save_template(&self, template: Value) -> Result<Value> {
        self.compat.save(CanonicalKey::Templates, template).await
    }

    pub async fn delete_template(&self, id: &str) -> Result<bool> {
        self.compat.delete(CanonicalKey::Templates, id).await
    }

    pub async fn get_workflows(&self) -> Result<Value> {
        self.list(CanonicalKey::Workflows).await
    }

    pub async fn save_workflow(&self, workflow: Value) -> Result<Value> {
        self.compat.save(CanonicalKey::Workflows, workflow).await
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        self.compat.delete(CanonicalKey::Workflows, id).await
    }

    pub async fn get_snippets(&self) -> Result<Value> {
        self.list(CanonicalKey::Snippets).await
    }

    pub async fn save_snippet(&self, snippet: Value) -> Result<Value> {
        self.compat.save(CanonicalKey::Snippets, snippet).await
    }

    pub async fn delete_snippet(&self, id: &str) -> Result<bool> {
        self.compat.delete(CanonicalKey::Snippets, id).await
    }

    pub async fn get_folders(&self) -> Result<Value> {
        self.list(CanonicalKey::Folders).await
    }

    pub async fn save_folder(&self, folder: Value) -> Result<Value> {
        self.compat.save(CanonicalKey::Folders, folder).await
    }

    pub async fn delete_folder(&self, id: &str) -> Result<bool> {
        self.compat.delete(CanonicalKey::Folders, id).await
    }

    pub async fn get_settings(&self) -> Result<Value> {
        self.list(CanonicalKey::UserSettings).await
    }

    pub async fn save_settings(&self, settings: Value) -> Result<Value> {
        self.merge_object(CanonicalKey::UserSettings, settings).await
    }

    pub async fn get_preferences(&self) -> Result<Value> {
        self.list(CanonicalKey::UiPreferences).await
    }

    pub async fn save_preferences(&self, preferences: Value) -> Result<Value> {
        self.merge_object(CanonicalKey::UiPreferences, preferences).await
    }

    async fn list(&self, key: CanonicalKey) -> Result<Value> {
        self.compat.get(key, &GetOptions::default()).await
    }

    /// Object datasets are saved field by field; new values win.
    async fn merge_object(&self, key: CanonicalKey, patch: Value) -> Result<Value> {
        let Value::Object(patch) = patch else {
            return Err(VaultError::Validation(format!("'{}' expects an object", key)));
        };
        let mut current = match self.list(key).await? {
            Value::Object(current) => current,
            _ => Default::default(),
        };
        current.extend(patch);
        self.compat.set(key, Value::Object(current)).await
    }

    /// Dispatches a legacy call by name. Unknown names are logged and yield `null`.
    pub async fn call(&self, method: &str, args: &[Value]) -> Result<Value> {
        for (get, save, delete, key) in COLLECTION_METHODS {
            if method == get {
                return self.list(key).await;
            }
            if method == save {
                let record = first_arg(method, args)?.clone();
                return self.compat.save(key, record).await;
            }
            if method == delete {
                let id = id_arg(method, args)?;
                return self.compat.delete(key, &id).await.map(Value::Bool);
            }
        }
        for (get, save, key) in OBJECT_METHODS {
            if method == get {
                return self.list(key).await;
            }
            if method == save {
                let patch = first_arg(method, args)?.clone();
                return self.merge_object(key, patch).await;
            }
        }

        event!(Level::WARN, method = %method, "unknown legacy API method");
        Ok(Value::Null)
    }
}

fn first_arg<'a>(method: &str, args: &'a [Value]) -> Result<&'a Value> {
    args.first()
        .ok_or_else(|| VaultError::Validation(format!("{} expects one argument", method)))
}

fn id_arg(method: &str, args: &[Value]) -> Result<String> {
    let arg = first_arg(method, args)?;
    match arg {
        Value::String(id) => Ok(id.clone()),
        Value::Number(id) => Ok(id.to_string()),
        Value::Object(_) => record_id(arg)
            .ok_or_else(|| VaultError::Validation(format!("{} expects an id", method))),
        _ => Err(VaultError::Validation(format!("{} expects an id", method))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::default_chain;
    use crate::config::CompatPolicy;
    use crate::legacy::LegacyAdapter;
    use crate::storage::StorageFacade;
    use serde_json::json;

    fn shim() -> LegacyApiShim {
        let facade = Arc::new(StorageFacade::in_memory());
        let legacy = Arc::new(LegacyAdapter::new(facade.clone()));
        LegacyApiShim::new(Arc::new(CompatibilityLayer::new(
            facade,
            legacy,
            default_chain(),
            CompatPolicy::default(),
        )))
    }

    #[tokio::test]
    async fn legacy_calls_reach_canonical_operations() {
        let shim = shim();
        let saved = shim
            .call("saveTemplate", &[json!({"id": "t1", "name": "T"})])
            .await
            .unwrap();
        assert_eq!(saved["id"], "t1");
        assert_eq!(shim.get_templates().await.unwrap().as_array().unwrap().len(), 1);

        assert_eq!(
            shim.call("deleteTemplate", &[json!("t1")]).await.unwrap(),
            json!(true)
        );
        assert_eq!(shim.call("getTemplates", &[]).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn unknown_methods_are_neutral() {
        let shim = shim();
        assert_eq!(shim.call("exportEverything", &[json!(1)]).await.unwrap(), Value::Null);
        assert!(shim.call("saveFolder", &[]).await.is_err());
    }

    #[tokio::test]
    async fn settings_are_merged() {
        let shim = shim();
        shim.save_settings(json!({"language": "de"})).await.unwrap();
        let settings = shim.call("getSettings", &[]).await.unwrap();
        assert_eq!(settings["language"], "de");
        assert_eq!(settings["autoSave"], true);
    }
}
