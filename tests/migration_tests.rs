use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vaultsync::compat::default_chain;
use vaultsync::migration::IntegrityIssueKind;
use vaultsync::{
    CanonicalKey, KvStore, LegacyAdapter, MemoryKvStore, MigrationPhase, MigrationPolicy,
    MigrationService, RunOptions, RunReason, StorageFacade, Vault, VaultConfig, VaultError,
    WriteFlags, spawn_migration_worker,
};

async fn vault_with_legacy(config: VaultConfig) -> (Vault, Arc<MemoryKvStore>) {
    let legacy = Arc::new(MemoryKvStore::new("legacy"));
    let vault = Vault::builder(config)
        .with_legacy_store(legacy.clone())
        .build()
        .await
        .unwrap();
    vault.initialize().await.unwrap();
    (vault, legacy)
}

async fn seed_legacy(legacy: &MemoryKvStore) {
    legacy
        .set(
            "pv_templates_old",
            serde_json::to_vec(&json!({"items": [
                {"id": 7, "name": "Greeting", "template_content": "Hello {{who}}", "tags": "a,b"}
            ]}))
            .unwrap(),
        )
        .await
        .unwrap();
    legacy
        .set(
            "app_folders",
            serde_json::to_vec(&json!([{"id": "f1", "name": "Inbox", "parent_id": null}])).unwrap(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn second_run_migrates_nothing() {
    let (vault, legacy) = vault_with_legacy(VaultConfig::default()).await;
    seed_legacy(&legacy).await;

    let first = vault
        .migrations()
        .run_pending_migrations(&RunOptions::default())
        .await
        .unwrap();
    assert!(first.success);
    assert!(first.migrated_count > 0);
    assert_eq!(first.to_version, 3);

    let second = vault
        .migrations()
        .run_pending_migrations(&RunOptions::default())
        .await
        .unwrap();
    assert_eq!(second.reason, RunReason::NoneNeeded);
    assert_eq!(second.migrated_count, 0);

    let templates = vault
        .facade()
        .get_value("templates")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(templates[0]["id"], json!("7"));
    assert_eq!(templates[0]["tags"], json!(["a", "b"]));
    assert_eq!(templates[0]["variables"], json!(["who"]));
    assert_eq!(templates[0]["version"], json!(3));
    assert!(legacy.is_empty().await);
}

#[tokio::test]
async fn dangling_folder_reference_is_reported_once() {
    let (vault, _) = vault_with_legacy(VaultConfig::default()).await;
    vault
        .compat()
        .set(
            CanonicalKey::Templates,
            json!([{"id": "tpl-1", "folderId": "missing"}]),
        )
        .await
        .unwrap();
    vault
        .compat()
        .set(CanonicalKey::Folders, json!([]))
        .await
        .unwrap();

    let report = vault.migrations().perform_integrity_check().await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, IntegrityIssueKind::DanglingReference);
    assert_eq!(report.issues[0].entity_id.as_deref(), Some("tpl-1"));
}

#[tokio::test]
async fn invalid_result_rolls_back_to_pre_run_state() {
    let (vault, legacy) = vault_with_legacy(VaultConfig::default()).await;
    legacy
        .set(
            "snippets",
            serde_json::to_vec(&json!([{"id": "s1", "content": "x", "folder_id": "nowhere"}])).unwrap(),
        )
        .await
        .unwrap();

    let err = vault
        .migrations()
        .run_pending_migrations(&RunOptions::default())
        .await
        .unwrap_err();
    let (run_id, rolled_back) = match err {
        VaultError::MigrationFailed {
            run_id,
            rolled_back,
            ..
        } => (run_id, rolled_back),
        other => panic!("expected a migration failure, got {other}"),
    };
    assert!(rolled_back);
    assert_eq!(vault.migrations().phase(), MigrationPhase::Idle);

    // The recovered dataset survives the rollback even though its legacy key is gone.
    let snippets = vault.facade().get_value("snippets").await.unwrap().unwrap();
    assert_eq!(snippets[0]["id"], json!("s1"));
    assert!(legacy.is_empty().await);

    let history = vault.migrations().history().await.unwrap();
    assert_eq!(history.last().unwrap().run_id, run_id);
    assert_eq!(history.last().unwrap().reason, RunReason::RolledBack);
}

#[tokio::test]
async fn background_worker_picks_up_pending_work() {
    let (vault, legacy) = vault_with_legacy(VaultConfig::default()).await;
    seed_legacy(&legacy).await;

    let worker = spawn_migration_worker(vault.migrations().clone(), 10);
    let mut done = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = vault.migrations().check_migration_status().await.unwrap();
        if !status.needed && vault.migrations().phase() == MigrationPhase::Idle {
            done = true;
            break;
        }
    }
    worker.stop().await.unwrap();
    assert!(done);
    assert_eq!(vault.migrations().history().await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_failing_runs_keep_user_backups() {
    let mut config = VaultConfig::default();
    config.backup.max_backups = 3;
    let (vault, legacy) = vault_with_legacy(config).await;
    legacy
        .set(
            "snippets",
            serde_json::to_vec(&json!([{"id": "s1", "content": "x", "folder_id": "nowhere"}])).unwrap(),
        )
        .await
        .unwrap();
    let manual = vault.backups().create_full_backup("my backup").await.unwrap();

    assert!(matches!(
        vault
            .migrations()
            .run_pending_migrations(&RunOptions::default())
            .await,
        Err(VaultError::MigrationFailed { rolled_back: true, .. })
    ));
    for _ in 0..3 {
        let run = vault
            .migrations()
            .run_pending_migrations(&RunOptions::default())
            .await
            .unwrap();
        assert_eq!(run.reason, RunReason::Blocked);
    }

    let listed = vault.backups().list_backups().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|meta| meta.id == manual.id));
    let status = vault.migrations().check_migration_status().await.unwrap();
    assert!(status.needed);
    assert!(status.blocked.is_some());
}

#[tokio::test]
async fn run_without_backup_service_is_refused() {
    let facade = Arc::new(StorageFacade::in_memory());
    facade
        .set("folders", json!([{"id": "f1", "name": "F", "version": 1}]), &WriteFlags::default())
        .await
        .unwrap();
    let legacy = Arc::new(LegacyAdapter::with_store(
        facade.clone(),
        Arc::new(MemoryKvStore::new("legacy")),
    ));
    let service = MigrationService::new(
        facade.clone(),
        legacy,
        default_chain(),
        MigrationPolicy::default(),
    );

    let err = service
        .run_pending_migrations(&RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
    assert_eq!(facade.get_value("schema_version").await.unwrap(), None);
}
