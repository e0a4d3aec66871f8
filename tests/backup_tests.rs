use serde_json::json;
use vaultsync::backup::IncrementalBackupOutcome;
use vaultsync::{
    BackupType, CanonicalKey, GetOptions, RestoreOptions, Vault, VaultConfig, VaultError,
};

async fn vault(config: VaultConfig) -> Vault {
    let vault = Vault::in_memory(config).await.unwrap();
    vault.initialize().await.unwrap();
    vault
}

#[tokio::test]
async fn retention_drops_the_earliest_backup() {
    let mut config = VaultConfig::default();
    config.backup.max_backups = 3;
    let vault = vault(config).await;

    let mut ids = Vec::new();
    for n in 0..4 {
        vault
            .compat()
            .set(CanonicalKey::Snippets, json!([{"id": format!("s{n}"), "content": "x"}]))
            .await
            .unwrap();
        ids.push(
            vault
                .backups()
                .create_full_backup(&format!("backup {n}"))
                .await
                .unwrap()
                .id,
        );
    }

    let listed = vault.backups().list_backups().await.unwrap();
    assert_eq!(listed.len(), 3);
    assert!(listed.iter().all(|meta| meta.id != ids[0]));
    assert_eq!(listed.last().unwrap().id, ids[3]);
    assert!(matches!(
        vault.backups().verify_backup(&ids[0]).await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn restore_brings_back_cleared_templates() {
    let vault = vault(VaultConfig::default()).await;
    vault
        .compat()
        .set(CanonicalKey::Templates, json!([{"id": "1", "name": "A"}]))
        .await
        .unwrap();
    let backup = vault.backups().create_full_backup("before clear").await.unwrap();

    vault
        .compat()
        .set(CanonicalKey::Templates, json!([]))
        .await
        .unwrap();
    let report = vault
        .backups()
        .restore_backup(&backup.id, &RestoreOptions::default())
        .await
        .unwrap();
    assert!(report.safety_backup_id.is_some());

    let templates = vault
        .compat()
        .get(CanonicalKey::Templates, &GetOptions::default())
        .await
        .unwrap();
    let templates = templates.as_array().unwrap();
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0]["id"], json!("1"));
    assert_eq!(templates[0]["name"], json!("A"));
}

#[tokio::test]
async fn encrypted_incremental_chain_restores() {
    let mut config = VaultConfig::default();
    config.backup.encryption_key = Some("42".repeat(32));
    let vault = vault(config).await;

    vault
        .compat()
        .set(CanonicalKey::Folders, json!([{"id": "f1", "name": "One"}]))
        .await
        .unwrap();
    let full = vault.backups().create_full_backup("base").await.unwrap();
    assert!(full.encrypted);

    vault
        .compat()
        .save(CanonicalKey::Folders, json!({"id": "f2", "name": "Two"}))
        .await
        .unwrap();
    let IncrementalBackupOutcome::Created(incremental) = vault
        .backups()
        .create_incremental_backup(None)
        .await
        .unwrap()
    else {
        panic!("expected an incremental backup");
    };
    assert_eq!(incremental.backup_type, BackupType::Incremental);
    assert_eq!(incremental.parent_id.as_deref(), Some(full.id.as_str()));
    assert!(vault.backups().verify_backup(&incremental.id).await.unwrap().valid);

    vault
        .compat()
        .set(CanonicalKey::Folders, json!([]))
        .await
        .unwrap();
    vault
        .backups()
        .restore_backup(
            &incremental.id,
            &RestoreOptions {
                safety_backup: false,
            },
        )
        .await
        .unwrap();

    let folders = vault
        .compat()
        .get(CanonicalKey::Folders, &GetOptions::default())
        .await
        .unwrap();
    let ids = folders
        .as_array()
        .unwrap()
        .iter()
        .map(|folder| folder["id"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["f1", "f2"]);
}
