//! Directory-backed durable store: one file per key, atomic replace on write.

use super::KvStore;
use crate::core::{Result, VaultError};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;

const ENTRY_EXTENSION: &str = "kv";

pub struct FileKvStore {
    name: String,
    root: PathBuf,
}

impl FileKvStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|err| {
            VaultError::Io(format!(
                "Failed to create store directory '{}': {}",
                root.display(),
                err
            ))
        })?;
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", encode_key(key), ENTRY_EXTENSION))
    }
}

/// Maps a key onto a portable file stem; `decode_key` reverses it.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = stem.get(idx + 1..idx + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl KvStore for FileKvStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(VaultError::Io(format!(
                "Failed to read '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let root = self.root.clone();
        let path = self.entry_path(key);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut temp = tempfile::NamedTempFile::new_in(&root).map_err(|err| {
                VaultError::Io(format!("Failed to create temp file: {}", err))
            })?;
            temp.write_all(&value)
                .map_err(|err| VaultError::Io(format!("Failed to write entry: {}", err)))?;
            temp.as_file()
                .sync_all()
                .map_err(|err| VaultError::Io(format!("Failed to sync entry: {}", err)))?;
            temp.persist(&path).map_err(|err| {
                VaultError::Io(format!(
                    "Failed to persist '{}': {}",
                    path.display(),
                    err.error
                ))
            })?;
            Ok(())
        })
        .await
        .map_err(|err| VaultError::Storage(format!("file store writer join: {}", err)))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(VaultError::Io(format!(
                "Failed to delete '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn size_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        for key in self.keys().await? {
            let metadata = fs::metadata(self.entry_path(&key)).await?;
            total += metadata.len() + key.len() as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn key_encoding_round_trips() {
        for key in ["templates", "backup_1f2e", "a/b c", "ключ"] {
            assert_eq!(decode_key(&encode_key(key)).as_deref(), Some(key));
        }
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileKvStore::open("durable", temp_dir.path()).await.unwrap();
            store.set("templates", b"[1,2]".to_vec()).await.unwrap();
            store.set("a/b", b"x".to_vec()).await.unwrap();
        }

        let store = FileKvStore::open("durable", temp_dir.path()).await.unwrap();
        assert_eq!(store.get("templates").await.unwrap(), Some(b"[1,2]".to_vec()));
        assert_eq!(store.keys().await.unwrap(), vec!["a/b", "templates"]);

        store.delete("templates").await.unwrap();
        store.delete("templates").await.unwrap();
        assert_eq!(store.get("templates").await.unwrap(), None);

        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }
}
