use crate::core::{Result, VaultError};
use serde::{Deserialize, Serialize};

pub fn manifest_key(key: &str) -> String {
    format!("{}_manifest", key)
}

pub fn chunk_key(key: &str, index: usize) -> String {
    format!("{}_chunk_{}", key, index)
}

/// Index record for a distributed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkManifest {
    /// Chunk keys in reconstruction order.
    pub chunks: Vec<String>,
    pub total_size: usize,
    pub chunk_size: usize,
    pub created_at: i64,
}

/// Splits `payload` into `chunk_size` pieces keyed `key_chunk_i`.
pub fn split_into_chunks(
    key: &str,
    payload: &[u8],
    chunk_size: usize,
    created_at: i64,
) -> (ChunkManifest, Vec<(String, Vec<u8>)>) {
    let chunk_size = chunk_size.max(1);
    let pieces = payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, piece)| (chunk_key(key, index), piece.to_vec()))
        .collect::<Vec<_>>();
    let manifest = ChunkManifest {
        chunks: pieces.iter().map(|(chunk, _)| chunk.clone()).collect(),
        total_size: payload.len(),
        chunk_size,
        created_at,
    };
    (manifest, pieces)
}

/// Concatenates chunks in manifest order and checks the total size.
pub fn reassemble(manifest: &ChunkManifest, pieces: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    if pieces.len() != manifest.chunks.len() {
        return Err(VaultError::Storage(format!(
            "manifest lists {} chunks, found {}",
            manifest.chunks.len(),
            pieces.len()
        )));
    }
    let mut payload = Vec::with_capacity(manifest.total_size);
    for piece in pieces {
        payload.extend_from_slice(&piece);
    }
    if payload.len() != manifest.total_size {
        return Err(VaultError::Storage(format!(
            "reassembled {} bytes, manifest expects {}",
            payload.len(),
            manifest.total_size
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_uses_indexed_keys_and_last_partial_chunk() {
        let payload = (0..10u8).collect::<Vec<_>>();
        let (manifest, pieces) = split_into_chunks("templates", &payload, 4, 7);
        assert_eq!(
            manifest.chunks,
            vec!["templates_chunk_0", "templates_chunk_1", "templates_chunk_2"]
        );
        assert_eq!(pieces[2].1, vec![8, 9]);
        assert_eq!(manifest.total_size, 10);

        let rebuilt = reassemble(&manifest, pieces.into_iter().map(|(_, p)| p).collect()).unwrap();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn missing_chunk_is_an_error() {
        let (manifest, mut pieces) = split_into_chunks("k", b"abcdef", 2, 0);
        pieces.pop();
        assert!(reassemble(&manifest, pieces.into_iter().map(|(_, p)| p).collect()).is_err());
        assert_eq!(manifest_key("k"), "k_manifest");
    }
}
