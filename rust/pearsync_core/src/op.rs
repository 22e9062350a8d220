//! Log operations and the manifest value type.
//!
//! Every block in a writer's log carries exactly one [`Operation`],
//! bincode-serialized. `put`/`del` mutate the path manifest; the writer
//! membership ops are consumed by the writer set. File content is embedded
//! in the operation so a block and its content replicate (and verify)
//! atomically.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::keys::KEY_LEN;

#[derive(Debug, Error)]
pub enum OpError {
    #[error("operation codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Metadata (and content) stored in the manifest under a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Whole file content, embedded.
    pub content: Vec<u8>,
    /// Content length in bytes.
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch.
    pub mtime_ms: u64,
    /// Unix permission bits.
    pub mode: u32,
    /// SHA-256 of `content`.
    pub hash: [u8; 32],
    /// Public key of the writer that authored this entry.
    pub author: [u8; KEY_LEN],
}

impl FileMeta {
    /// Build a `FileMeta` from raw content, computing size and hash.
    pub fn from_content(
        content: Vec<u8>,
        mtime_ms: u64,
        mode: u32,
        author: [u8; KEY_LEN],
    ) -> Self {
        let size = content.len() as u64;
        let hash = content_hash(&content);
        Self {
            content,
            size,
            mtime_ms,
            mode,
            hash,
            author,
        }
    }
}

/// The tagged payload of a log block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Upsert a path in the manifest.
    Put { path: String, meta: FileMeta },
    /// Remove a path from the manifest.
    Del { path: String },
    /// Admit a new writer. Valid only when authored by a current member.
    AddWriter { writer: [u8; KEY_LEN] },
    /// Revoke a writer. Valid only when self-authored.
    RemoveWriter { writer: [u8; KEY_LEN] },
}

impl Operation {
    /// Serialize for storage in a log block.
    pub fn encode(&self) -> Result<Vec<u8>, OpError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a block payload.
    ///
    /// Callers that fold the log must treat a decode failure as a no-op
    /// rather than an error: a log must never poison the view.
    pub fn decode(bytes: &[u8]) -> Result<Self, OpError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// SHA-256 of file content, as stored in [`FileMeta::hash`].
pub fn content_hash(content: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(content);
    h.finalize().into()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> FileMeta {
        FileMeta::from_content(b"hello world".to_vec(), 1_700_000_000_123, 0o644, [7; 32])
    }

    #[test]
    fn from_content_fills_derived_fields() {
        let meta = sample_meta();
        assert_eq!(meta.size, 11);
        assert_eq!(meta.hash, content_hash(b"hello world"));
        assert_eq!(meta.mode, 0o644);
    }

    #[test]
    fn op_codec_round_trip() {
        let ops = vec![
            Operation::Put {
                path: "dir/file.txt".into(),
                meta: sample_meta(),
            },
            Operation::Del {
                path: "gone.txt".into(),
            },
            Operation::AddWriter { writer: [1; 32] },
            Operation::RemoveWriter { writer: [2; 32] },
        ];
        for op in ops {
            let bytes = op.encode().unwrap();
            assert_eq!(Operation::decode(&bytes).unwrap(), op);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Operation::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn hash_changes_with_content() {
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
        assert_eq!(content_hash(b""), content_hash(b""));
    }
}
