// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Every mutation a write transaction performs is recorded as a Change.
// The same Change is applied to the working tree while the transaction runs
// and replayed from the write-ahead log during recovery, so both paths share
// one code path.
//
// ============================================================================

use crate::core::{Result, SessionError};
use crate::storage::bucket::{Bucket, display_path};
use serde::{Deserialize, Serialize};

/// A single mutation of the bucket tree.
///
/// `parent` is the path of the bucket the operation targets, starting from
/// the root. An empty path addresses the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// Create an empty child bucket
    CreateBucket { parent: Vec<Vec<u8>>, name: Vec<u8> },

    /// Drop a child bucket with everything below it
    DeleteBucket { parent: Vec<Vec<u8>>, name: Vec<u8> },

    /// Insert or overwrite a key
    Put {
        parent: Vec<Vec<u8>>,
        key: Vec<u8>,
        value: Vec<u8>,
    },

    /// Remove a key
    Delete { parent: Vec<Vec<u8>>, key: Vec<u8> },
}

impl Change {
    /// Path of the bucket this change targets
    pub fn parent(&self) -> &[Vec<u8>] {
        match self {
            Change::CreateBucket { parent, .. }
            | Change::DeleteBucket { parent, .. }
            | Change::Put { parent, .. }
            | Change::Delete { parent, .. } => parent,
        }
    }

    /// Check if this change creates or drops a bucket
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Change::CreateBucket { .. } | Change::DeleteBucket { .. }
        )
    }

    /// Applies the change to `root`.
    ///
    /// Fails when the target bucket is missing, when creating a bucket that
    /// already exists, or when dropping one that does not.
    pub fn apply(&self, root: &mut Bucket) -> Result<()> {
        let target = root.resolve_mut(self.parent()).ok_or_else(|| {
            SessionError::Bucket(format!(
                "bucket path '{}' not found",
                display_path(self.parent())
            ))
        })?;

        match self {
            Change::CreateBucket { name, .. } => target.create_bucket(name.clone()),
            Change::DeleteBucket { name, .. } => target.delete_bucket(name),
            Change::Put { key, value, .. } => {
                target.put(key.clone(), value.clone());
                Ok(())
            }
            Change::Delete { key, .. } => {
                target.remove(key);
                Ok(())
            }
        }
    }
}
