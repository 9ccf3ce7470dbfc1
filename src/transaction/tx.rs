// ============================================================================
// Read and Write Transactions
// ============================================================================
//
// A ReadTx owns an O(1) clone of the committed tree and never observes
// later commits. A WriteTx owns a private working tree: every mutation goes
// through `record`, which applies a Change to that tree and logs it. The
// store publishes the working tree and persists the log on commit, and drops
// both on rollback.
//
// ============================================================================

use super::{Change, TransactionId, TransactionState};
use crate::core::{Result, SessionError};
use crate::storage::bucket::Bucket;

/// Read-only view of the store at the moment the transaction began.
#[derive(Debug, Clone)]
pub struct ReadTx {
    id: TransactionId,
    root: Bucket,
}

impl ReadTx {
    pub(crate) fn new(id: TransactionId, root: Bucket) -> Self {
        Self { id, root }
    }

    /// Id of the last transaction visible to this view
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn root(&self) -> &Bucket {
        &self.root
    }

    /// Top-level bucket by name
    pub fn bucket(&self, name: &[u8]) -> Option<&Bucket> {
        self.root.bucket(name)
    }

    /// Nested bucket, e.g. `&["sessions".as_bytes(), sid.as_bytes()]`
    pub fn bucket_path(&self, path: &[&[u8]]) -> Option<&Bucket> {
        let mut current = &self.root;
        for name in path {
            current = current.bucket(name)?;
        }
        Some(current)
    }
}

/// A write transaction. Only one exists per store at a time.
#[derive(Debug)]
pub struct WriteTx {
    id: TransactionId,
    state: TransactionState,
    base: Bucket,
    root: Bucket,
    changes: Vec<Change>,
}

impl WriteTx {
    pub(crate) fn new(id: TransactionId, root: Bucket) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            base: root.clone(),
            root,
            changes: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// The working tree, including this transaction's own writes
    pub fn root(&self) -> &Bucket {
        &self.root
    }

    pub fn bucket(&self, name: &[u8]) -> Option<&Bucket> {
        self.root.bucket(name)
    }

    pub fn bucket_path(&self, path: &[&[u8]]) -> Option<&Bucket> {
        let mut current = &self.root;
        for name in path {
            current = current.bucket(name)?;
        }
        Some(current)
    }

    /// Writable handle on a top-level bucket
    pub fn bucket_mut(&mut self, name: &[u8]) -> Option<BucketMut<'_>> {
        self.child(vec![name.to_vec()])
    }

    /// Writable handle on a nested bucket
    pub fn bucket_path_mut(&mut self, path: &[&[u8]]) -> Option<BucketMut<'_>> {
        self.child(path.iter().map(|p| p.to_vec()).collect())
    }

    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_>> {
        self.create_child(Vec::new(), name, false)
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_>> {
        self.create_child(Vec::new(), name, true)
    }

    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.record(Change::DeleteBucket {
            parent: Vec::new(),
            name: name.to_vec(),
        })
    }

    /// Number of changes recorded so far
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Discards every change. The store commits nothing for a rolled back
    /// transaction, even if the closure that ran it returns `Ok`.
    pub fn rollback(&mut self) {
        self.root = self.base.clone();
        self.changes.clear();
        self.state = TransactionState::Aborted;
    }

    /// Consumes the transaction, yielding the working tree and its log.
    pub(crate) fn finish(mut self) -> (TransactionState, Bucket, Vec<Change>) {
        if self.state.is_active() {
            self.state = TransactionState::Committed;
        }
        (self.state, self.root, self.changes)
    }

    fn record(&mut self, change: Change) -> Result<()> {
        if !self.state.is_active() {
            return Err(SessionError::Bucket(format!(
                "Cannot record change: transaction {} is {}",
                self.id, self.state
            )));
        }

        change.apply(&mut self.root)?;
        self.changes.push(change);
        Ok(())
    }

    fn child(&mut self, path: Vec<Vec<u8>>) -> Option<BucketMut<'_>> {
        self.root.resolve(&path)?;
        Some(BucketMut { tx: self, path })
    }

    fn create_child(
        &mut self,
        parent: Vec<Vec<u8>>,
        name: &[u8],
        if_missing: bool,
    ) -> Result<BucketMut<'_>> {
        let mut path = parent.clone();
        path.push(name.to_vec());

        if !(if_missing && self.root.resolve(&path).is_some()) {
            self.record(Change::CreateBucket {
                parent,
                name: name.to_vec(),
            })?;
        }

        Ok(BucketMut { tx: self, path })
    }
}

/// Writable handle on one bucket of a [`WriteTx`].
#[derive(Debug)]
pub struct BucketMut<'tx> {
    tx: &'tx mut WriteTx,
    path: Vec<Vec<u8>>,
}

impl BucketMut<'_> {
    pub fn path(&self) -> &[Vec<u8>] {
        &self.path
    }

    /// The bucket as it currently looks inside the transaction
    pub fn view(&self) -> Option<&Bucket> {
        self.tx.root.resolve(&self.path)
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.view()?.get(key)
    }

    pub fn key_count(&self) -> usize {
        self.view().map_or(0, Bucket::key_count)
    }

    pub fn bucket(&self, name: &[u8]) -> Option<&Bucket> {
        self.view()?.bucket(name)
    }

    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.tx.record(Change::Put {
            parent: self.path.clone(),
            key: key.to_vec(),
            value,
        })
    }

    /// Removes a key. Nothing is logged when the key is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if self.get(key).is_none() {
            return Ok(false);
        }

        self.tx.record(Change::Delete {
            parent: self.path.clone(),
            key: key.to_vec(),
        })?;
        Ok(true)
    }

    /// Removes every key, leaving child buckets alone.
    pub fn clear(&mut self) -> Result<usize> {
        let keys: Vec<Vec<u8>> = match self.view() {
            Some(bucket) => bucket.iter().map(|(k, _)| k.to_vec()).collect(),
            None => return Ok(0),
        };

        for key in &keys {
            self.tx.record(Change::Delete {
                parent: self.path.clone(),
                key: key.clone(),
            })?;
        }
        Ok(keys.len())
    }

    pub fn bucket_mut(&mut self, name: &[u8]) -> Option<BucketMut<'_>> {
        let path = self.child_path(name);
        self.tx.child(path)
    }

    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_>> {
        self.tx.create_child(self.path.clone(), name, false)
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_>> {
        self.tx.create_child(self.path.clone(), name, true)
    }

    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.tx.record(Change::DeleteBucket {
            parent: self.path.clone(),
            name: name.to_vec(),
        })
    }

    /// Drops a child bucket if present, reporting whether it was.
    pub fn delete_bucket_if_exists(&mut self, name: &[u8]) -> Result<bool> {
        if self.bucket(name).is_none() {
            return Ok(false);
        }
        self.delete_bucket(name)?;
        Ok(true)
    }

    fn child_path(&self, name: &[u8]) -> Vec<Vec<u8>> {
        let mut path = self.path.clone();
        path.push(name.to_vec());
        path
    }
}
