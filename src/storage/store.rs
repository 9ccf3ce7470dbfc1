//! Transactional bucket store backed by a snapshot file and a write-ahead log.
//!
//! Readers clone the committed tree (O(1), see [`Bucket`]) and never block
//! the writer. Writers are serialized by a mutex; a write transaction either
//! publishes all of its changes or none of them.

use crate::core::{Result, SessionError};
use crate::storage::bucket::Bucket;
use crate::storage::persistence::{DurabilityMode, PersistenceManager, WalEntry};
use crate::transaction::{ReadTx, TransactionId, TransactionState, WriteTx};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, info_span, warn};

/// Options for [`BucketStore::open`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub durability: DurabilityMode,
    /// Commits between automatic checkpoints; zero disables them
    pub checkpoint_threshold: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::default(),
            checkpoint_threshold: 1000,
        }
    }
}

impl StoreOptions {
    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    pub fn checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub last_tx_id: TransactionId,
    pub root_buckets: usize,
    pub wal_entries_since_checkpoint: usize,
}

struct Committed {
    root: Bucket,
    last_tx_id: TransactionId,
}

struct Writer {
    persistence: PersistenceManager,
}

pub struct BucketStore {
    path: PathBuf,
    committed: RwLock<Committed>,
    writer: Mutex<Writer>,
    closed: AtomicBool,
}

impl BucketStore {
    /// Opens (or creates) the store at `path` and replays its log.
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _span = info_span!("bucket_store_open", path = %path.display()).entered();

        let mut persistence = PersistenceManager::new(&path, options.durability)?;
        persistence
            .wal_mut()
            .set_checkpoint_threshold(options.checkpoint_threshold);

        let (root, last_tx_id) = persistence.recover()?.unwrap_or_default();
        info!(
            %last_tx_id,
            buckets = root.bucket_count(),
            durability = ?options.durability,
            "bucket store opened"
        );

        Ok(Self {
            path,
            committed: RwLock::new(Committed { root, last_tx_id }),
            writer: Mutex::new(Writer { persistence }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` against a consistent view of the last committed state.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTx) -> Result<T>,
    {
        self.ensure_open()?;
        let tx = {
            let committed = self.committed.read()?;
            ReadTx::new(committed.last_tx_id, committed.root.clone())
        };
        f(&tx)
    }

    /// Runs `f` in a write transaction.
    ///
    /// The changes are logged and published when `f` returns `Ok`. An `Err`
    /// (or a call to [`WriteTx::rollback`]) discards them.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTx) -> Result<T>,
    {
        let mut writer = self.writer.lock()?;
        self.ensure_open()?;

        let (base, tx_id) = {
            let committed = self.committed.read()?;
            (committed.root.clone(), committed.last_tx_id.next())
        };

        let mut tx = WriteTx::new(tx_id, base);
        let out = f(&mut tx)?;

        let (state, root, changes) = tx.finish();
        if state == TransactionState::Aborted || changes.is_empty() {
            return Ok(out);
        }

        writer.persistence.log(&WalEntry::new(tx_id, changes))?;

        let checkpoint_root = writer.persistence.needs_checkpoint().then(|| root.clone());
        {
            let mut committed = self.committed.write()?;
            committed.root = root;
            committed.last_tx_id = tx_id;
        }

        if let Some(root) = checkpoint_root {
            // The commit is already durable in the log; a failed checkpoint
            // only postpones compaction
            if let Err(e) = writer.persistence.checkpoint(&root, tx_id) {
                warn!(error = %e, "automatic checkpoint failed");
            }
        }

        Ok(out)
    }

    /// Writes a snapshot of the committed state and empties the log.
    pub fn checkpoint(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        self.ensure_open()?;
        self.checkpoint_locked(&mut writer)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let writer = self.writer.lock()?;
        let committed = self.committed.read()?;
        Ok(StoreStats {
            last_tx_id: committed.last_tx_id,
            root_buckets: committed.root.bucket_count(),
            wal_entries_since_checkpoint: writer.persistence.wal().entries_since_checkpoint(),
        })
    }

    /// Checkpoints and refuses further transactions. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.checkpoint_locked(&mut writer)?;
        debug!(path = %self.path.display(), "bucket store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn checkpoint_locked(&self, writer: &mut Writer) -> Result<()> {
        let (root, last_tx_id) = {
            let committed = self.committed.read()?;
            (committed.root.clone(), committed.last_tx_id)
        };
        writer.persistence.checkpoint(&root, last_tx_id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

impl Drop for BucketStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, path = %self.path.display(), "failed to close bucket store");
        }
    }
}

impl std::fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStore")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> BucketStore {
        BucketStore::open(dir.path().join("store.db"), StoreOptions::default()).unwrap()
    }

    #[test]
    fn test_update_then_view() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store
            .update(|tx| {
                tx.create_bucket(b"sessions")?.put(b"k", b"v".to_vec())?;
                Ok(())
            })
            .unwrap();

        let value = store
            .view(|tx| Ok(tx.bucket(b"sessions").and_then(|b| b.get(b"k")).map(<[u8]>::to_vec)))
            .unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
        assert_eq!(store.stats().unwrap().last_tx_id, TransactionId(1));
    }

    #[test]
    fn test_failed_update_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let result: Result<()> = store.update(|tx| {
            tx.create_bucket(b"partial")?;
            Err(SessionError::Bucket("boom".into()))
        });
        assert!(result.is_err());

        let present = store.view(|tx| Ok(tx.bucket(b"partial").is_some())).unwrap();
        assert!(!present);
        assert_eq!(store.stats().unwrap().last_tx_id, TransactionId(0));
    }

    #[test]
    fn test_explicit_rollback_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let answer = store
            .update(|tx| {
                tx.create_bucket(b"temp")?;
                tx.rollback();
                Ok(42)
            })
            .unwrap();

        assert_eq!(answer, 42);
        assert_eq!(store.stats().unwrap().root_buckets, 0);
    }

    #[test]
    fn test_view_is_a_stable_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store
            .update(|tx| tx.create_bucket(b"a").map(|_| ()))
            .unwrap();

        store
            .view(|snapshot| {
                store.update(|tx| tx.create_bucket(b"b").map(|_| ()))?;
                assert!(snapshot.bucket(b"b").is_none());
                Ok(())
            })
            .unwrap();

        assert!(store.view(|tx| Ok(tx.bucket(b"b").is_some())).unwrap());
    }

    #[test]
    fn test_reopen_recovers_commits() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store
                .update(|tx| {
                    tx.create_bucket(b"sessions")?.put(b"k", b"v".to_vec())?;
                    Ok(())
                })
                .unwrap();
        }

        let store = open(&dir);
        let value = store
            .view(|tx| Ok(tx.bucket(b"sessions").and_then(|b| b.get(b"k")).map(<[u8]>::to_vec)))
            .unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
        assert_eq!(store.stats().unwrap().last_tx_id, TransactionId(1));
    }

    #[test]
    fn test_automatic_checkpoint() {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions::default().checkpoint_threshold(3);
        let store = BucketStore::open(dir.path().join("store.db"), options).unwrap();

        for i in 0..4u8 {
            store
                .update(|tx| tx.create_bucket(&[i]).map(|_| ()))
                .unwrap();
        }

        assert_eq!(store.stats().unwrap().wal_entries_since_checkpoint, 1);
    }

    #[test]
    fn test_closed_store_rejects_transactions() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.close().unwrap();
        store.close().unwrap();

        assert!(matches!(store.view(|_| Ok(())), Err(SessionError::Closed)));
        assert!(matches!(store.update(|_| Ok(())), Err(SessionError::Closed)));
    }
}
