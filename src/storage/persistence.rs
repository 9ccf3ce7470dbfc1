//! Write-ahead logging and snapshots for the bucket store

use crate::core::{Result, SessionError};
use crate::storage::bucket::Bucket;
use crate::transaction::{Change, TransactionId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const SNAPSHOT_VERSION: u32 = 1;
const DEFAULT_CHECKPOINT_THRESHOLD: usize = 1000;

// ============================================================================
// WAL Entry
// ============================================================================

/// One committed write transaction.
///
/// A transaction is logged as a single framed record, so replay either sees
/// all of its changes or none of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub tx_id: u64,
    pub committed_at: i64,
    pub changes: Vec<Change>,
}

impl WalEntry {
    pub fn new(tx_id: TransactionId, changes: Vec<Change>) -> Self {
        Self {
            tx_id: tx_id.as_u64(),
            committed_at: Utc::now().timestamp_millis(),
            changes,
        }
    }
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    /// Every logged transaction up to and including this id is contained
    pub last_tx_id: u64,
    pub root: Bucket,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: i64,
    pub bucket_count: usize,
}

impl StoreSnapshot {
    pub fn new(root: Bucket, last_tx_id: TransactionId) -> Self {
        let bucket_count = root.bucket_count();
        Self {
            version: SNAPSHOT_VERSION,
            last_tx_id: last_tx_id.as_u64(),
            root,
            metadata: SnapshotMetadata {
                created_at: Utc::now().timestamp_millis(),
                bucket_count,
            },
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

/// How hard a commit pushes its log record towards the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every commit
    Sync,
    /// Flush to the OS after every commit
    #[default]
    Async,
    /// Keep everything in memory
    None,
}

// ============================================================================
// WAL Manager
// ============================================================================

/// Result of scanning the log.
#[derive(Debug, Default)]
pub struct WalScan {
    pub entries: Vec<WalEntry>,
    /// Length of the well-formed prefix of the file
    pub valid_len: u64,
    /// Whether a partially written record followed that prefix
    pub torn: bool,
}

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();

        let wal_file = if durability_mode != DurabilityMode::None {
            if let Some(parent) = wal_path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    SessionError::Io(format!("Failed to create WAL directory: {}", e))
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| SessionError::Io(format!("Failed to open WAL file: {}", e)))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
        })
    }

    /// Appends one record: a little-endian `u32` length, then the
    /// MessagePack-encoded entry.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }

        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| SessionError::Io("WAL file not initialized".to_string()))?;
        let serialized = rmp_serde::to_vec(entry).map_err(|e| {
            SessionError::Serialization(format!("Failed to serialize WAL entry: {}", e))
        })?;
        let len = u32::try_from(serialized.len()).map_err(|_| {
            SessionError::Serialization(format!(
                "WAL entry of {} bytes is too large",
                serialized.len()
            ))
        })?;

        file.write_all(&len.to_le_bytes())
            .and_then(|_| file.write_all(&serialized))
            .and_then(|_| file.flush())
            .map_err(|e| SessionError::Io(format!("Failed to write WAL: {}", e)))?;

        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_all()
                .map_err(|e| SessionError::Io(format!("Failed to sync WAL: {}", e)))?;
        }

        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Reads every complete record. A record cut short by a crash ends the
    /// scan instead of failing it; a complete record that does not decode is
    /// corruption and fails it.
    pub fn read_all(&self) -> Result<WalScan> {
        if !self.wal_path.exists() {
            return Ok(WalScan::default());
        }

        let file = File::open(&self.wal_path)
            .map_err(|e| SessionError::Io(format!("Failed to open WAL for reading: {}", e)))?;
        let file_len = file
            .metadata()
            .map_err(|e| SessionError::Io(format!("Failed to stat WAL: {}", e)))?
            .len();
        let mut reader = BufReader::new(file);
        let mut scan = WalScan::default();

        loop {
            let mut len_bytes = [0u8; 4];
            match read_frame(&mut reader, &mut len_bytes)? {
                Frame::Complete => {}
                Frame::Empty => break,
                Frame::Partial => {
                    scan.torn = true;
                    break;
                }
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            // A prefix running past the end of the file is a torn write
            if len as u64 > file_len.saturating_sub(scan.valid_len + 4) {
                scan.torn = true;
                break;
            }
            let mut data = vec![0u8; len];
            match read_frame(&mut reader, &mut data)? {
                Frame::Complete => {}
                Frame::Empty | Frame::Partial => {
                    scan.torn = true;
                    break;
                }
            }

            let entry: WalEntry = rmp_serde::from_slice(&data).map_err(|e| {
                SessionError::Serialization(format!(
                    "Failed to deserialize WAL entry at offset {}: {}",
                    scan.valid_len, e
                ))
            })?;
            scan.entries.push(entry);
            scan.valid_len += (4 + len) as u64;
        }

        Ok(scan)
    }

    /// Cuts the log back to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }

        let file = OpenOptions::new()
            .write(true)
            .open(&self.wal_path)
            .map_err(|e| SessionError::Io(format!("Failed to open WAL for truncation: {}", e)))?;
        file.set_len(len)
            .and_then(|_| file.sync_all())
            .map_err(|e| SessionError::Io(format!("Failed to truncate WAL: {}", e)))?;
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }

        self.wal_file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| SessionError::Io(format!("Failed to truncate WAL: {}", e)))?;
        drop(file);

        let file = OpenOptions::new()
            .append(true)
            .open(&self.wal_path)
            .map_err(|e| SessionError::Io(format!("Failed to reopen WAL: {}", e)))?;
        self.wal_file = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.checkpoint_threshold > 0 && self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    /// Number of commits after which the store folds the log into a
    /// snapshot. Zero disables automatic checkpoints.
    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold;
    }

    pub fn path(&self) -> &Path {
        &self.wal_path
    }
}

enum Frame {
    Complete,
    Empty,
    Partial,
}

fn read_frame<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<Frame> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(Frame::Empty),
            Ok(0) => return Ok(Frame::Partial),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(SessionError::Io(format!("Failed to read WAL: {}", e))),
        }
    }
    Ok(Frame::Complete)
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Writes the snapshot to a temporary file next to the target, syncs it,
    /// then renames it over the previous snapshot.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = match self.snapshot_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|e| SessionError::Io(format!("Failed to create snapshot directory: {}", e)))?;

        let serialized = rmp_serde::to_vec(snapshot).map_err(|e| {
            SessionError::Serialization(format!("Failed to serialize snapshot: {}", e))
        })?;

        let temp = NamedTempFile::new_in(&dir)
            .map_err(|e| SessionError::Io(format!("Failed to create temp file: {}", e)))?;
        let mut writer = BufWriter::new(temp);
        writer
            .write_all(&serialized)
            .and_then(|_| writer.flush())
            .map_err(|e| SessionError::Io(format!("Failed to write snapshot: {}", e)))?;
        let temp = writer
            .into_inner()
            .map_err(|e| SessionError::Io(format!("Failed to flush snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| SessionError::Io(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| SessionError::Io(format!("Failed to rename snapshot: {}", e.error)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }

        let mut data = Vec::new();
        File::open(&self.snapshot_path)
            .and_then(|mut file| file.read_to_end(&mut data))
            .map_err(|e| SessionError::Io(format!("Failed to read snapshot: {}", e)))?;

        // A zero-length file is what a caller-created placeholder looks like
        if data.is_empty() {
            return Ok(None);
        }

        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            SessionError::Serialization(format!("Failed to deserialize snapshot: {}", e))
        })?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SessionError::Serialization(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }

        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }

    pub fn delete(&self) -> Result<()> {
        if self.snapshot_path.exists() {
            fs::remove_file(&self.snapshot_path)
                .map_err(|e| SessionError::Io(format!("Failed to delete snapshot: {}", e)))?;
        }
        Ok(())
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

/// Snapshot at `path`, log at `path` with a `.wal` extension.
pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let snapshot_path = path.as_ref().to_path_buf();
        let wal_path = wal_path_for(&snapshot_path);
        let wal = WalManager::new(wal_path, durability_mode)?;
        let snapshot = SnapshotManager::new(snapshot_path);
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    /// Folds the log into a fresh snapshot of `root`, then empties the log.
    pub fn checkpoint(&mut self, root: &Bucket, last_tx_id: TransactionId) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }

        let snapshot = StoreSnapshot::new(root.clone(), last_tx_id);
        self.snapshot.save(&snapshot)?;
        self.wal.clear()?;
        debug!(%last_tx_id, "checkpoint written");
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    /// Rebuilds the last committed tree: the snapshot, then every logged
    /// transaction newer than it. A torn record at the end of the log is
    /// dropped and cut off so that new records follow the intact prefix.
    pub fn recover(&mut self) -> Result<Option<(Bucket, TransactionId)>> {
        let snapshot = self.snapshot.load()?;
        let scan = self.wal.read_all()?;

        if scan.torn {
            warn!(
                path = %self.wal.path().display(),
                valid_len = scan.valid_len,
                "discarding partially written WAL record"
            );
            self.wal.truncate(scan.valid_len)?;
        }

        if snapshot.is_none() && scan.entries.is_empty() {
            return Ok(None);
        }

        let (mut root, mut last_tx_id) = match snapshot {
            Some(snapshot) => (snapshot.root, snapshot.last_tx_id),
            None => (Bucket::new(), 0),
        };

        let mut replayed = 0;
        for entry in scan.entries {
            // Already folded into the snapshot by a checkpoint that crashed
            // before it could empty the log
            if entry.tx_id <= last_tx_id {
                continue;
            }
            for change in &entry.changes {
                change.apply(&mut root)?;
            }
            last_tx_id = entry.tx_id;
            replayed += 1;
        }

        self.wal.entries_since_checkpoint = replayed;
        debug!(last_tx_id, replayed, "bucket store recovered");
        Ok(Some((root, TransactionId(last_tx_id))))
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn wal_mut(&mut self) -> &mut WalManager {
        &mut self.wal
    }

    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }
}

/// Location of the log belonging to the snapshot at `path`.
pub fn wal_path_for(path: &Path) -> PathBuf {
    path.with_extension("wal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(parent: &[&[u8]], key: &[u8], value: &[u8]) -> Change {
        Change::Put {
            parent: parent.iter().map(|p| p.to_vec()).collect(),
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    fn create(name: &[u8]) -> Change {
        Change::CreateBucket {
            parent: vec![],
            name: name.to_vec(),
        }
    }

    #[test]
    fn test_wal_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("test.wal");
        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();

        wal.append(&WalEntry::new(TransactionId(1), vec![create(b"s")]))
            .unwrap();
        wal.append(&WalEntry::new(TransactionId(2), vec![put(&[b"s"], b"k", b"v")]))
            .unwrap();

        let scan = wal.read_all().unwrap();
        assert_eq!(scan.entries.len(), 2);
        assert!(!scan.torn);
        assert_eq!(scan.valid_len, fs::metadata(&wal_path).unwrap().len());
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("test.wal");
        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::new(TransactionId(1), vec![create(b"s")]))
            .unwrap();
        let intact = fs::metadata(&wal_path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[0x92, 0x01]).unwrap();

        let scan = wal.read_all().unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert!(scan.torn);
        assert_eq!(scan.valid_len, intact);
    }

    #[test]
    fn test_oversized_length_prefix_is_a_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("test.wal");
        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::new(TransactionId(1), vec![create(b"s")]))
            .unwrap();
        let intact = fs::metadata(&wal_path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        file.write_all(&[0x92, 0x01, 0x02]).unwrap();

        let scan = wal.read_all().unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert!(scan.torn);
        assert_eq!(scan.valid_len, intact);
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let snapshot_mgr = SnapshotManager::new(temp_dir.path().join("store.db"));

        let mut root = Bucket::new();
        create(b"sessions").apply(&mut root).unwrap();
        snapshot_mgr
            .save(&StoreSnapshot::new(root, TransactionId(9)))
            .unwrap();

        assert!(snapshot_mgr.exists());
        let loaded = snapshot_mgr.load().unwrap().unwrap();
        assert_eq!(loaded.last_tx_id, 9);
        assert_eq!(loaded.metadata.bucket_count, 1);
        assert!(loaded.root.bucket(b"sessions").is_some());
    }

    #[test]
    fn test_checkpoint_clears_wal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.db");
        let mut persistence = PersistenceManager::new(&path, DurabilityMode::Sync).unwrap();

        persistence
            .log(&WalEntry::new(TransactionId(1), vec![create(b"a")]))
            .unwrap();
        persistence
            .log(&WalEntry::new(TransactionId(2), vec![create(b"b")]))
            .unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 2);

        persistence
            .checkpoint(&Bucket::new(), TransactionId(2))
            .unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 0);
        assert_eq!(fs::metadata(wal_path_for(&path)).unwrap().len(), 0);
    }

    #[test]
    fn test_recovery_skips_entries_already_in_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.db");

        let mut root = Bucket::new();
        create(b"s").apply(&mut root).unwrap();
        put(&[b"s"], b"k", b"old").apply(&mut root).unwrap();
        SnapshotManager::new(&path)
            .save(&StoreSnapshot::new(root, TransactionId(2)))
            .unwrap();

        let mut persistence = PersistenceManager::new(&path, DurabilityMode::Sync).unwrap();
        // Entries 1 and 2 are in the snapshot; replaying 1 again would fail
        persistence
            .log(&WalEntry::new(TransactionId(1), vec![create(b"s")]))
            .unwrap();
        persistence
            .log(&WalEntry::new(TransactionId(2), vec![put(&[b"s"], b"k", b"old")]))
            .unwrap();
        persistence
            .log(&WalEntry::new(TransactionId(3), vec![put(&[b"s"], b"k", b"new")]))
            .unwrap();

        let (recovered, last) = persistence.recover().unwrap().unwrap();
        assert_eq!(last, TransactionId(3));
        assert_eq!(recovered.bucket(b"s").unwrap().get(b"k"), Some(&b"new"[..]));
        assert_eq!(persistence.wal().entries_since_checkpoint(), 1);
    }

    #[test]
    fn test_recover_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let mut persistence =
            PersistenceManager::new(temp_dir.path().join("fresh.db"), DurabilityMode::Async)
                .unwrap();
        assert!(persistence.recover().unwrap().is_none());
    }
}
