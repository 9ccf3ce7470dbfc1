//! File-backed session database.
//!
//! Layout inside the store:
//!
//! ```text
//! <table>/                      root bucket, "sessions" by default
//!     <sid>/                    one bucket per session, key -> encoded value
//!     <sid>_expiration/         present only for sessions that expire
//!         exp -> encoded Timestamp
//! ```
//!
//! Expired sessions are evicted when the database opens, by
//! [`FileDatabase::cleanup`], and lazily whenever [`Database::acquire`]
//! meets one.

use crate::core::{Clock, LifeTime, Result, SessionError, SystemClock, Value};
use crate::storage::bucket::Bucket;
use crate::storage::engine::Database;
use crate::storage::store::{BucketStore, StoreOptions, StoreStats};
use crate::transcoder::{DEFAULT_TRANSCODER, Transcoder};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error};
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_TABLE: &str = "sessions";

const EXPIRATION_SUFFIX: &[u8] = b"_expiration";
const EXPIRATION_KEY: &[u8] = b"exp";

/// Name of the bucket holding the expiration record of `sid`.
fn expiration_bucket_name(sid: &[u8]) -> Vec<u8> {
    let mut name = Vec::with_capacity(sid.len() + EXPIRATION_SUFFIX.len());
    name.extend_from_slice(sid);
    name.extend_from_slice(EXPIRATION_SUFFIX);
    name
}

/// An expiration bucket is recognized by its suffix, by the session bucket
/// it belongs to and by its shape: the single `exp` key and nothing else. A
/// session id which happens to end with the suffix is still listed as a
/// session.
fn is_expiration_bucket(table: &Bucket, name: &[u8]) -> bool {
    let sid = match name.strip_suffix(EXPIRATION_SUFFIX) {
        Some(sid) if !sid.is_empty() => sid,
        _ => return false,
    };
    table.bucket(sid).is_some() && expiration_record(table, name).is_some()
}

/// The bucket `exp_name` if it is shaped like an expiration record.
fn expiration_record<'a>(table: &'a Bucket, exp_name: &[u8]) -> Option<&'a Bucket> {
    table.bucket(exp_name).filter(|bucket| {
        bucket.key_count() == 1
            && bucket.bucket_count() == 0
            && bucket.get(EXPIRATION_KEY).is_some()
    })
}

#[derive(Clone)]
pub struct FileDatabaseConfig {
    pub table: String,
    pub store: StoreOptions,
    pub transcoder: Arc<dyn Transcoder>,
    pub clock: Arc<dyn Clock>,
}

impl Default for FileDatabaseConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            store: StoreOptions::default(),
            transcoder: DEFAULT_TRANSCODER.clone(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl FileDatabaseConfig {
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn store(mut self, store: StoreOptions) -> Self {
        self.store = store;
        self
    }

    pub fn transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Session database persisted to a single file (plus its write-ahead log).
pub struct FileDatabase {
    store: BucketStore,
    table: Vec<u8>,
    transcoder: Arc<dyn Transcoder>,
    clock: Arc<dyn Clock>,
}

impl FileDatabase {
    /// Opens the database at `path` (directories are created as needed)
    /// with default settings. Expired sessions left by a previous run are
    /// removed before this returns.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, FileDatabaseConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, config: FileDatabaseConfig) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            error!("path is required");
            return Err(SessionError::Config("path is required".to_string()));
        }

        let store = BucketStore::open(path, config.store).map_err(|e| {
            error!("unable to initialize the file-based session database: {}", e);
            e
        })?;
        Self::from_store(store, config)
    }

    /// Same as [`FileDatabase::open_with`] for an already opened store.
    pub fn from_store(store: BucketStore, config: FileDatabaseConfig) -> Result<Self> {
        if config.table.is_empty() {
            return Err(SessionError::Config("table name is required".to_string()));
        }

        let table = config.table.into_bytes();
        store.update(|tx| tx.create_bucket_if_not_exists(&table).map(|_| ()))?;

        let db = Self {
            store,
            table,
            transcoder: config.transcoder,
            clock: config.clock,
        };
        let evicted = db.cleanup()?;
        if evicted > 0 {
            debug!("cleanup: removed {} expired session(s)", evicted);
        }
        Ok(db)
    }

    /// Removes every session whose expiration instant has passed and
    /// returns how many were removed. The sweep runs in one transaction: if
    /// any removal fails, none is applied.
    pub fn cleanup(&self) -> Result<usize> {
        let now = self.clock.now();
        self.store.update(|tx| {
            let expired: Vec<Vec<u8>> = {
                let Some(table) = tx.bucket(&self.table) else {
                    return Ok(0);
                };
                table
                    .bucket_names()
                    .filter(|name| !name.is_empty() && !is_expiration_bucket(table, name))
                    .filter(|sid| {
                        let exp_name = expiration_bucket_name(sid);
                        match self.read_expiration(table, &exp_name) {
                            Some(expires_at) => expires_at <= now,
                            None => false,
                        }
                    })
                    .map(<[u8]>::to_vec)
                    .collect()
            };

            let Some(mut table) = tx.bucket_mut(&self.table) else {
                return Ok(0);
            };
            for sid in &expired {
                table.delete_bucket(&expiration_bucket_name(sid))?;
                table.delete_bucket(sid)?;
            }
            Ok(expired.len())
        })
    }

    /// Store-level counters, for monitoring.
    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    /// Flushes a final snapshot. Later calls fail with
    /// [`SessionError::Closed`].
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }

    fn encode_expiration(&self, expires_at: DateTime<Utc>) -> Result<Vec<u8>> {
        self.transcoder.marshal(&Value::Timestamp(expires_at))
    }

    /// Decoded expiration instant stored in the bucket `exp_name`, if the
    /// bucket exists and holds a readable value.
    fn read_expiration(&self, table: &Bucket, exp_name: &[u8]) -> Option<DateTime<Utc>> {
        let bucket = expiration_record(table, exp_name)?;
        let Some(bytes) = bucket.get(EXPIRATION_KEY).filter(|b| !b.is_empty()) else {
            debug!(
                "expiration is there but its value is empty '{}'",
                String::from_utf8_lossy(exp_name)
            );
            return None;
        };

        match self.transcoder.unmarshal(bytes) {
            Ok(value) => value.as_timestamp(),
            Err(e) => {
                debug!(
                    "unable to retrieve expiration value for '{}': {}",
                    String::from_utf8_lossy(exp_name),
                    e
                );
                None
            }
        }
    }

    fn missing_table(&self) -> SessionError {
        SessionError::Bucket(format!(
            "root bucket '{}' is missing",
            String::from_utf8_lossy(&self.table)
        ))
    }
}

fn unreachable_session(sid: &str) {
    debug!("unreachable session access for '{}'", sid);
}

impl Database for FileDatabase {
    fn acquire(&self, sid: &str, expires: Duration) -> Result<LifeTime> {
        let now = self.clock.now();
        let bsid = sid.as_bytes();
        let exp_name = expiration_bucket_name(bsid);

        self.store.update(|tx| {
            let (expires_at, name_taken) = {
                let table = tx.bucket(&self.table).ok_or_else(|| self.missing_table())?;
                let name_taken = table.bucket(&exp_name).is_some()
                    && expiration_record(table, &exp_name).is_none();
                (self.read_expiration(table, &exp_name), name_taken)
            };
            let mut table = tx.bucket_mut(&self.table).ok_or_else(|| self.missing_table())?;

            match expires_at {
                Some(t) if t > now => return Ok(LifeTime::at(t)),
                Some(_) => {
                    debug!("acquire: session '{}' has expired, evicting it", sid);
                    table.delete_bucket(&exp_name)?;
                    table.delete_bucket_if_exists(bsid)?;
                }
                None => {}
            }

            let expires_at = if expires > Duration::zero() {
                now.checked_add_signed(expires)
            } else {
                None
            };

            if let Some(expires_at) = expires_at {
                if name_taken {
                    return Err(SessionError::Bucket(format!(
                        "expiration record of '{}' collides with another session",
                        sid
                    )));
                }
                let bytes = self.encode_expiration(expires_at)?;
                table
                    .create_bucket_if_not_exists(&exp_name)?
                    .put(EXPIRATION_KEY, bytes)?;
            }
            table.create_bucket_if_not_exists(bsid)?;

            // The manager starts the clock from its own configuration
            Ok(LifeTime::never())
        })
    }

    fn on_update_expiration(&self, sid: &str, expires: Duration) -> Result<()> {
        let now = self.clock.now();
        let exp_name = expiration_bucket_name(sid.as_bytes());

        let result = self.store.update(|tx| {
            let current = {
                let table = tx.bucket(&self.table).ok_or_else(|| self.missing_table())?;
                if expiration_record(table, &exp_name).is_none() {
                    return Err(SessionError::NotFound);
                }
                self.read_expiration(table, &exp_name)
            };
            if matches!(current, Some(t) if t <= now) {
                return Err(SessionError::NotFound);
            }

            let mut table = tx.bucket_mut(&self.table).ok_or_else(|| self.missing_table())?;
            match now.checked_add_signed(expires) {
                Some(expires_at) if expires > Duration::zero() => {
                    let bytes = self.encode_expiration(expires_at)?;
                    table
                        .bucket_mut(&exp_name)
                        .ok_or(SessionError::NotFound)?
                        .put(EXPIRATION_KEY, bytes)
                }
                // Non-positive durations make the session unlimited
                _ => table.delete_bucket(&exp_name),
            }
        });

        if let Err(e) = &result {
            debug!("unable to reset the expiration value for '{}': {}", sid, e);
        }
        result
    }

    fn set(
        &self,
        sid: &str,
        _lifetime: &LifeTime,
        key: &str,
        value: &Value,
        _immutable: bool,
    ) -> Result<()> {
        let bytes = self.transcoder.marshal(value)?;

        self.store.update(|tx| {
            match tx.bucket_path_mut(&[self.table.as_slice(), sid.as_bytes()]) {
                Some(mut node) => node.put(key.as_bytes(), bytes),
                None => {
                    unreachable_session(sid);
                    Ok(())
                }
            }
        })
    }

    fn get(&self, sid: &str, key: &str) -> Result<Option<Value>> {
        self.store.view(|tx| {
            let Some(node) = tx.bucket_path(&[self.table.as_slice(), sid.as_bytes()]) else {
                unreachable_session(sid);
                return Ok(None);
            };

            match node.get(key.as_bytes()) {
                Some(bytes) if !bytes.is_empty() => self.transcoder.unmarshal(bytes).map(Some),
                _ => Ok(None),
            }
        })
    }

    fn visit(&self, sid: &str, visitor: &mut dyn FnMut(&str, Value)) -> Result<()> {
        self.store.view(|tx| {
            let Some(node) = tx.bucket_path(&[self.table.as_slice(), sid.as_bytes()]) else {
                unreachable_session(sid);
                return Ok(());
            };

            for (key, bytes) in node.iter() {
                let key = String::from_utf8_lossy(key);
                let value = self.transcoder.unmarshal(bytes).map_err(|e| {
                    debug!("unable to retrieve value of key '{}' of '{}': {}", key, sid, e);
                    e
                })?;
                visitor(&key, value);
            }
            Ok(())
        })
    }

    fn len(&self, sid: &str) -> Result<usize> {
        self.store.view(|tx| {
            Ok(tx
                .bucket_path(&[self.table.as_slice(), sid.as_bytes()])
                .map_or(0, Bucket::key_count))
        })
    }

    fn delete(&self, sid: &str, key: &str) -> Result<bool> {
        self.store.update(|tx| {
            match tx.bucket_path_mut(&[self.table.as_slice(), sid.as_bytes()]) {
                Some(mut node) => node.delete(key.as_bytes()),
                None => {
                    unreachable_session(sid);
                    Ok(false)
                }
            }
        })
    }

    fn clear(&self, sid: &str) -> Result<()> {
        self.store.update(|tx| {
            if let Some(mut node) = tx.bucket_path_mut(&[self.table.as_slice(), sid.as_bytes()]) {
                node.clear()?;
            }
            Ok(())
        })
    }

    fn release(&self, sid: &str) -> Result<()> {
        let bsid = sid.as_bytes();
        self.store.update(|tx| {
            let exp_name = expiration_bucket_name(bsid);
            let has_record = {
                let table = tx.bucket(&self.table).ok_or_else(|| self.missing_table())?;
                expiration_record(table, &exp_name).is_some()
            };
            let mut table = tx.bucket_mut(&self.table).ok_or_else(|| self.missing_table())?;
            if has_record {
                table.delete_bucket(&exp_name)?;
            }
            table.delete_bucket_if_exists(bsid)?;
            Ok(())
        })
    }

    fn exists(&self, sid: &str) -> Result<bool> {
        let now = self.clock.now();
        self.store.view(|tx| {
            let Some(table) = tx.bucket(&self.table) else {
                return Ok(false);
            };
            if table.bucket(sid.as_bytes()).is_none() {
                return Ok(false);
            }

            let exp_name = expiration_bucket_name(sid.as_bytes());
            Ok(match self.read_expiration(table, &exp_name) {
                Some(expires_at) => expires_at > now,
                None => true,
            })
        })
    }

    fn cleanup(&self) -> Result<usize> {
        FileDatabase::cleanup(self)
    }

    fn ids(&self) -> Result<Vec<String>> {
        self.store.view(|tx| {
            let Some(table) = tx.bucket(&self.table) else {
                return Ok(Vec::new());
            };
            Ok(table
                .bucket_names()
                .filter(|name| !name.is_empty() && !is_expiration_bucket(table, name))
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .collect())
        })
    }
}

impl std::fmt::Debug for FileDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDatabase")
            .field("path", &self.store.path())
            .field("table", &String::from_utf8_lossy(&self.table))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use tempfile::TempDir;

    fn open(dir: &TempDir, clock: &ManualClock) -> FileDatabase {
        let config = FileDatabaseConfig::default().clock(Arc::new(clock.clone()));
        FileDatabase::open_with(dir.path().join("sessions").join("store.db"), config).unwrap()
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let err = FileDatabase::open("").unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_acquire_creates_layout() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);

        let lifetime = db.acquire("abc", Duration::minutes(5)).unwrap();
        assert!(lifetime.is_zero());

        let (node, exp) = db
            .store()
            .view(|tx| {
                Ok((
                    tx.bucket_path(&["sessions".as_bytes(), "abc".as_bytes()]).is_some(),
                    tx.bucket_path(&["sessions".as_bytes(), "abc_expiration".as_bytes()])
                        .and_then(|b| b.get(b"exp"))
                        .is_some(),
                ))
            })
            .unwrap();
        assert!(node);
        assert!(exp);

        // A second acquire reports the stored instant
        let again = db.acquire("abc", Duration::minutes(5)).unwrap();
        assert_eq!(again.expires_at(), Some(clock.now() + Duration::minutes(5)));
    }

    #[test]
    fn test_unlimited_session_has_no_expiration_record() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);

        db.acquire("forever", Duration::zero()).unwrap();
        assert!(matches!(
            db.on_update_expiration("forever", Duration::minutes(1)),
            Err(SessionError::NotFound)
        ));
        assert_eq!(db.ids().unwrap(), vec!["forever".to_string()]);
    }

    #[test]
    fn test_values_and_keys() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);
        let lifetime = db.acquire("s1", Duration::zero()).unwrap();

        db.set("s1", &lifetime, "name", &Value::from("iris"), false)
            .unwrap();
        db.set("s1", &lifetime, "visits", &Value::from(3), false)
            .unwrap();

        assert_eq!(db.get("s1", "name").unwrap(), Some(Value::from("iris")));
        assert_eq!(db.get("s1", "missing").unwrap(), None);
        assert_eq!(db.len("s1").unwrap(), 2);

        let mut seen = Vec::new();
        db.visit("s1", &mut |k: &str, v: Value| seen.push((k.to_string(), v)))
            .unwrap();
        assert_eq!(
            seen,
            vec![
                ("name".to_string(), Value::from("iris")),
                ("visits".to_string(), Value::from(3)),
            ]
        );

        assert!(db.delete("s1", "name").unwrap());
        assert!(!db.delete("s1", "name").unwrap());
        db.clear("s1").unwrap();
        assert_eq!(db.len("s1").unwrap(), 0);
        assert!(db.exists("s1").unwrap());
    }

    #[test]
    fn test_unknown_session_is_a_silent_no_op() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);

        db.set("ghost", &LifeTime::never(), "k", &Value::from(1), false)
            .unwrap();
        assert_eq!(db.get("ghost", "k").unwrap(), None);
        assert_eq!(db.len("ghost").unwrap(), 0);
        assert!(!db.delete("ghost", "k").unwrap());
        db.clear("ghost").unwrap();
        db.release("ghost").unwrap();
        assert!(!db.exists("ghost").unwrap());
    }

    #[test]
    fn test_expired_session_is_evicted_on_acquire() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);

        let lifetime = db.acquire("old", Duration::seconds(30)).unwrap();
        db.set("old", &lifetime, "k", &Value::from(1), false).unwrap();
        clock.advance(Duration::seconds(31));

        assert!(!db.exists("old").unwrap());
        let fresh = db.acquire("old", Duration::seconds(30)).unwrap();
        assert!(fresh.is_zero());
        assert_eq!(db.len("old").unwrap(), 0);
    }

    #[test]
    fn test_update_expiration() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);

        db.acquire("s", Duration::minutes(1)).unwrap();
        clock.advance(Duration::seconds(50));
        db.on_update_expiration("s", Duration::minutes(1)).unwrap();
        clock.advance(Duration::seconds(50));
        assert!(db.exists("s").unwrap());

        db.on_update_expiration("s", Duration::zero()).unwrap();
        clock.advance(Duration::days(365));
        assert!(db.exists("s").unwrap());
        assert!(matches!(
            db.on_update_expiration("missing", Duration::minutes(1)),
            Err(SessionError::NotFound)
        ));
    }

    #[test]
    fn test_cleanup_sweeps_every_expired_session() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);

        db.acquire("a", Duration::seconds(10)).unwrap();
        db.acquire("b", Duration::seconds(10)).unwrap();
        db.acquire("c", Duration::minutes(10)).unwrap();
        db.acquire("d", Duration::zero()).unwrap();
        clock.advance(Duration::seconds(11));

        assert_eq!(db.cleanup().unwrap(), 2);
        let mut ids = db.ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["c".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);

        db.acquire("s", Duration::minutes(1)).unwrap();
        db.release("s").unwrap();
        db.release("s").unwrap();
        assert!(db.ids().unwrap().is_empty());
        assert_eq!(db.stats().unwrap().root_buckets, 1);
    }

    #[test]
    fn test_suffix_in_session_id_is_not_mistaken_for_expiration() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);

        db.acquire("x_expiration", Duration::zero()).unwrap();
        assert_eq!(db.ids().unwrap(), vec!["x_expiration".to_string()]);
    }

    #[test]
    fn test_session_named_like_a_sibling_expiration_record() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let db = open(&dir, &clock);

        db.acquire("x", Duration::zero()).unwrap();
        db.acquire("x_expiration", Duration::zero()).unwrap();
        db.set("x_expiration", &LifeTime::never(), "cart", &Value::from(2), false)
            .unwrap();

        let mut ids = db.ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["x".to_string(), "x_expiration".to_string()]);

        clock.advance(Duration::days(1));
        assert_eq!(db.cleanup().unwrap(), 0);
        assert_eq!(db.get("x_expiration", "cart").unwrap(), Some(Value::from(2)));

        db.release("x").unwrap();
        assert_eq!(db.ids().unwrap(), vec!["x_expiration".to_string()]);
    }
}
