use crate::core::{Clock, LifeTime, Result, SessionError, SystemClock, Value};
use crate::storage::engine::Database;
use crate::transcoder::{DEFAULT_TRANSCODER, Transcoder};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

struct MemoryEntry {
    /// Encoded values, so that reads return copies with the same fidelity
    /// as a persistent backend
    values: BTreeMap<String, Vec<u8>>,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn has_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

/// Process-local session database. The default backend of
/// [`Sessions`](crate::Sessions); nothing survives a restart.
pub struct MemoryDatabase {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    transcoder: Arc<dyn Transcoder>,
    clock: Arc<dyn Clock>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            transcoder: DEFAULT_TRANSCODER.clone(),
            clock,
        }
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Drops every expired session, returning how many were dropped.
    pub fn cleanup(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.write()?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.has_expired(now));
        Ok(before - entries.len())
    }

    /// Runs `f` on a live (not expired) session.
    fn with_entry<T>(&self, sid: &str, f: impl FnOnce(&MemoryEntry) -> Result<T>) -> Result<Option<T>> {
        let now = self.clock.now();
        let entries = self.entries.read()?;
        match entries.get(sid) {
            Some(entry) if !entry.has_expired(now) => f(entry).map(Some),
            _ => Ok(None),
        }
    }

    fn with_entry_mut<T>(
        &self,
        sid: &str,
        f: impl FnOnce(&mut MemoryEntry) -> Result<T>,
    ) -> Result<Option<T>> {
        let now = self.clock.now();
        let mut entries = self.entries.write()?;
        match entries.get_mut(sid) {
            Some(entry) if !entry.has_expired(now) => f(entry).map(Some),
            _ => Ok(None),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemoryDatabase {
    fn acquire(&self, sid: &str, expires: Duration) -> Result<LifeTime> {
        let now = self.clock.now();
        let mut entries = self.entries.write()?;

        if let Some(entry) = entries.get(sid) {
            if !entry.has_expired(now) {
                return Ok(entry.expires_at.map_or_else(LifeTime::never, LifeTime::at));
            }
            entries.remove(sid);
        }

        entries.insert(
            sid.to_string(),
            MemoryEntry {
                values: BTreeMap::new(),
                expires_at: LifeTime::begin(now, expires).expires_at(),
            },
        );
        Ok(LifeTime::never())
    }

    fn on_update_expiration(&self, sid: &str, expires: Duration) -> Result<()> {
        let now = self.clock.now();
        self.with_entry_mut(sid, |entry| {
            if entry.expires_at.is_none() {
                return Err(SessionError::NotFound);
            }
            entry.expires_at = LifeTime::begin(now, expires).expires_at();
            Ok(())
        })?
        .ok_or(SessionError::NotFound)
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
        self.with_entry_mut(sid, |entry| {
            entry.values.insert(key.to_string(), bytes);
            Ok(())
        })?;
        Ok(())
    }

    fn get(&self, sid: &str, key: &str) -> Result<Option<Value>> {
        self.with_entry(sid, |entry| {
            entry
                .values
                .get(key)
                .map(|bytes| self.transcoder.unmarshal(bytes))
                .transpose()
        })
        .map(Option::flatten)
    }

    fn visit(&self, sid: &str, visitor: &mut dyn FnMut(&str, Value)) -> Result<()> {
        // Decode under the lock, call back outside of it
        let decoded = self.with_entry(sid, |entry| {
            entry
                .values
                .iter()
                .map(|(k, bytes)| Ok((k.clone(), self.transcoder.unmarshal(bytes)?)))
                .collect::<Result<Vec<_>>>()
        })?;

        for (key, value) in decoded.unwrap_or_default() {
            visitor(&key, value);
        }
        Ok(())
    }

    fn len(&self, sid: &str) -> Result<usize> {
        Ok(self
            .with_entry(sid, |entry| Ok(entry.values.len()))?
            .unwrap_or(0))
    }

    fn delete(&self, sid: &str, key: &str) -> Result<bool> {
        Ok(self
            .with_entry_mut(sid, |entry| Ok(entry.values.remove(key).is_some()))?
            .unwrap_or(false))
    }

    fn clear(&self, sid: &str) -> Result<()> {
        self.with_entry_mut(sid, |entry| {
            entry.values.clear();
            Ok(())
        })?;
        Ok(())
    }

    fn release(&self, sid: &str) -> Result<()> {
        self.entries.write()?.remove(sid);
        Ok(())
    }

    fn exists(&self, sid: &str) -> Result<bool> {
        Ok(self.with_entry(sid, |_| Ok(()))?.is_some())
    }

    fn cleanup(&self) -> Result<usize> {
        MemoryDatabase::cleanup(self)
    }

    fn ids(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .read()?
            .iter()
            .filter(|(_, entry)| !entry.has_expired(now))
            .map(|(sid, _)| sid.clone())
            .collect())
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self.entries.read().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("MemoryDatabase")
            .field("sessions", &sessions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;

    fn db() -> (MemoryDatabase, ManualClock) {
        let clock = ManualClock::default();
        (MemoryDatabase::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let (db, clock) = db();
        assert!(db.acquire("s", Duration::minutes(1)).unwrap().is_zero());

        let stored = db.acquire("s", Duration::minutes(1)).unwrap();
        assert_eq!(stored.expires_at(), Some(clock.now() + Duration::minutes(1)));
    }

    #[test]
    fn test_values() {
        let (db, _) = db();
        db.acquire("s", Duration::zero()).unwrap();
        db.set("s", &LifeTime::never(), "a", &Value::from(1), false)
            .unwrap();
        db.set("s", &LifeTime::never(), "b", &Value::from("two"), true)
            .unwrap();

        assert_eq!(db.get("s", "a").unwrap(), Some(Value::Integer(1)));
        assert_eq!(db.len("s").unwrap(), 2);

        let mut keys = Vec::new();
        db.visit("s", &mut |k: &str, _v: Value| keys.push(k.to_string()))
            .unwrap();
        assert_eq!(keys, vec!["a", "b"]);

        assert!(db.delete("s", "a").unwrap());
        db.clear("s").unwrap();
        assert_eq!(db.len("s").unwrap(), 0);
    }

    #[test]
    fn test_expiry_hides_and_cleanup_drops() {
        let (db, clock) = db();
        db.acquire("short", Duration::seconds(5)).unwrap();
        db.acquire("long", Duration::hours(1)).unwrap();
        clock.advance(Duration::seconds(6));

        assert!(!db.exists("short").unwrap());
        assert_eq!(db.ids().unwrap(), vec!["long".to_string()]);
        assert!(matches!(
            db.on_update_expiration("short", Duration::minutes(1)),
            Err(SessionError::NotFound)
        ));
        assert_eq!(db.cleanup().unwrap(), 1);
    }

    #[test]
    fn test_update_expiration_requires_expiring_session() {
        let (db, clock) = db();
        db.acquire("unlimited", Duration::zero()).unwrap();
        db.acquire("timed", Duration::seconds(10)).unwrap();

        assert!(matches!(
            db.on_update_expiration("unlimited", Duration::minutes(1)),
            Err(SessionError::NotFound)
        ));

        clock.advance(Duration::seconds(8));
        db.on_update_expiration("timed", Duration::seconds(10))
            .unwrap();
        clock.advance(Duration::seconds(8));
        assert!(db.exists("timed").unwrap());
    }
}
