use crate::core::{LifeTime, Result, SessionError, Value};
use crate::storage::Database;
use chrono::{DateTime, Utc};
use log::warn;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A handle on one session.
///
/// Handles are cheap to clone and hold no data of their own: every read and
/// write goes straight to the [`Database`] the session was created on, so
/// two handles for the same id always observe the same values.
#[derive(Clone)]
pub struct Session {
    sid: Arc<str>,
    db: Arc<dyn Database>,
    lifetime: LifeTime,
    is_new: bool,
}

impl Session {
    pub(crate) fn new(sid: &str, db: Arc<dyn Database>, lifetime: LifeTime, is_new: bool) -> Self {
        Self {
            sid: Arc::from(sid),
            db,
            lifetime,
            is_new,
        }
    }

    pub fn id(&self) -> &str {
        &self.sid
    }

    /// True when the session held no keys at the time it was started.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn set_new(&mut self, is_new: bool) {
        self.is_new = is_new;
    }

    /// Expiration as known when this handle was obtained.
    pub fn lifetime(&self) -> LifeTime {
        self.lifetime
    }

    pub(crate) fn set_lifetime(&mut self, lifetime: LifeTime) {
        self.lifetime = lifetime;
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.db
            .set(&self.sid, &self.lifetime, key, &value.into(), false)
    }

    /// Like [`Session::set`], flagging the value as one the caller does not
    /// intend to change. Backends are free to ignore the flag.
    pub fn set_immutable(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.db
            .set(&self.sid, &self.lifetime, key, &value.into(), true)
    }

    /// Reads a value. Backend failures are logged and read as absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.db.get(&self.sid, key) {
            Ok(value) => value,
            Err(e) => {
                warn!("session '{}': unable to read key '{}': {}", self.sid, key, e);
                None
            }
        }
    }

    /// Textual form of a value; empty for a missing or null value.
    pub fn get_string(&self, key: &str) -> String {
        self.get_string_default(key, "")
    }

    pub fn get_string_default(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::Null) | None => default.to_string(),
            Some(value) => value.to_string(),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        let value = self.get(key).ok_or(SessionError::NotFound)?;
        value.as_i64().ok_or_else(|| mismatch("INTEGER", &value))
    }

    /// Falls back to `default` when the value is missing, not numeric or
    /// out of `i32` range.
    pub fn get_int_default(&self, key: &str, default: i32) -> i32 {
        self.get_int(key)
            .ok()
            .and_then(|n| i32::try_from(n).ok())
            .unwrap_or(default)
    }

    pub fn get_i64_default(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    pub fn get_float64(&self, key: &str) -> Result<f64> {
        let value = self.get(key).ok_or(SessionError::NotFound)?;
        value.as_f64().ok_or_else(|| mismatch("FLOAT", &value))
    }

    pub fn get_float64_default(&self, key: &str, default: f64) -> f64 {
        self.get_float64(key).unwrap_or(default)
    }

    pub fn get_boolean(&self, key: &str) -> Result<bool> {
        let value = self.get(key).ok_or(SessionError::NotFound)?;
        value.as_bool().ok_or_else(|| mismatch("BOOLEAN", &value))
    }

    pub fn get_boolean_default(&self, key: &str, default: bool) -> bool {
        self.get_boolean(key).unwrap_or(default)
    }

    pub fn get_time(&self, key: &str) -> Result<DateTime<Utc>> {
        let value = self.get(key).ok_or(SessionError::NotFound)?;
        value.as_timestamp().ok_or_else(|| mismatch("TIMESTAMP", &value))
    }

    pub fn get_time_default(&self, key: &str, default: DateTime<Utc>) -> DateTime<Utc> {
        self.get_time(key).unwrap_or(default)
    }

    /// Decodes a structured value stored as JSON.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)?.decode_json()
    }

    /// Adds `n` to an integer value (a missing key counts as zero) and
    /// returns the result. Not atomic across concurrent requests.
    pub fn increment(&self, key: &str, n: i64) -> Result<i64> {
        let current = match self.get(key) {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_i64().ok_or_else(|| mismatch("INTEGER", &value))?,
        };
        let next = current.saturating_add(n);
        self.set(key, next)?;
        Ok(next)
    }

    pub fn decrement(&self, key: &str, n: i64) -> Result<i64> {
        self.increment(key, n.saturating_neg())
    }

    /// Calls `visitor` for every stored pair.
    pub fn visit(&self, mut visitor: impl FnMut(&str, Value)) -> Result<()> {
        self.db.visit(&self.sid, &mut visitor)
    }

    /// Every stored pair. Backend failures read as an empty session.
    pub fn get_all(&self) -> BTreeMap<String, Value> {
        let mut all = BTreeMap::new();
        if let Err(e) = self.visit(|key, value| {
            all.insert(key.to_string(), value);
        }) {
            warn!("session '{}': unable to read values: {}", self.sid, e);
        }
        all
    }

    pub fn len(&self) -> usize {
        self.db.len(&self.sid).unwrap_or_else(|e| {
            warn!("session '{}': unable to count keys: {}", self.sid, e);
            0
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a key, reporting whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.db.delete(&self.sid, key)
    }

    /// Removes every key; the session itself stays alive.
    pub fn clear(&self) -> Result<()> {
        self.db.clear(&self.sid)
    }
}

fn mismatch(expected: &str, actual: &Value) -> SessionError {
    SessionError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("lifetime", &self.lifetime)
            .field("is_new", &self.is_new)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDatabase;
    use chrono::{Duration, TimeZone};

    fn session() -> Session {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        db.acquire("sid", Duration::zero()).unwrap();
        Session::new("sid", db, LifeTime::never(), true)
    }

    #[test]
    fn test_typed_getters() {
        let s = session();
        s.set("name", "iris").unwrap();
        s.set("age", 27).unwrap();
        s.set("ratio", 0.5).unwrap();
        s.set("admin", true).unwrap();
        s.set("numeric_text", "12").unwrap();

        assert_eq!(s.get_string("name"), "iris");
        assert_eq!(s.get_string("age"), "27");
        assert_eq!(s.get_string_default("missing", "none"), "none");
        assert_eq!(s.get_int("age").unwrap(), 27);
        assert_eq!(s.get_int("numeric_text").unwrap(), 12);
        assert_eq!(s.get_float64("ratio").unwrap(), 0.5);
        assert!(s.get_boolean("admin").unwrap());
    }

    #[test]
    fn test_getter_fallbacks() {
        let s = session();
        s.set("name", "iris").unwrap();

        assert!(matches!(s.get_int("missing"), Err(SessionError::NotFound)));
        assert!(matches!(
            s.get_int("name"),
            Err(SessionError::TypeMismatch { .. })
        ));
        assert_eq!(s.get_int_default("name", -1), -1);
        s.set("big", i64::MAX).unwrap();
        assert_eq!(s.get_int_default("big", 7), 7);
        assert_eq!(s.get_i64_default("big", 7), i64::MAX);
        assert_eq!(s.get_float64_default("name", 1.5), 1.5);
        assert!(!s.get_boolean_default("name", false));

        let fallback = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(s.get_time_default("name", fallback), fallback);
    }

    #[test]
    fn test_increment_and_decrement() {
        let s = session();
        assert_eq!(s.increment("visits", 1).unwrap(), 1);
        assert_eq!(s.increment("visits", 2).unwrap(), 3);
        assert_eq!(s.decrement("visits", 1).unwrap(), 2);

        s.set("name", "iris").unwrap();
        assert!(s.increment("name", 1).is_err());
    }

    #[test]
    fn test_json_values() {
        let s = session();
        s.set("cart", serde_json::json!({ "items": [1, 2] })).unwrap();

        let cart: serde_json::Value = s.get_json("cart").unwrap();
        assert_eq!(cart["items"][1], 2);
    }

    #[test]
    fn test_handles_share_storage() {
        let a = session();
        let b = a.clone();
        a.set("k", "v").unwrap();

        assert_eq!(b.get("k"), Some(Value::from("v")));
        assert_eq!(b.get_all().len(), 1);
        assert!(b.delete("k").unwrap());
        assert!(a.is_empty());
    }
}
