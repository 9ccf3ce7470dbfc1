use crate::core::{LifeTime, Result, SessionError, Value};
use chrono::Duration;

/// Session database trait - allows pluggable storage backends
///
/// A database owns the physical layout of session data and is the authority
/// on expiration. Every method must be safe to call concurrently; calls for
/// the same session race under last-writer-wins, but a single call never
/// leaves its session half-written.
pub trait Database: Send + Sync {
    /// Returns the stored lifetime of a session, creating its storage (and,
    /// for a positive `expires`, its expiration record) if missing.
    ///
    /// A freshly created session yields an empty lifetime; the caller starts
    /// its own clock from the configured expiration.
    fn acquire(&self, sid: &str, expires: Duration) -> Result<LifeTime>;

    /// Re-stamps the expiration record of a session.
    ///
    /// Fails with [`SessionError::NotFound`] when the session has no
    /// expiration record, and with [`SessionError::NotImplemented`] when the
    /// backend keeps no expirations at all.
    fn on_update_expiration(&self, sid: &str, expires: Duration) -> Result<()>;

    /// Stores a value. `immutable` is a hint; backends may ignore it.
    fn set(
        &self,
        sid: &str,
        lifetime: &LifeTime,
        key: &str,
        value: &Value,
        immutable: bool,
    ) -> Result<()>;

    /// Reads a value; a missing key is `Ok(None)`.
    fn get(&self, sid: &str, key: &str) -> Result<Option<Value>>;

    /// Calls `visitor` for every key/value pair of a session.
    fn visit(&self, sid: &str, visitor: &mut dyn FnMut(&str, Value)) -> Result<()>;

    /// Number of keys stored for a session.
    fn len(&self, sid: &str) -> Result<usize>;

    /// Removes a key, reporting whether it was there.
    fn delete(&self, sid: &str, key: &str) -> Result<bool>;

    /// Removes every key but keeps the session itself.
    fn clear(&self, sid: &str) -> Result<()>;

    /// Removes a session and its expiration record. Releasing an unknown
    /// session is not an error.
    fn release(&self, sid: &str) -> Result<()>;

    /// Whether the session is stored and not yet expired.
    fn exists(&self, sid: &str) -> Result<bool>;

    /// Evicts every expired session and returns how many were evicted.
    /// Backends that expire entries on their own keep the default.
    fn cleanup(&self) -> Result<usize> {
        Ok(0)
    }

    /// Every stored session id, for backends able to enumerate them.
    fn ids(&self) -> Result<Vec<String>> {
        Err(SessionError::NotImplemented)
    }
}
