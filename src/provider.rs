use crate::core::{Clock, Result, SessionError};
use crate::session::Session;
use crate::storage::Database;
use chrono::Duration;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Callback invoked with the id of every destroyed session.
pub type DestroyListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Registry of live session handles in front of a [`Database`].
///
/// The registry is the only in-process mutable state shared between
/// requests. It is never locked across a database call; the database does
/// its own synchronization.
pub struct Provider {
    sessions: Mutex<HashMap<String, Session>>,
    db: Arc<dyn Database>,
    listeners: Vec<DestroyListener>,
    clock: Arc<dyn Clock>,
}

impl Provider {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            db,
            listeners: Vec::new(),
            clock,
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Swaps the backend. Handles registered against the old one are
    /// forgotten.
    pub fn register_database(&mut self, db: Arc<dyn Database>) {
        self.db = db;
        match self.sessions.get_mut() {
            Ok(sessions) => sessions.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    pub fn register_destroy_listener(&mut self, listener: DestroyListener) {
        self.listeners.push(listener);
    }

    /// Creates (or re-attaches to) the storage of `sid` and registers a
    /// handle for it.
    pub fn init(&self, sid: &str, expires: Duration) -> Result<Session> {
        self.cleanup()?;

        let mut lifetime = self.db.acquire(sid, expires)?;
        if lifetime.is_zero() && expires > Duration::zero() {
            lifetime.shift(self.clock.now(), expires);
        }

        let is_new = self.db.len(sid)? == 0;
        let session = Session::new(sid, self.db.clone(), lifetime, is_new);
        self.sessions
            .lock()?
            .insert(sid.to_string(), session.clone());
        Ok(session)
    }

    /// Looks a session up.
    ///
    /// The database has the final say on every lookup. A registered handle
    /// is returned only while the database still holds its session; if
    /// another manager sharing the database released it, the handle is
    /// dropped and the id reads as unknown. A handle whose own lifetime has
    /// run out is re-attached if the database still holds the session
    /// (another instance may have extended it) and destroyed otherwise. An
    /// id this provider never registered is re-materialized only if the
    /// database holds a live session for it.
    pub fn read(&self, sid: &str, expires: Duration) -> Result<Option<Session>> {
        let now = self.clock.now();
        let registered = self.sessions.lock()?.get(sid).cloned();
        let stored = self.db.exists(sid)?;

        match registered {
            Some(mut session) if stored => {
                if !session.lifetime().has_expired(now) {
                    session.set_new(false);
                    return Ok(Some(session));
                }
            }
            Some(session) => {
                if session.lifetime().has_expired(now) {
                    debug!("session '{}' has expired", sid);
                    self.destroy(sid)?;
                } else {
                    debug!("session '{}' was released from the database", sid);
                    self.sessions.lock()?.remove(sid);
                }
                return Ok(None);
            }
            None if !stored => return Ok(None),
            None => {}
        }

        let mut session = self.init(sid, expires)?;
        if session.lifetime().has_expired(now) {
            self.destroy(sid)?;
            return Ok(None);
        }
        session.set_new(false);
        Ok(Some(session))
    }

    /// Re-stamps a session's expiration in the database and in its
    /// registered handle.
    pub fn update_expiration(&self, sid: &str, expires: Duration) -> Result<()> {
        self.db.on_update_expiration(sid, expires)?;

        let now = self.clock.now();
        if let Some(session) = self.sessions.lock()?.get_mut(sid) {
            let mut lifetime = session.lifetime();
            lifetime.shift(now, expires);
            session.set_lifetime(lifetime);
        }
        Ok(())
    }

    /// Releases a session. Listeners run once, and only if the session
    /// existed.
    pub fn destroy(&self, sid: &str) -> Result<()> {
        let registered = self.sessions.lock()?.remove(sid).is_some();
        let existed = registered || self.db.exists(sid)?;

        self.db.release(sid)?;

        if existed {
            for listener in &self.listeners {
                listener(sid);
            }
        }
        Ok(())
    }

    /// Destroys every registered session and, when the database can list
    /// them, every stored one.
    pub fn destroy_all(&self) -> Result<()> {
        let mut ids: Vec<String> = self.sessions.lock()?.keys().cloned().collect();

        match self.db.ids() {
            Ok(stored) => {
                let mut seen: HashSet<String> = ids.iter().cloned().collect();
                ids.extend(stored.into_iter().filter(|id| seen.insert(id.clone())));
            }
            Err(SessionError::NotImplemented) => {}
            Err(e) => return Err(e),
        }

        for sid in ids {
            self.destroy(&sid)?;
        }
        Ok(())
    }

    /// Drops every registered handle whose lifetime has run out and returns
    /// how many were dropped. Sessions the database no longer holds are
    /// destroyed, so listeners fire for them; sessions it still holds (an
    /// instance sharing the database extended them) are only unregistered
    /// and come back on their next read.
    pub fn cleanup(&self) -> Result<usize> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .sessions
            .lock()?
            .iter()
            .filter(|(_, session)| session.lifetime().has_expired(now))
            .map(|(sid, _)| sid.clone())
            .collect();

        for sid in &expired {
            if self.db.exists(sid)? {
                self.sessions.lock()?.remove(sid);
            } else {
                self.destroy(sid)?;
            }
        }
        if !expired.is_empty() {
            debug!("cleanup: dropped {} expired session handle(s)", expired.len());
        }
        Ok(expired.len())
    }

    /// Number of registered handles.
    pub fn len(&self) -> Result<usize> {
        Ok(self.sessions.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("listeners", &self.listeners.len())
            .field("clock", &self.clock)
            .finish()
    }
}
