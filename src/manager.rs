use crate::config::SessionsConfig;
use crate::context::Context;
use crate::cookies::{add_cookie, build_session_cookie, format_cookie_domain, get_cookie, remove_cookie};
use crate::core::{Result, SessionError};
use crate::provider::Provider;
use crate::session::Session;
use crate::storage::{Database, MemoryDatabase};
use chrono::Duration;
use log::{debug, info, warn};
use std::sync::Arc;

/// Entry point of the crate: ties the session cookie of a request to a
/// [`Session`] stored in a [`Database`].
///
/// `Sessions` is meant to be built once and shared between request
/// handlers; every method takes `&self` except the ones that reconfigure
/// the backend or the destroy listeners.
#[derive(Debug)]
pub struct Sessions {
    config: SessionsConfig,
    provider: Provider,
}

impl Sessions {
    /// Validates `config` and starts with an in-memory database.
    pub fn new(config: SessionsConfig) -> Result<Self> {
        let db = Arc::new(MemoryDatabase::with_clock(config.clock.clone()));
        Self::with_database(config, db)
    }

    pub fn with_database(config: SessionsConfig, db: Arc<dyn Database>) -> Result<Self> {
        config.validate()?;
        info!(
            "sessions: cookie '{}', expires {}s",
            config.cookie,
            config.expires.num_seconds()
        );

        let provider = Provider::new(db, config.clock.clone());
        Ok(Self { config, provider })
    }

    /// Replaces the backend. Sessions held by the previous one are not
    /// migrated.
    pub fn use_database(&mut self, db: Arc<dyn Database>) {
        self.provider.register_database(db);
    }

    pub fn config(&self) -> &SessionsConfig {
        &self.config
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Returns the session of the request, starting a new one (and sending
    /// its cookie) when the request carries no usable session cookie.
    ///
    /// A cookie naming a session the backend no longer holds is treated as
    /// absent: the client gets a fresh id rather than a revived one.
    pub fn start<C: Context + ?Sized>(&self, ctx: &mut C) -> Result<Session> {
        let sid = self.session_id(ctx);
        if !sid.is_empty() {
            if let Some(session) = self.provider.read(&sid, self.config.expires)? {
                return Ok(session);
            }
            debug!("session '{}' is gone, issuing a new id", sid);
        }

        let sid = (self.config.session_id_generator)();
        let session = self.provider.init(&sid, self.config.expires)?;
        self.update_cookie(ctx, &sid, self.config.expires);
        Ok(session)
    }

    /// Extends the current session by the configured expiration.
    pub fn shift_expiration<C: Context + ?Sized>(&self, ctx: &mut C) -> Result<()> {
        self.update_expiration(ctx, self.config.expires)
    }

    /// Re-stamps the expiration of the current session and re-sends its
    /// cookie.
    ///
    /// Fails with [`SessionError::NotFound`] when the request has no
    /// session cookie or the backend has no expiration for it. A negative
    /// `expires` still re-sends the cookie as a browser-session cookie.
    pub fn update_expiration<C: Context + ?Sized>(&self, ctx: &mut C, expires: Duration) -> Result<()> {
        let sid = self.session_id(ctx);
        if sid.is_empty() {
            return Err(SessionError::NotFound);
        }

        let result = self.provider.update_expiration(&sid, expires);
        if result.is_ok() || expires < Duration::zero() {
            self.update_cookie(ctx, &sid, expires);
        }
        result
    }

    /// Registers a callback run with the id of every destroyed session.
    pub fn on_destroy<F>(&mut self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.provider.register_destroy_listener(Arc::new(listener));
    }

    /// Destroys the current session and tells the client to drop its
    /// cookie. A request without a session cookie is left alone.
    pub fn destroy<C: Context + ?Sized>(&self, ctx: &mut C) -> Result<()> {
        let sid = self.session_id(ctx);
        if sid.is_empty() {
            return Ok(());
        }

        remove_cookie(
            ctx,
            &self.config.cookie,
            self.config.disable_subdomain_persistence,
            self.config.allow_reclaim,
        );
        self.provider.destroy(&sid)
    }

    /// Destroys a session by id. The client keeps its cookie, which no
    /// longer resolves to anything.
    pub fn destroy_by_id(&self, sid: &str) -> Result<()> {
        self.provider.destroy(sid)
    }

    pub fn destroy_all(&self) -> Result<()> {
        self.provider.destroy_all()
    }

    /// Evicts expired sessions from the database, then drops their handles.
    /// Destroy listeners fire for every handle dropped; the return value
    /// counts them.
    pub fn cleanup(&self) -> Result<usize> {
        let evicted = self.provider.database().cleanup()?;
        if evicted > 0 {
            debug!("cleanup: evicted {} expired session(s)", evicted);
        }
        self.provider.cleanup()
    }

    fn session_id<C: Context + ?Sized>(&self, ctx: &C) -> String {
        get_cookie(ctx, &self.config.cookie)
            .map(|value| self.decode_cookie_value(&value))
            .unwrap_or_default()
    }

    fn update_cookie<C: Context + ?Sized>(&self, ctx: &mut C, sid: &str, expires: Duration) {
        let now = self.config.clock.now();
        let domain = format_cookie_domain(ctx.host(), self.config.disable_subdomain_persistence);
        let secure = ctx.is_tls() && self.config.cookie_secure_tls;

        let cookie = build_session_cookie(
            &self.config.cookie,
            self.encode_cookie_value(sid),
            domain,
            secure,
            expires,
            now,
        );
        add_cookie(ctx, cookie, self.config.allow_reclaim);
    }

    fn decode_cookie_value(&self, value: &str) -> String {
        let Some(decode) = &self.config.decode else {
            return value.to_string();
        };

        match decode(&self.config.cookie, value) {
            Ok(sid) => sid,
            Err(e) => {
                debug!("unable to decode cookie '{}': {}", self.config.cookie, e);
                String::new()
            }
        }
    }

    fn encode_cookie_value(&self, sid: &str) -> String {
        let Some(encode) = &self.config.encode else {
            return sid.to_string();
        };

        match encode(&self.config.cookie, sid) {
            Ok(value) => value,
            Err(e) => {
                warn!("unable to encode cookie '{}': {}", self.config.cookie, e);
                String::new()
            }
        }
    }
}
