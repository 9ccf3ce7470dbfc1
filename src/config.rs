use crate::core::{Clock, Result, SessionError, SystemClock};
use chrono::Duration;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_COOKIE_NAME: &str = "sessionid";

/// Error type of the cookie value hooks.
pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// Encodes a session id into the cookie value: `(cookie_name, sid)`.
pub type CookieEncoder = Arc<dyn Fn(&str, &str) -> std::result::Result<String, CodecError> + Send + Sync>;

/// Reverses [`CookieEncoder`]: `(cookie_name, cookie_value)`.
pub type CookieDecoder = Arc<dyn Fn(&str, &str) -> std::result::Result<String, CodecError> + Send + Sync>;

pub type SessionIdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Sessions manager configuration
#[derive(Clone)]
pub struct SessionsConfig {
    /// Name of the session cookie
    pub cookie: String,

    /// Session lifetime. Zero never expires; a negative duration lasts
    /// until the browser is closed.
    pub expires: Duration,

    /// Make a newly issued cookie visible to the rest of the request
    pub allow_reclaim: bool,

    /// Scope the cookie to the exact request host instead of the parent domain
    pub disable_subdomain_persistence: bool,

    /// Mark the cookie `Secure` on TLS requests
    pub cookie_secure_tls: bool,

    pub encode: Option<CookieEncoder>,
    pub decode: Option<CookieDecoder>,

    pub session_id_generator: SessionIdGenerator,

    pub clock: Arc<dyn Clock>,
}

impl SessionsConfig {
    pub fn new() -> Self {
        Self {
            cookie: DEFAULT_COOKIE_NAME.to_string(),
            expires: Duration::zero(),
            allow_reclaim: false,
            disable_subdomain_persistence: false,
            cookie_secure_tls: false,
            encode: None,
            decode: None,
            session_id_generator: Arc::new(|| Uuid::new_v4().to_string()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the cookie name
    pub fn cookie(mut self, name: &str) -> Self {
        self.cookie = name.to_string();
        self
    }

    /// Set the session lifetime
    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = expires;
        self
    }

    pub fn allow_reclaim(mut self, allow: bool) -> Self {
        self.allow_reclaim = allow;
        self
    }

    pub fn disable_subdomain_persistence(mut self, disable: bool) -> Self {
        self.disable_subdomain_persistence = disable;
        self
    }

    pub fn cookie_secure_tls(mut self, secure: bool) -> Self {
        self.cookie_secure_tls = secure;
        self
    }

    /// Set the cookie value codec. Both halves are required.
    pub fn encoding<E, D>(mut self, encode: E, decode: D) -> Self
    where
        E: Fn(&str, &str) -> std::result::Result<String, CodecError> + Send + Sync + 'static,
        D: Fn(&str, &str) -> std::result::Result<String, CodecError> + Send + Sync + 'static,
    {
        self.encode = Some(Arc::new(encode));
        self.decode = Some(Arc::new(decode));
        self
    }

    pub fn session_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.session_id_generator = Arc::new(generator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cookie.is_empty() {
            return Err(SessionError::Config(
                "Cookie name cannot be empty".to_string(),
            ));
        }

        if let Some(c) = self.cookie.chars().find(|c| !is_token_char(*c)) {
            return Err(SessionError::Config(format!(
                "Cookie name '{}' contains invalid character {:?}",
                self.cookie, c
            )));
        }

        if self.encode.is_some() != self.decode.is_some() {
            return Err(SessionError::Config(
                "encode and decode must be set together".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionsConfig")
            .field("cookie", &self.cookie)
            .field("expires", &self.expires)
            .field("allow_reclaim", &self.allow_reclaim)
            .field(
                "disable_subdomain_persistence",
                &self.disable_subdomain_persistence,
            )
            .field("cookie_secure_tls", &self.cookie_secure_tls)
            .field("encoding", &self.encode.is_some())
            .field("clock", &self.clock)
            .finish()
    }
}

/// RFC 6265 cookie-name token: visible ASCII minus separators.
fn is_token_char(c: char) -> bool {
    c.is_ascii_graphic() && !"()<>@,;:\\\"/[]?={}".contains(c)
}
