// ============================================================================
// SessionDB Library
// ============================================================================

pub mod config;
pub mod context;
pub mod cookies;
pub mod core;
pub mod manager;
pub mod provider;
pub mod session;
pub mod storage;
pub mod transaction;
pub mod transcoder;

// Re-export main types for convenience
pub use config::{SessionsConfig, DEFAULT_COOKIE_NAME};
pub use context::{Context, HttpContext};
pub use core::{Clock, LifeTime, ManualClock, Result, SessionError, SystemClock, Value};
pub use manager::Sessions;
pub use provider::{DestroyListener, Provider};
pub use session::Session;
pub use transcoder::{JsonTranscoder, MsgPackTranscoder, Transcoder, DEFAULT_TRANSCODER};

// Re-export storage API
pub use storage::{
    BucketStore, Database, DurabilityMode, FileDatabase, FileDatabaseConfig, MemoryDatabase,
    StoreOptions, StoreStats,
};

// ============================================================================
// Quick start
// ============================================================================

/// Starts (or resumes) the session of a request in one call.
///
/// Equivalent to [`Sessions::start`]; handy for handlers that own their
/// context.
///
/// # Examples
///
/// ```
/// use sessiondb::{HttpContext, Sessions, SessionsConfig};
/// use http::HeaderMap;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let sessions = Sessions::new(SessionsConfig::new().cookie("sid"))?;
///
/// // First request: no cookie yet
/// let mut ctx = HttpContext::new(HeaderMap::new()).with_host("app.example.com");
/// let session = sessiondb::start(&sessions, &mut ctx)?;
/// session.set("name", "iris")?;
///
/// // The response now carries the session cookie
/// let cookie = ctx.response_cookie("sid").expect("session cookie");
/// assert_eq!(cookie.value(), session.id());
/// assert_eq!(session.get_string("name"), "iris");
/// # Ok(())
/// # }
/// ```
pub fn start<C: Context + ?Sized>(sessions: &Sessions, ctx: &mut C) -> Result<Session> {
    sessions.start(ctx)
}
