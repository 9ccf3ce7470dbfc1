//! Session-backed web server.
//!
//! Run with: cargo run --example web_demo -- --data ./sessions.db

use anyhow::{Context as _, Result};
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use sessiondb::{
    Database, FileDatabase, HttpContext, MemoryDatabase, Session, SessionError, Sessions,
    SessionsConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "web_demo", about = "Server-side sessions over HTTP")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Session file; sessions are kept in memory when omitted
    #[arg(long)]
    data: Option<PathBuf>,

    /// Session lifetime in seconds (0 never expires, negative until browser close)
    #[arg(long, default_value_t = 2 * 60 * 60, allow_hyphen_values = true)]
    expires: i64,

    /// Session cookie name
    #[arg(long, default_value = sessiondb::DEFAULT_COOKIE_NAME)]
    cookie: String,
}

#[derive(Clone)]
struct AppState {
    sessions: Arc<Sessions>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let db: Arc<dyn Database> = match &args.data {
        Some(path) => {
            info!(path = %path.display(), "session backend: file");
            Arc::new(FileDatabase::open(path).context("failed to open session file")?)
        }
        None => {
            info!("session backend: memory");
            Arc::new(MemoryDatabase::new())
        }
    };

    let config = SessionsConfig::new()
        .cookie(&args.cookie)
        .expires(chrono::Duration::seconds(args.expires))
        .allow_reclaim(true);
    let mut sessions = Sessions::with_database(config, db).context("invalid session config")?;
    sessions.on_destroy(|sid| info!(sid, "session destroyed"));

    let app = router(AppState {
        sessions: Arc::new(sessions),
    });

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind to {}", args.addr))?;
    info!(address = %args.addr, "web demo started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/set", get(set_name))
        .route("/set/:key/:value", get(set_value))
        .route("/get/:key", get(get_value))
        .route("/delete", get(delete_name))
        .route("/clear", get(clear))
        .route("/destroy", get(destroy))
        .route("/update", get(update))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sessiondb=debug,web_demo=debug,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn index() -> &'static str {
    "You should navigate to the /set, /get, /delete, /clear, /destroy or /update instead"
}

async fn set_name(State(state): State<AppState>, headers: HeaderMap) -> Response {
    with_session(state, headers, |session| {
        session.set("name", "iris")?;
        Ok(format!(
            "All ok session value of the 'name' is: {}",
            session.get_string("name")
        ))
    })
    .await
}

async fn set_value(
    State(state): State<AppState>,
    Path((key, value)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    with_session(state, headers, move |session| {
        session.set(&key, value.as_str())?;
        Ok(format!(
            "All ok session value of the '{}' is: {}",
            key,
            session.get_string(&key)
        ))
    })
    .await
}

async fn get_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    with_session(state, headers, move |session| {
        Ok(format!(
            "The '{}' on the /set was: {}",
            key,
            session.get_string(&key)
        ))
    })
    .await
}

async fn delete_name(State(state): State<AppState>, headers: HeaderMap) -> Response {
    with_session(state, headers, |session| {
        session.delete("name")?;
        Ok("Deleted 'name'".to_string())
    })
    .await
}

async fn clear(State(state): State<AppState>, headers: HeaderMap) -> Response {
    with_session(state, headers, |session| {
        session.clear()?;
        Ok("Cleared".to_string())
    })
    .await
}

async fn destroy(State(state): State<AppState>, headers: HeaderMap) -> Response {
    with_context(state, headers, |sessions, ctx| {
        sessions.destroy(ctx)?;
        Ok("Destroyed".to_string())
    })
    .await
}

async fn update(State(state): State<AppState>, headers: HeaderMap) -> Response {
    with_context(state, headers, |sessions, ctx| {
        sessions.shift_expiration(ctx)?;
        Ok("Session expiration updated".to_string())
    })
    .await
}

/// Starts the request's session and hands it to `f`.
async fn with_session<F>(state: AppState, headers: HeaderMap, f: F) -> Response
where
    F: FnOnce(&Session) -> sessiondb::Result<String> + Send + 'static,
{
    with_context(state, headers, move |sessions, ctx| {
        let session = sessions.start(ctx)?;
        f(&session)
    })
    .await
}

/// Runs `f` on the blocking pool; the session backends do synchronous I/O.
async fn with_context<F>(state: AppState, headers: HeaderMap, f: F) -> Response
where
    F: FnOnce(&Sessions, &mut HttpContext) -> sessiondb::Result<String> + Send + 'static,
{
    let sessions = state.sessions.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let mut ctx = HttpContext::new(headers);
        let result = f(&sessions, &mut ctx);
        (ctx.into_response_headers(), result)
    })
    .await;

    match joined {
        Ok((headers, Ok(body))) => (headers, body).into_response(),
        Ok((headers, Err(err))) => error_response(headers, err),
        Err(err) => {
            error!(error = %err, "session task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn error_response(headers: HeaderMap, err: SessionError) -> Response {
    let status = err.status_code();
    if status.is_server_error() || status == StatusCode::NOT_MODIFIED {
        error!(error = %err, "session operation failed");
    }
    (status, headers, err.to_string()).into_response()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "unable to install Ctrl+C signal handler");
        std::future::pending::<()>().await;
    }
}
