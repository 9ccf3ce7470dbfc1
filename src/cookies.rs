//! Session cookie construction and the cookie-domain policy.

use crate::context::Context;
use chrono::{DateTime, Duration, Months, Utc};
use cookie::Cookie;
use time::{Duration as CookieDuration, OffsetDateTime};
use std::net::IpAddr;

/// 2009-11-10T23:00:00Z, the `Expires` of a deletion cookie.
const COOKIE_EXPIRE_DELETE_UNIX: i64 = 1_257_894_000;

/// `Expires` of a deletion cookie.
pub fn cookie_expire_delete() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + CookieDuration::seconds(COOKIE_EXPIRE_DELETE_UNIX)
}

/// `Expires` of a cookie for a session that never expires: 24 years,
/// 10 months and 10 days from `now`.
pub fn cookie_expire_unlimited(now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_add_months(Months::new(24 * 12 + 10))
        .and_then(|t| t.checked_add_signed(Duration::days(10)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn to_offset_date_time(t: DateTime<Utc>) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(t.timestamp()).ok()
}

/// Builds the session cookie.
///
/// A non-negative `expires` sets both `Expires` and `Max-Age` (zero meaning
/// the far-future "unlimited" date); a negative one sets neither, leaving a
/// cookie that ends with the browser session.
pub fn build_session_cookie(
    name: &str,
    value: String,
    domain: Option<String>,
    secure: bool,
    expires: Duration,
    now: DateTime<Utc>,
) -> Cookie<'static> {
    let mut builder = Cookie::build((name.to_string(), value))
        .path("/")
        .http_only(true);

    if let Some(domain) = domain {
        builder = builder.domain(domain);
    }
    if secure {
        builder = builder.secure(true);
    }

    if expires >= Duration::zero() {
        let expires_at = if expires.is_zero() {
            cookie_expire_unlimited(now)
        } else {
            now.checked_add_signed(expires)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        };

        if let Some(at) = to_offset_date_time(expires_at) {
            builder = builder.expires(at);
        }
        builder = builder.max_age(CookieDuration::seconds((expires_at - now).num_seconds()));
    }

    builder.build()
}

/// A cookie that makes the browser drop `name`.
pub fn build_removal_cookie(name: &str, domain: Option<String>) -> Cookie<'static> {
    let mut builder = Cookie::build((name.to_string(), String::new()))
        .path("/")
        .http_only(true)
        .expires(cookie_expire_delete())
        .max_age(CookieDuration::ZERO);

    if let Some(domain) = domain {
        builder = builder.domain(domain);
    }
    builder.build()
}

/// Sends `cookie`; with `reclaim` the rest of the request sees it too.
pub fn add_cookie<C: Context + ?Sized>(ctx: &mut C, cookie: Cookie<'static>, reclaim: bool) {
    if reclaim {
        ctx.reclaim_request_cookie(cookie.name(), cookie.value());
    }
    ctx.set_response_cookie(cookie);
}

/// Tells the client to drop the cookie `name` if it sent one; with
/// `reclaim` the cookie also disappears from the current request.
pub fn remove_cookie<C: Context + ?Sized>(
    ctx: &mut C,
    name: &str,
    disable_subdomain_persistence: bool,
    reclaim: bool,
) {
    if ctx.request_cookie(name).is_some() {
        let domain = format_cookie_domain(ctx.host(), disable_subdomain_persistence);
        add_cookie(ctx, build_removal_cookie(name, domain), reclaim);
    }
    if reclaim {
        ctx.remove_request_cookie(name);
    }
}

/// Non-empty value of the request cookie `name`.
pub fn get_cookie<C: Context + ?Sized>(ctx: &C, name: &str) -> Option<String> {
    ctx.request_cookie(name).filter(|v| !v.is_empty())
}

/// Whether a `Domain` attribute may be set for `domain`. Loopback and IP
/// hosts, and hosts without a dot, may not.
pub fn is_valid_cookie_domain(domain: &str) -> bool {
    if domain == "0.0.0.0" || domain == "127.0.0.1" {
        return false;
    }

    match domain.find('.') {
        None => return false,
        Some(dot) if dot == 0 || dot == domain.len() - 1 => return false,
        Some(_) => {}
    }

    domain.parse::<IpAddr>().is_err()
}

/// `Domain` attribute for a request to `host`.
///
/// One level of subdomain is shared: `a.example.com` and
/// `x.a.example.com` yield `.example.com` and `.a.example.com`.
pub fn format_cookie_domain(host: &str, disable_subdomain_persistence: bool) -> Option<String> {
    if disable_subdomain_persistence {
        return None;
    }

    let host = match host.find(':') {
        Some(port) if port > 0 => &host[..port],
        _ => host,
    };
    if !is_valid_cookie_domain(host) {
        return None;
    }

    let domain = match host.split_once('.') {
        Some((_, parent)) if parent.contains('.') => parent,
        _ => host,
    };
    Some(format!(".{}", domain))
}
