//! Request/response surface the sessions manager works against.

use cookie::Cookie;
use http::header::{COOKIE, HOST, SET_COOKIE};
use http::uri::Scheme;
use http::{HeaderMap, HeaderValue, Request};
use log::warn;

/// The parts of an HTTP exchange the sessions manager reads and writes.
pub trait Context {
    /// Value of the named request cookie, if sent.
    fn request_cookie(&self, name: &str) -> Option<String>;

    /// Request host, possibly with a port.
    fn host(&self) -> &str;

    fn is_tls(&self) -> bool;

    /// Adds a `Set-Cookie` to the response, replacing an earlier one with
    /// the same name.
    fn set_response_cookie(&mut self, cookie: Cookie<'static>);

    /// Makes `name=value` visible to later [`Context::request_cookie`] calls
    /// while the current request is still being handled.
    fn reclaim_request_cookie(&mut self, name: &str, value: &str);

    /// Hides a request cookie from the rest of the current request.
    fn remove_request_cookie(&mut self, name: &str);
}

/// [`Context`] over `http` crate types: request headers in, response
/// headers out.
#[derive(Debug, Clone, Default)]
pub struct HttpContext {
    request_headers: HeaderMap,
    host: String,
    tls: bool,
    response_headers: HeaderMap,
}

impl HttpContext {
    /// Context for a request described only by its headers. The host comes
    /// from the `Host` header.
    pub fn new(request_headers: HeaderMap) -> Self {
        let host = request_headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Self {
            request_headers,
            host,
            tls: false,
            response_headers: HeaderMap::new(),
        }
    }

    /// Context for `req`. The host falls back to the URI authority when no
    /// `Host` header was sent, and TLS is inferred from an `https` URI.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let mut ctx = Self::new(req.headers().clone());
        if ctx.host.is_empty()
            && let Some(authority) = req.uri().authority()
        {
            ctx.host = authority.as_str().to_string();
        }
        ctx.tls = req.uri().scheme() == Some(&Scheme::HTTPS);
        ctx
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Marks the connection as TLS, for servers that terminate TLS
    /// themselves and see plain request URIs.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn into_response_headers(self) -> HeaderMap {
        self.response_headers
    }

    /// Every cookie set on the response so far.
    pub fn response_cookies(&self) -> Vec<Cookie<'static>> {
        self.response_headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|s| Cookie::parse(s.to_owned()).ok())
            .collect()
    }

    pub fn response_cookie(&self, name: &str) -> Option<Cookie<'static>> {
        self.response_cookies()
            .into_iter()
            .find(|c| c.name() == name)
    }

    fn request_pairs(&self) -> Vec<(String, String)> {
        self.request_headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|s| Cookie::split_parse(s.to_owned()))
            .filter_map(|c| c.ok())
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect()
    }

    fn write_request_pairs(&mut self, pairs: &[(String, String)]) {
        self.request_headers.remove(COOKIE);
        if pairs.is_empty() {
            return;
        }

        let joined = pairs
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        match HeaderValue::from_str(&joined) {
            Ok(value) => {
                self.request_headers.insert(COOKIE, value);
            }
            Err(e) => warn!("unable to rewrite the request Cookie header: {}", e),
        }
    }
}

impl Context for HttpContext {
    fn request_cookie(&self, name: &str) -> Option<String> {
        self.request_pairs()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn is_tls(&self) -> bool {
        self.tls
    }

    fn set_response_cookie(&mut self, cookie: Cookie<'static>) {
        let value = match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => value,
            Err(e) => {
                warn!("unable to encode cookie '{}': {}", cookie.name(), e);
                return;
            }
        };

        let kept: Vec<HeaderValue> = self
            .response_headers
            .get_all(SET_COOKIE)
            .iter()
            .filter(|v| {
                v.to_str()
                    .ok()
                    .and_then(|s| Cookie::parse(s).ok())
                    .is_none_or(|c| c.name() != cookie.name())
            })
            .cloned()
            .collect();

        self.response_headers.remove(SET_COOKIE);
        for v in kept {
            self.response_headers.append(SET_COOKIE, v);
        }
        self.response_headers.append(SET_COOKIE, value);
    }

    fn reclaim_request_cookie(&mut self, name: &str, value: &str) {
        let mut pairs: Vec<(String, String)> = self
            .request_pairs()
            .into_iter()
            .filter(|(n, _)| n != name)
            .collect();
        if !value.is_empty() {
            pairs.push((name.to_string(), value.to_string()));
        }
        self.write_request_pairs(&pairs);
    }

    fn remove_request_cookie(&mut self, name: &str) {
        self.reclaim_request_cookie(name, "");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cookie: &str) -> Request<()> {
        Request::builder()
            .uri("https://app.example.com/login")
            .header(HOST, "app.example.com:8443")
            .header(COOKIE, cookie)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_from_request() {
        let ctx = HttpContext::from_request(&request("sessionid=abc; theme=dark"));

        assert_eq!(ctx.host(), "app.example.com:8443");
        assert!(ctx.is_tls());
        assert_eq!(ctx.request_cookie("sessionid").as_deref(), Some("abc"));
        assert_eq!(ctx.request_cookie("theme").as_deref(), Some("dark"));
        assert_eq!(ctx.request_cookie("missing"), None);
    }

    #[test]
    fn test_reclaim_and_remove() {
        let mut ctx = HttpContext::from_request(&request("sessionid=old; theme=dark"));

        ctx.reclaim_request_cookie("sessionid", "new");
        assert_eq!(ctx.request_cookie("sessionid").as_deref(), Some("new"));
        assert_eq!(ctx.request_cookie("theme").as_deref(), Some("dark"));

        ctx.remove_request_cookie("sessionid");
        assert_eq!(ctx.request_cookie("sessionid"), None);
        assert_eq!(ctx.request_cookie("theme").as_deref(), Some("dark"));
    }

    #[test]
    fn test_response_cookie_replaces_same_name() {
        let mut ctx = HttpContext::default();
        ctx.set_response_cookie(Cookie::new("sessionid", "one"));
        ctx.set_response_cookie(Cookie::new("other", "x"));
        ctx.set_response_cookie(Cookie::new("sessionid", "two"));

        assert_eq!(ctx.response_cookies().len(), 2);
        assert_eq!(ctx.response_cookie("sessionid").unwrap().value(), "two");
    }
}
