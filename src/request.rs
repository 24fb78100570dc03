//! Minimal read-only view of an inbound request.
//!
//! Rules only ever see this value. Parsing, normalization and the transport
//! belong to the embedding application.

use http::{header::HeaderName, HeaderMap, HeaderValue, Method};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// An inbound request as seen by the rules
#[derive(Debug, Clone)]
pub struct Request {
    ip: String,
    method: Method,
    path: String,
    headers: HeaderMap,
}

impl Request {
    pub fn new(ip: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            method,
            path: path.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Build from an `http::Request` and the peer address it arrived from
    pub fn from_http<B>(request: &http::Request<B>, peer_ip: impl Into<String>) -> Self {
        Self {
            ip: peer_ip.into(),
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            headers: request.headers().clone(),
        }
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Client address, preferring the first `X-Forwarded-For` hop
    pub fn real_ip(&self) -> &str {
        self.header(FORWARDED_FOR)
            .and_then(|v| {
                v.trim()
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .find(|part| !part.is_empty())
            })
            .unwrap_or(&self.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_ip_prefers_forwarded_for() {
        let req = Request::new("10.0.0.1", Method::GET, "/")
            .with_header("X-Forwarded-For", " 203.0.113.7, 10.0.0.2");
        assert_eq!(req.real_ip(), "203.0.113.7");
        assert_eq!(req.ip(), "10.0.0.1");
    }

    #[test]
    fn test_real_ip_falls_back_to_peer() {
        let req = Request::new("10.0.0.1", Method::GET, "/");
        assert_eq!(req.real_ip(), "10.0.0.1");

        let blank = Request::new("10.0.0.1", Method::GET, "/").with_header("x-forwarded-for", "  ");
        assert_eq!(blank.real_ip(), "10.0.0.1");
    }

    #[test]
    fn test_from_http() {
        let http_req = http::Request::builder()
            .method(Method::POST)
            .uri("https://example.com/login?next=/")
            .header("user-agent", "curl/8.0")
            .body(())
            .unwrap();

        let req = Request::from_http(&http_req, "1.2.3.4");
        assert_eq!(req.method(), &Method::POST);
        assert_eq!(req.path(), "/login");
        assert_eq!(req.header("user-agent"), Some("curl/8.0"));
    }
}
