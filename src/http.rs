//! HTTP client seam: a minimal streaming-GET trait and its reqwest-backed
//! default implementation
//!
//! The trait exists so tests can interpose on the transport (reroute through
//! a counting proxy, inject surplus bytes) exactly where a production caller
//! would plug in a preconfigured client.

use crate::error::Error;
use std::io::Read;
use std::time::Duration;
use tracing::debug;

/// A streaming HTTP response: status, lowercased headers, and a body to be
/// consumed incrementally.
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Box<dyn Read>,
}

impl HttpResponse {
    /// First header value for `name` (lowercase).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// The single operation the session needs from a transport: begin a
/// streaming GET with an ordered header list.
///
/// Implementations must reuse one underlying connection across sequential
/// requests to the same host for the lifetime of the client.
pub trait HttpClient {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, Error>;
}

/// Default transport over a blocking reqwest client.
///
/// Holds at most one idle connection per host; since the engine serializes
/// reads, a session issues every request over the same connection.
pub struct DefaultClient {
    inner: reqwest::blocking::Client,
}

impl DefaultClient {
    pub fn new(timeout: Option<Duration>) -> Result<Self, Error> {
        let mut builder = reqwest::blocking::Client::builder().pool_max_idle_per_host(1);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let inner = builder.build().map_err(Error::network)?;
        Ok(Self { inner })
    }
}

impl HttpClient for DefaultClient {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, Error> {
        let mut request = self.inner.get(url);
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request.send().map_err(Error::network)?;
        let status = response.status().as_u16();
        let response_headers = response
            .headers()
            .iter()
            .map(|(key, value)| {
                (
                    key.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        debug!(%url, status, "GET");
        Ok(HttpResponse {
            status,
            headers: response_headers,
            body: Box::new(response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_lookup_is_first_match() {
        let response = HttpResponse {
            status: 206,
            headers: vec![
                ("content-range".to_string(), "bytes 0-99/4096".to_string()),
                ("x-amz-version-id".to_string(), "v1".to_string()),
            ],
            body: Box::new(Cursor::new(Vec::new())),
        };
        assert_eq!(response.header("content-range"), Some("bytes 0-99/4096"));
        assert_eq!(response.header("x-amz-version-id"), Some("v1"));
        assert_eq!(response.header("etag"), None);
    }
}
