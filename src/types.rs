//! Core types: credentials, the credentials provider seam, and object URLs

use crate::error::Error;
use url::Url;

/// A static access-key identity for the object store.
///
/// Fetched through [`ProvideCredentials`] once per signed request and never
/// cached past a single signing, so short-lived credentials rotate
/// naturally.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(
        region: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            region: region.into(),
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }
}

/// Source of credentials, invoked once per signed request.
///
/// Implemented by closures returning `Result<Credentials, _>` and by
/// [`Credentials`] itself for the static case.
pub trait ProvideCredentials {
    fn provide(&self) -> Result<Credentials, Box<dyn std::error::Error + Send + Sync>>;
}

impl ProvideCredentials for Credentials {
    fn provide(&self) -> Result<Credentials, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.clone())
    }
}

impl<F> ProvideCredentials for F
where
    F: Fn() -> Result<Credentials, Box<dyn std::error::Error + Send + Sync>>,
{
    fn provide(&self) -> Result<Credentials, Box<dyn std::error::Error + Send + Sync>> {
        self()
    }
}

/// Parsed location of the remote object, path-style.
#[derive(Debug, Clone)]
pub(crate) struct ObjectUrl {
    /// `scheme://authority`, no trailing slash.
    pub endpoint: String,
    /// Authority as sent in the signed `host` header (includes the port
    /// when non-default).
    pub host: String,
    /// `/bucket/key`, percent-encoded as received.
    pub path: String,
}

impl ObjectUrl {
    /// Parse an `http(s)://host/bucket/key` URL.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let url = Url::parse(raw).map_err(|e| Error::Url(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::Url(format!("unsupported scheme {other:?}"))),
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Url("missing host".to_string()))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = url.path().to_string();
        if path == "/" || path.is_empty() {
            return Err(Error::Url("missing object key in path".to_string()));
        }
        Ok(Self {
            endpoint: format!("{}://{}", url.scheme(), authority),
            host: authority,
            path,
        })
    }

    /// Full request URL for the given already-encoded query string.
    pub fn request_url(&self, query: &str) -> String {
        if query.is_empty() {
            format!("{}{}", self.endpoint, self.path)
        } else {
            format!("{}{}?{}", self.endpoint, self.path, query)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_style_url() {
        let url = ObjectUrl::parse("http://localhost:9000/my-bucket/my.db").unwrap();
        assert_eq!(url.endpoint, "http://localhost:9000");
        assert_eq!(url.host, "localhost:9000");
        assert_eq!(url.path, "/my-bucket/my.db");
    }

    #[test]
    fn test_parse_default_port_omitted_from_host() {
        let url = ObjectUrl::parse("https://s3.eu-west-2.amazonaws.com/bucket/key.db").unwrap();
        assert_eq!(url.host, "s3.eu-west-2.amazonaws.com");
    }

    #[test]
    fn test_parse_nested_key() {
        let url = ObjectUrl::parse("http://localhost:9000/b/deep/path/my.db").unwrap();
        assert_eq!(url.path, "/b/deep/path/my.db");
    }

    #[test]
    fn test_rejects_missing_key() {
        assert!(ObjectUrl::parse("http://localhost:9000/").is_err());
        assert!(ObjectUrl::parse("http://localhost:9000").is_err());
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        assert!(ObjectUrl::parse("ftp://localhost/bucket/key").is_err());
    }

    #[test]
    fn test_request_url_with_query() {
        let url = ObjectUrl::parse("http://localhost:9000/b/k.db").unwrap();
        assert_eq!(
            url.request_url("versionId=abc"),
            "http://localhost:9000/b/k.db?versionId=abc"
        );
        assert_eq!(url.request_url(""), "http://localhost:9000/b/k.db");
    }

    #[test]
    fn test_static_credentials_provide_themselves() {
        let creds = Credentials::new("us-east-1", "AKID", "secret", None);
        let fetched = creds.provide().unwrap();
        assert_eq!(fetched.access_key_id, "AKID");
    }
}
