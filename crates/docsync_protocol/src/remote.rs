//! Remote peer URLs.

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;
use url::Url;

/// Joins a base URL and a relative path with exactly one slash between them.
///
/// Any number of trailing slashes on `base` and leading slashes on `path`
/// collapse into one, so joining is idempotent with respect to how callers
/// spell their paths.
///
/// ```
/// use docsync_protocol::join_url;
///
/// assert_eq!(join_url("http://host/db/", "/doc"), "http://host/db/doc");
/// assert_eq!(join_url("http://host/db", "doc"), "http://host/db/doc");
/// ```
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// The URL of a remote database, with its query string removed.
///
/// Query parameters present at parse time are kept aside because some
/// authorizers are configured through them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    url: Url,
    query: Vec<(String, String)>,
}

impl RemoteUrl {
    /// Parses and validates a remote database URL.
    pub fn parse(input: &str) -> ProtocolResult<Self> {
        let mut url = Url::parse(input).map_err(|e| ProtocolError::invalid_url(input, e))?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(ProtocolError::invalid_url(input, "URL has no host"));
        }

        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self { url, query })
    }

    /// The URL as a string, without query or fragment.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The parsed URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Looks up a query parameter that was present at parse time.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Lowercased `scheme://host[:port]` of the remote.
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization().to_lowercase()
    }

    /// Resolves a path relative to the remote database.
    pub fn join(&self, path: &str) -> String {
        join_url(self.as_str(), path)
    }

    /// Resolves a path against the server root rather than the database.
    pub fn join_root(&self, path: &str) -> String {
        let absolute = format!("/{}", path.trim_start_matches('/'));
        self.url
            .join(&absolute)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| self.join(path))
    }
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
