//! Transport collaborator contracts: components create endpoints, endpoints
//! create producers and consumers.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::traits::Processor;

// ---------------------------------------------------------------------------
// EndpointUri
// ---------------------------------------------------------------------------

/// Parsed `scheme:path?key=value&...` endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    raw: String,
    scheme: String,
    path: String,
    params: BTreeMap<String, String>,
}

/// Malformed endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("endpoint uri `{0}` has no scheme")]
    MissingScheme(String),
    #[error("endpoint uri `{0}` has no path")]
    MissingPath(String),
}

impl EndpointUri {
    /// Parses an endpoint URI. `scheme://path` and `scheme:path` are equivalent.
    ///
    /// # Errors
    ///
    /// Returns [`UriError`] if the scheme or path is empty.
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once(':')
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| UriError::MissingScheme(raw.to_string()))?;
        let rest = rest.trim_start_matches("//");
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        if path.is_empty() {
            return Err(UriError::MissingPath(raw.to_string()));
        }

        let params = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        Ok(Self {
            raw: raw.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            path: path.to_string(),
            params,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parses a parameter, returning `default` when it is absent or malformed.
    #[must_use]
    pub fn param_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.param(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Canonical form used as the endpoint cache key: `scheme:path?sorted-params`.
    #[must_use]
    pub fn normalized(&self) -> String {
        if self.params.is_empty() {
            return format!("{}:{}", self.scheme, self.path);
        }
        let query: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}:{}?{}", self.scheme, self.path, query.join("&"))
    }

    /// The URI as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// Endpoint / Consumer / Component
// ---------------------------------------------------------------------------

/// Feeds exchanges obtained from a transport into a route's entry processor.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Begins accepting exchanges.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stops accepting new exchanges. Exchanges already handed to the route
    /// are not affected.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// An addressable transport destination.
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    /// Creates a producer: a processor that delivers exchanges to this endpoint.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot produce.
    fn create_producer(&self) -> anyhow::Result<Arc<dyn Processor>>;

    /// Creates a consumer that feeds `processor`.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot consume, or already has a consumer and
    /// allows only one.
    fn create_consumer(&self, processor: Arc<dyn Processor>) -> anyhow::Result<Box<dyn Consumer>>;
}

/// Factory for endpoints of one URI scheme.
///
/// The `Any` bound lets a context return a component by concrete type.
pub trait Component: Send + Sync + Any {
    /// URI scheme handled by this component, lowercase.
    fn scheme(&self) -> &str;

    /// Creates the endpoint for `uri`.
    ///
    /// # Errors
    ///
    /// Fails if `uri` carries parameters the component cannot honor.
    fn create_endpoint(&self, uri: &EndpointUri) -> anyhow::Result<Arc<dyn Endpoint>>;
}
