//! Broker endpoints.

use std::fmt;
use std::hash::{Hash, Hasher};

use brokerpool_traits::Credentials;
use serde::{Deserialize, Serialize};

/// A broker address plus the credentials to present there.
///
/// Two endpoints are equal when their URIs are equal; credentials do not take
/// part in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Broker URI, passed verbatim to the connector.
    pub uri: String,
    /// Optional credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl Endpoint {
    /// Creates an endpoint without credentials.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            credentials: None,
        }
    }

    /// Attaches credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// The broker URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl From<&str> for Endpoint {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for Endpoint {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}
