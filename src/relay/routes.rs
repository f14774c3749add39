use std::str::FromStr;

use actix_web::http::header::HeaderValue;
use actix_web::http::Uri;

use crate::common::error::{ConfigError, RelayError};

/// A local service the relay can forward to.
#[derive(Debug, Clone)]
pub struct Upstream {
    uri: Uri,
    base: String,
}

impl Upstream {

    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUpstream { url: url.to_string(), reason: reason.to_string() };
        let uri = Uri::from_str(url.trim()).map_err(|e| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Err(invalid("scheme must be http or https")),
        }
        if uri.authority().is_none() {
            return Err(invalid("missing host"));
        }
        let base = url.trim().trim_end_matches('/').to_string();
        Ok(Self { uri, base })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    /// `host[:port]`, as sent in the `Host` header.
    pub fn host_header(&self) -> HeaderValue {
        let authority = self.uri.authority().map(|a| a.as_str()).unwrap_or_default();
        HeaderValue::from_str(authority).unwrap_or_else(|_| HeaderValue::from_static("localhost"))
    }

    /// Appends a request path (with query) to the upstream base URL. The root
    /// path maps to the base URL itself, so `/` on `http://host/webhook` stays
    /// `/webhook`.
    pub fn join(&self, path: &str) -> Result<Uri, RelayError> {
        let rest = path.strip_prefix('/').unwrap_or(path);
        if rest.is_empty() {
            return Ok(self.uri.clone());
        }
        let target = if rest.starts_with('?') {
            format!("{}{}", self.base, rest)
        } else {
            format!("{}/{}", self.base, rest)
        };
        Uri::from_str(&target).map_err(RelayError::internal)
    }
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub prefix: String,
    pub upstream: Upstream,
}

impl FromStr for RouteEntry {
    type Err = ConfigError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let (prefix, url) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidRoute(entry.to_string()))?;
        let prefix = prefix.trim();
        if !prefix.starts_with('/') {
            return Err(ConfigError::InvalidPrefix(prefix.to_string()));
        }
        Ok(RouteEntry { prefix: prefix.to_string(), upstream: Upstream::parse(url)? })
    }
}

/// Parses `prefix=url,prefix=url`. Blank entries are ignored.
pub fn parse_routes(routes: &str) -> Result<Vec<RouteEntry>, ConfigError> {
    routes
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(RouteEntry::from_str)
        .collect()
}

/// Longest-prefix routing table, built once at startup.
#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    default_upstream: Upstream,
}

impl RouteTable {

    pub fn new(mut entries: Vec<RouteEntry>, default_upstream: Upstream) -> Self {
        // Stable sort: equal-length prefixes keep their insertion order.
        entries.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { entries, default_upstream }
    }

    pub fn resolve(&self, path: &str) -> &Upstream {
        self.entries
            .iter()
            .find(|entry| path.starts_with(&entry.prefix))
            .map(|entry| &entry.upstream)
            .unwrap_or(&self.default_upstream)
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }
}
