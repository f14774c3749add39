use std::collections::HashMap;

use actix_web::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use actix_web::HttpRequest;

/// Headers that describe a single connection and never cross the relay.
pub const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::HOST,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// An immutable set of request headers. Every operation returns a new set.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    map: HeaderMap,
}

impl HeaderSet {

    pub fn from_request(request: &HttpRequest) -> Self {
        Self { map: request.headers().clone() }
    }

    /// Headers as carried inside a tunnel message. Names or values that are
    /// not valid HTTP are dropped.
    pub fn from_map(headers: &HashMap<String, String>) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => map.append(name, value),
                _ => log::debug!("Dropping invalid header {:?}", name),
            }
        }
        Self { map }
    }

    pub fn with_override(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.map.insert(name, value);
        self
    }

    pub fn without(mut self, names: &[HeaderName]) -> Self {
        for name in names {
            self.map.remove(name);
        }
        self
    }

    pub fn get(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.map.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
