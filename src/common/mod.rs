pub mod encryption;
pub mod error;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use actix_web::http::uri::PathAndQuery;
use actix_web::http::Method;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::common::error::DecryptError;

pub const HEADER_DECRYPTED: &str = "x-decrypted";

pub const HEADER_FORWARDED_HOST: &str = "x-forwarded-host";

pub const HEADER_FORWARDED_PROTO: &str = "x-forwarded-proto";

pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";

pub const HEADER_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

pub fn print_banner(mode: &str) {
    // We don't need this as a constant because it will be shown only once.
    let banner: &str = "\n\n\

\x20                _____
\x20             \\'_   _'/
\x20              |(>)-(<)|
\x20           ../   εO϶   \\..
\x20  -------''(((:-.,_,.-:)))''--------
\x20  ==================================\n";
    println!("{}\x20  Mode: {}\n\n", banner, mode);
}

/// The body of a `POST /` once it has been looked at.
#[derive(Debug)]
pub enum InboundBody {
    /// Not JSON, or JSON without a usable `payload`; forwarded as is.
    Passthrough(Bytes),
    Sealed(SealedEnvelope),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    pub payload: String,
}

pub fn parse_envelope(raw: Bytes) -> InboundBody {
    let json: Value = match serde_json::from_slice(&raw) {
        Ok(json) => json,
        Err(_) => return InboundBody::Passthrough(raw),
    };
    let payload = match json.get("payload") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        // Anything else is still an attempt at a sealed envelope; it will fail to open.
        Some(other) => Some(other.to_string()),
    };
    match payload {
        Some(payload) => InboundBody::Sealed(SealedEnvelope { payload }),
        None => {
            log::warn!("No payload field found. Skipping decryption.");
            InboundBody::Passthrough(raw)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TunnelMessage {
    request_id: String,
    method: String,
    path: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    is_base64: bool,
}

/// One upstream request replayed from a full-tunnel message.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl fmt::Display for TunnelRequest {

    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} (tunnel request {})", self.method, self.path, self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyMessage {
    pub data: Value,
}

impl LegacyMessage {

    /// The outbound body and its content type. Strings go out verbatim;
    /// only objects and arrays are sent as JSON.
    pub fn body(&self) -> (Bytes, &'static str) {
        match &self.data {
            Value::Null => (Bytes::new(), "text/plain"),
            Value::String(s) => (Bytes::from(s.clone()), "text/plain"),
            scalar @ (Value::Bool(_) | Value::Number(_)) => (Bytes::from(scalar.to_string()), "text/plain"),
            other => (Bytes::from(other.to_string()), "application/json"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DecryptedContext {
    Legacy(LegacyMessage),
    FullTunnel(TunnelRequest),
}

/// A context is full-tunnel iff it carries both `method` and `requestId`.
pub fn classify(plaintext: Value) -> Result<DecryptedContext, DecryptError> {
    let object = match plaintext {
        Value::Object(object) => object,
        _ => return Err(DecryptError),
    };
    if !(object.contains_key("method") && object.contains_key("requestId")) {
        let data = object.get("data").cloned().unwrap_or(Value::Null);
        return Ok(DecryptedContext::Legacy(LegacyMessage { data }));
    }

    let message: TunnelMessage = serde_json::from_value(Value::Object(object)).map_err(|_| DecryptError)?;
    let method = Method::from_bytes(message.method.to_ascii_uppercase().as_bytes()).map_err(|_| DecryptError)?;
    let path = if message.path.starts_with('/') { message.path } else { format!("/{}", message.path) };
    PathAndQuery::from_str(&path).map_err(|_| DecryptError)?;

    let body = match message.body {
        Value::Null => None,
        Value::String(s) if message.is_base64 => {
            Some(Bytes::from(encryption::decode_base64(&s).map_err(|_| DecryptError)?))
        }
        Value::String(s) => Some(Bytes::from(s)),
        other => Some(Bytes::from(other.to_string())),
    };

    Ok(DecryptedContext::FullTunnel(TunnelRequest {
        request_id: message.request_id,
        method,
        path,
        headers: message.headers,
        body,
    }))
}
