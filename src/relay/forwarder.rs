use std::time::Duration;

use actix_web::http::header::{self, HeaderName, HeaderValue};
use actix_web::http::{Method, StatusCode, Uri};
use actix_web::web;
use awc::error::PayloadError;
use bytes::Bytes;
use futures_util::stream::{LocalBoxStream, StreamExt};

use crate::common;
use crate::common::error::RelayError;
use crate::relay::headers::{HeaderSet, HOP_BY_HOP};
use crate::relay::routes::Upstream;

const DEFAULT_FORWARDED_FOR: &str = "127.0.0.1";

pub type UpstreamBody = LocalBoxStream<'static, Result<Bytes, PayloadError>>;

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: header::HeaderMap,
    pub body: UpstreamBody,
}

pub enum OutboundBody {
    Empty,
    Full(Bytes),
    /// The live inbound payload, piped without buffering.
    Streaming(web::Payload),
}

pub struct OutboundRequest {
    pub method: Method,
    pub target: Uri,
    pub headers: HeaderSet,
    pub body: OutboundBody,
}

/// What gets added to every outbound request besides the caller's headers.
#[derive(Debug, Clone)]
pub struct ForwardingPolicy {
    pub default_forwarded_host: HeaderValue,
    pub prefix: Option<HeaderValue>,
}

impl ForwardingPolicy {

    /// Drops hop-by-hop headers and injects `host` plus the `x-forwarded-*` set.
    /// `identity` asks the upstream for an uncompressed body.
    pub fn outbound_headers(&self, inbound: HeaderSet, upstream: &Upstream, identity: bool) -> HeaderSet {
        let forwarded_host = inbound
            .get(&header::HOST)
            .cloned()
            .unwrap_or_else(|| self.default_forwarded_host.clone());
        let forwarded_for = inbound
            .get(&HeaderName::from_static(common::HEADER_FORWARDED_FOR))
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_FORWARDED_FOR));

        let mut headers = inbound
            .without(&HOP_BY_HOP)
            .with_override(header::HOST, upstream.host_header())
            .with_override(HeaderName::from_static(common::HEADER_FORWARDED_HOST), forwarded_host)
            .with_override(HeaderName::from_static(common::HEADER_FORWARDED_PROTO), HeaderValue::from_static("https"))
            .with_override(HeaderName::from_static(common::HEADER_FORWARDED_FOR), forwarded_for);
        if let Some(prefix) = &self.prefix {
            headers = headers.with_override(HeaderName::from_static(common::HEADER_FORWARDED_PREFIX), prefix.clone());
        }
        if identity {
            headers = headers.with_override(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }
        headers
    }
}

/// Issues requests to local services. One per worker; `awc::Client` is not `Send`.
pub struct Forwarder {
    client: awc::Client,
}

impl Forwarder {

    pub fn new(timeout: Duration) -> Self {
        let client = awc::Client::builder()
            .disable_redirects()
            .no_default_headers()
            .timeout(timeout)
            .finish();
        Self { client }
    }

    /// Sends the request and hands back the response with its body still
    /// streaming. Connection-level failures become `UpstreamUnreachable`;
    /// nothing is retried.
    pub async fn forward(&self, request: OutboundRequest) -> Result<UpstreamResponse, RelayError> {
        let mut outbound = self
            .client
            .request(request.method, request.target)
            .no_decompress();
        for (name, value) in request.headers.iter() {
            outbound = outbound.append_header((name.clone(), value.clone()));
        }

        let sent = match request.body {
            OutboundBody::Empty => outbound.send().await,
            OutboundBody::Full(bytes) => outbound.send_body(bytes).await,
            OutboundBody::Streaming(payload) => outbound.send_stream(payload).await,
        };
        let response = sent.map_err(RelayError::unreachable)?;

        Ok(UpstreamResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.boxed_local(),
        })
    }
}
