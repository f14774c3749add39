use actix_web::body::SizedStream;
use actix_web::http::header::{self, HeaderMap, HeaderValue};
use actix_web::{HttpResponse, HttpResponseBuilder};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};

use crate::common::error::{RelayError, UnreachableReason};
use crate::relay::forwarder::{UpstreamBody, UpstreamResponse};
use crate::relay::headers::HOP_BY_HOP;
use crate::relay::rewriter::{decompress, BodyEncoding, ResponseRewriter};

/// How an upstream response is turned into the relay's response.
pub enum Rewrite<'a> {
    /// Status, headers and body bytes go out as received.
    None,
    Tunnel {
        rewriter: &'a ResponseRewriter,
        upstream_host: &'a str,
        buffer_limit: usize,
    },
}

pub async fn relay_response(upstream: UpstreamResponse, rewrite: Rewrite<'_>) -> Result<HttpResponse, RelayError> {
    let (rewriter, upstream_host, buffer_limit) = match rewrite {
        Rewrite::None => return Ok(stream_through(upstream)),
        Rewrite::Tunnel { rewriter, upstream_host, buffer_limit } => (rewriter, upstream_host, buffer_limit),
    };

    let UpstreamResponse { status, headers, body } = upstream;
    let headers = rewrite_headers(headers, rewriter, upstream_host);
    let encoding = BodyEncoding::from_header(header_str(&headers, &header::CONTENT_ENCODING));

    if !is_html(&headers) || encoding == BodyEncoding::Unsupported {
        return Ok(stream_through(UpstreamResponse { status, headers, body }));
    }

    let raw = match buffer(body, buffer_limit).await? {
        Buffered::Complete(raw) => raw,
        Buffered::Overflow(head, rest) => {
            log::warn!("HTML body exceeds {} bytes, forwarding without rewriting", buffer_limit);
            let body = stream::once(async move { Ok(head) }).chain(rest).boxed_local();
            return Ok(stream_through(UpstreamResponse { status, headers, body }));
        }
    };
    // HEAD answers, 304s and bare redirects have nothing to rewrite.
    if raw.is_empty() {
        let body = stream::empty().boxed_local();
        return Ok(stream_through(UpstreamResponse { status, headers, body }));
    }

    let mut headers = headers;
    let html = match decompress(&raw, encoding) {
        Ok(html) => {
            headers.remove(header::CONTENT_ENCODING);
            html
        }
        Err(e) => {
            log::warn!("Could not decompress HTML body, rewriting raw bytes: {}", e);
            raw.to_vec()
        }
    };
    let rewritten = rewriter.rewrite_html(&html);

    // The body is complete, so the framework writes the real Content-Length.
    let mut response = builder(status, &headers);
    Ok(response.body(rewritten))
}

fn rewrite_headers(mut headers: HeaderMap, rewriter: &ResponseRewriter, upstream_host: &str) -> HeaderMap {
    if let Some(location) = header_str(&headers, &header::LOCATION) {
        if let Some(rewritten) = rewriter.rewrite_location(location, upstream_host) {
            match HeaderValue::from_str(&rewritten) {
                Ok(value) => {
                    headers.insert(header::LOCATION, value);
                }
                Err(_) => log::warn!("Keeping original Location, rewrite is not a valid header"),
            }
        }
    }

    let cookies: Vec<HeaderValue> = headers.get_all(header::SET_COOKIE).cloned().collect();
    if !cookies.is_empty() {
        headers.remove(header::SET_COOKIE);
        for cookie in cookies {
            let value = cookie
                .to_str()
                .ok()
                .map(|c| rewriter.rewrite_set_cookie(c).into_owned())
                .and_then(|c| HeaderValue::from_str(&c).ok())
                .unwrap_or(cookie);
            headers.append(header::SET_COOKIE, value);
        }
    }
    headers
}

fn is_html(headers: &HeaderMap) -> bool {
    header_str(headers, &header::CONTENT_TYPE)
        .map(|v| v.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn builder(status: actix_web::http::StatusCode, headers: &HeaderMap) -> HttpResponseBuilder {
    let mut response = HttpResponse::build(status);
    for (name, value) in headers.iter().filter(|(name, _)| !HOP_BY_HOP.contains(*name)) {
        response.append_header((name.clone(), value.clone()));
    }
    response
}

/// Streams the body as it arrives, keeping the upstream's length when it sent one.
fn stream_through(upstream: UpstreamResponse) -> HttpResponse {
    let length = header_str(&upstream.headers, &header::CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok());
    let mut response = builder(upstream.status, &upstream.headers);
    match length {
        Some(length) => response.body(SizedStream::new(length, upstream.body)),
        None => response.streaming(upstream.body),
    }
}

enum Buffered {
    Complete(Bytes),
    /// What was read before hitting the limit, plus the unread remainder.
    Overflow(Bytes, UpstreamBody),
}

async fn buffer(mut body: UpstreamBody, limit: usize) -> Result<Buffered, RelayError> {
    let mut buffered = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| RelayError::UpstreamUnreachable {
            reason: UnreachableReason::Io,
            detail: e.to_string(),
        })?;
        buffered.extend_from_slice(&chunk);
        if buffered.len() > limit {
            return Ok(Buffered::Overflow(buffered.freeze(), body));
        }
    }
    Ok(Buffered::Complete(buffered.freeze()))
}
