use std::sync::Arc;

use actix_web::http::header::{self, HeaderName, HeaderValue};
use actix_web::http::Method;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use uuid::Uuid;

use crate::common::encryption::Decryptor;
use crate::common::error::RelayError;
use crate::common::{self, DecryptedContext, InboundBody, LegacyMessage, SealedEnvelope, TunnelRequest};
use crate::relay::forwarder::{Forwarder, OutboundBody, OutboundRequest};
use crate::relay::headers::HeaderSet;
use crate::relay::response::{relay_response, Rewrite};
use crate::relay::routes::Upstream;
use crate::relay::RelayContext;

/// Entry point for every inbound request, whatever its method and path.
pub async fn handle(request: HttpRequest,
                    payload: web::Payload,
                    relay: web::Data<RelayContext>,
                    forwarder: web::Data<Forwarder>) -> Result<HttpResponse, RelayError> {
    let request_id = Uuid::new_v4().to_string();
    let result = dispatch(&request_id, &request, payload, &relay, &forwarder).await;
    if let Err(e) = &result {
        match e {
            RelayError::Decrypt(_) => warn!("[req:{}] Decryption failed", request_id),
            RelayError::MethodNotAllowed => debug!("[req:{}] {} {} not allowed", request_id, request.method(), request.path()),
            RelayError::PayloadTooLarge { .. } => error!("[req:{}] Payload too large, dropping connection", request_id),
            RelayError::UpstreamUnreachable { reason, detail } => {
                error!("[req:{}] Forwarding failed reason={}: {}", request_id, reason.as_str(), detail)
            }
            RelayError::Internal(detail) => error!("[req:{}] Internal Error: {}", request_id, detail),
        }
    }
    result
}

async fn dispatch(request_id: &str,
                  request: &HttpRequest,
                  payload: web::Payload,
                  relay: &RelayContext,
                  forwarder: &Forwarder) -> Result<HttpResponse, RelayError> {
    let is_post = request.method() == Method::POST;
    // In strict mode every POST is an envelope, whatever its path.
    let carries_envelope = is_post && (relay.strict || request.path() == "/");
    if !carries_envelope {
        if relay.strict {
            return Err(RelayError::MethodNotAllowed);
        }
        debug!("[req:{}] Direct passthrough {} {}", request_id, request.method(), request.path());
        let body = if has_body(request) { OutboundBody::Streaming(payload) } else { OutboundBody::Empty };
        return forward_direct(request, body, relay, forwarder).await;
    }

    check_declared_length(request, relay.max_body_size)?;
    let body = read_body(payload, relay.max_body_size).await?;

    match common::parse_envelope(body) {
        InboundBody::Passthrough(body) => forward_direct(request, OutboundBody::Full(body), relay, forwarder).await,
        InboundBody::Sealed(envelope) => {
            let plaintext = decrypt(relay.decryptor.clone(), envelope).await?;
            match common::classify(plaintext)? {
                DecryptedContext::FullTunnel(tunnel_request) => {
                    debug!("[req:{}] {}", request_id, tunnel_request);
                    forward_tunnel(tunnel_request, relay, forwarder).await
                }
                DecryptedContext::Legacy(message) => {
                    debug!("[req:{}] Forwarding legacy payload", request_id);
                    forward_legacy(request, message, relay, forwarder).await
                }
            }
        }
    }
}

fn has_body(request: &HttpRequest) -> bool {
    let headers = request.headers();
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    declared.map(|length| length > 0).unwrap_or(false) || headers.contains_key(header::TRANSFER_ENCODING)
}

fn check_declared_length(request: &HttpRequest, limit: usize) -> Result<(), RelayError> {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());
    match declared {
        Some(length) if length > limit => Err(RelayError::PayloadTooLarge { limit }),
        _ => Ok(()),
    }
}

async fn read_body(mut payload: web::Payload, limit: usize) -> Result<Bytes, RelayError> {
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(RelayError::internal)?;
        if body.len() + chunk.len() > limit {
            return Err(RelayError::PayloadTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

async fn decrypt(decryptor: Arc<dyn Decryptor>, envelope: SealedEnvelope) -> Result<serde_json::Value, RelayError> {
    let opened = web::block(move || decryptor.open(&envelope.payload))
        .await
        .map_err(RelayError::internal)?;
    Ok(opened?)
}

fn tunnel_rewrite<'a>(relay: &'a RelayContext, upstream: &'a Upstream) -> Rewrite<'a> {
    match &relay.rewriter {
        Some(rewriter) => Rewrite::Tunnel {
            rewriter,
            upstream_host: upstream.host(),
            buffer_limit: relay.max_rewrite_size,
        },
        None => Rewrite::None,
    }
}

/// Plain reverse proxying: the inbound request goes out as it came in.
async fn forward_direct(request: &HttpRequest,
                        body: OutboundBody,
                        relay: &RelayContext,
                        forwarder: &Forwarder) -> Result<HttpResponse, RelayError> {
    let path = request.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let upstream = relay.routes.resolve(request.path());
    let outbound = OutboundRequest {
        method: request.method().clone(),
        target: upstream.join(path)?,
        headers: relay.policy.outbound_headers(HeaderSet::from_request(request), upstream, true),
        body,
    };
    let response = forwarder.forward(outbound).await?;
    relay_response(response, tunnel_rewrite(relay, upstream)).await
}

async fn forward_tunnel(tunnel_request: TunnelRequest,
                        relay: &RelayContext,
                        forwarder: &Forwarder) -> Result<HttpResponse, RelayError> {
    let route_path = tunnel_request.path.split('?').next().unwrap_or("/");
    let upstream = relay.routes.resolve(route_path);
    let headers = HeaderSet::from_map(&tunnel_request.headers);
    let outbound = OutboundRequest {
        method: tunnel_request.method,
        target: upstream.join(&tunnel_request.path)?,
        headers: relay.policy.outbound_headers(headers, upstream, true),
        body: match tunnel_request.body {
            Some(body) => OutboundBody::Full(body),
            None => OutboundBody::Empty,
        },
    };
    let response = forwarder.forward(outbound).await?;
    relay_response(response, tunnel_rewrite(relay, upstream)).await
}

/// Webhook mode: `data` is POSTed to the default destination and the answer
/// goes back untouched.
async fn forward_legacy(request: &HttpRequest,
                        message: LegacyMessage,
                        relay: &RelayContext,
                        forwarder: &Forwarder) -> Result<HttpResponse, RelayError> {
    let (body, content_type) = message.body();
    let upstream = relay.routes.resolve("/");
    let headers = HeaderSet::from_request(request)
        .with_override(header::CONTENT_TYPE, HeaderValue::from_static(content_type))
        .with_override(HeaderName::from_static(common::HEADER_DECRYPTED), HeaderValue::from_static("true"));
    let outbound = OutboundRequest {
        method: Method::POST,
        target: upstream.uri().clone(),
        headers: relay.policy.outbound_headers(headers, upstream, false),
        body: OutboundBody::Full(body),
    };
    let response = forwarder.forward(outbound).await?;
    relay_response(response, Rewrite::None).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use actix_web::http::StatusCode;
    use actix_web::{test, App, HttpMessage, HttpServer};
    use serde_json::{json, Value};

    use super::*;
    use crate::common::encryption::{KeyPair, SealedBoxDecryptor, StaticKeys};
    use crate::common::error::DecryptError;
    use crate::relay::routes::{parse_routes, RouteTable};

    const PAGE: &str = r#"<html><head></head><body><a href="/x">x</a></body></html>"#;

    async fn echo(request: HttpRequest, body: web::Bytes) -> HttpResponse {
        let headers: HashMap<String, String> = request
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        HttpResponse::Ok().json(json!({
            "method": request.method().as_str(),
            "path": request.uri().to_string(),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
    }

    /// Starts a local service on an ephemeral port and returns its base URL.
    fn mock_upstream() -> String {
        let server = HttpServer::new(|| {
            App::new()
                .route("/dashboard", web::get().to(|| async {
                    HttpResponse::Found().insert_header((header::LOCATION, "/login")).finish()
                }))
                .route("/page", web::get().to(|| async {
                    HttpResponse::Ok().content_type("text/html").body(PAGE)
                }))
                .route("/legacy-html", web::post().to(|| async {
                    HttpResponse::Ok().content_type("text/html").body(PAGE)
                }))
                .default_service(web::to(echo))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_rt::spawn(server.run());
        format!("http://{}", addr)
    }

    fn context(routes: &str, default: &str, tunnel_id: Option<&str>, decryptor: Arc<dyn Decryptor>) -> RelayContext {
        let routes = RouteTable::new(parse_routes(routes).unwrap(), Upstream::parse(default).unwrap());
        RelayContext::new(routes, tunnel_id, decryptor, "relay.local").unwrap()
    }

    fn keyed(keys: &KeyPair) -> Arc<dyn Decryptor> {
        Arc::new(SealedBoxDecryptor::new(StaticKeys(keys.clone())))
    }

    fn envelope(keys: &KeyPair, message: Value) -> String {
        json!({"payload": keys.seal(message.to_string().as_bytes()).unwrap()}).to_string()
    }

    macro_rules! relay_service {
        ($context:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($context))
                    .app_data(web::Data::new(Forwarder::new(Duration::from_secs(5))))
                    .default_service(web::to(handle)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn tunnel_redirect_is_mounted() {
        let keys = KeyPair::generate();
        let upstream = mock_upstream();
        let app = relay_service!(context("", &upstream, Some("abc123"), keyed(&keys)));

        let body = envelope(&keys, json!({"method": "GET", "path": "/dashboard", "requestId": "r1", "headers": {}}));
        let response = test::call_service(&app, test::TestRequest::post().uri("/").set_payload(body).to_request()).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/h/abc123/login");
    }

    #[actix_web::test]
    async fn tunnel_html_is_mounted() {
        let keys = KeyPair::generate();
        let upstream = mock_upstream();
        let app = relay_service!(context(&format!("/={}", upstream), "http://unused.invalid", Some("abc123"), keyed(&keys)));

        let body = envelope(&keys, json!({"method": "GET", "path": "/page", "requestId": "r2", "headers": {}}));
        let response = test::call_service(&app, test::TestRequest::post().uri("/").set_payload(body).to_request()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = test::read_body(response).await;
        let body = std::str::from_utf8(&body).unwrap();
        assert!(body.contains(r#"<head><base href="/h/abc123/"></head>"#));
        assert!(body.contains(r#"href="/h/abc123/x""#));
    }

    #[actix_web::test]
    async fn tunnel_request_carries_method_headers_and_body() {
        let keys = KeyPair::generate();
        let upstream = mock_upstream();
        let app = relay_service!(context("", &upstream, Some("abc123"), keyed(&keys)));

        let body = envelope(&keys, json!({
            "method": "PUT",
            "path": "/items/1?force=true",
            "requestId": "r3",
            "headers": {"host": "public.example", "x-api-key": "k", "connection": "close"},
            "body": base64::encode("payload bytes"),
            "isBase64": true
        }));
        let response = test::call_service(&app, test::TestRequest::post().uri("/").set_payload(body).to_request()).await;
        let echoed: Value = test::read_body_json(response).await;

        assert_eq!(echoed["method"], "PUT");
        assert_eq!(echoed["path"], "/items/1?force=true");
        assert_eq!(echoed["body"], "payload bytes");
        assert_eq!(echoed["headers"]["x-api-key"], "k");
        assert_eq!(echoed["headers"]["x-forwarded-host"], "public.example");
        assert_eq!(echoed["headers"]["x-forwarded-proto"], "https");
        assert_eq!(echoed["headers"]["x-forwarded-for"], "127.0.0.1");
        assert_eq!(echoed["headers"]["x-forwarded-prefix"], "/h/abc123");
        assert_eq!(echoed["headers"]["accept-encoding"], "identity");
        assert_eq!(echoed["headers"]["host"], upstream.trim_start_matches("http://"));
    }

    #[actix_web::test]
    async fn legacy_data_is_posted_with_marker() {
        let keys = KeyPair::generate();
        let upstream = mock_upstream();
        let app = relay_service!(context("", &upstream, Some("abc123"), keyed(&keys)));

        let body = envelope(&keys, json!({"data": {"hello": "world"}}));
        let response = test::call_service(&app, test::TestRequest::post().uri("/").set_payload(body).to_request()).await;
        let echoed: Value = test::read_body_json(response).await;

        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["body"], r#"{"hello":"world"}"#);
        assert_eq!(echoed["headers"]["x-decrypted"], "true");
        assert_eq!(echoed["headers"]["content-type"], "application/json");
    }

    #[actix_web::test]
    async fn legacy_responses_are_never_rewritten() {
        let keys = KeyPair::generate();
        let upstream = mock_upstream();
        let app = relay_service!(context("", &format!("{}/legacy-html", upstream), Some("abc123"), keyed(&keys)));

        let body = envelope(&keys, json!({"data": "ping"}));
        let response = test::call_service(&app, test::TestRequest::post().uri("/").set_payload(body).to_request()).await;

        assert_eq!(test::read_body(response).await, Bytes::from_static(PAGE.as_bytes()));
    }

    #[actix_web::test]
    async fn wrong_key_is_a_bad_request() {
        let upstream = mock_upstream();
        let app = relay_service!(context("", &upstream, None, keyed(&KeyPair::generate())));

        let body = envelope(&KeyPair::generate(), json!({"data": "x"}));
        let response = test::call_service(&app, test::TestRequest::post().uri("/").set_payload(body).to_request()).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(test::read_body(response).await, "Decryption Failed");
    }

    struct CountingDecryptor(AtomicUsize);

    impl Decryptor for CountingDecryptor {
        fn open(&self, _ciphertext: &str) -> Result<Value, DecryptError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(DecryptError)
        }
    }

    #[actix_web::test]
    async fn oversized_body_is_rejected_before_decryption() {
        let counter = Arc::new(CountingDecryptor(AtomicUsize::new(0)));
        let relay = context("", "http://unused.invalid", None, counter.clone()).with_limits(64, 1024);
        let app = relay_service!(relay);

        let body = json!({"payload": "a".repeat(100)}).to_string();
        let response = test::call_service(&app, test::TestRequest::post().uri("/").set_payload(body).to_request()).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn oversized_body_without_length_is_cut_off_while_reading() {
        let counter = Arc::new(CountingDecryptor(AtomicUsize::new(0)));
        let relay = context("", "http://unused.invalid", None, counter.clone()).with_limits(64, 1024);
        let app = relay_service!(relay);

        let body = json!({"payload": "a".repeat(100)}).to_string();
        let mut request = test::TestRequest::post().uri("/").set_payload(body).to_request();
        request.head_mut().headers.remove(header::CONTENT_LENGTH);
        assert!(request.headers().get(header::CONTENT_LENGTH).is_none());
        let response = test::call_service(&app, request).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn unsealed_root_post_keeps_the_destination_path() {
        let upstream = mock_upstream();
        let app = relay_service!(context("", &format!("{}/webhook", upstream), None, keyed(&KeyPair::generate())));

        let request = test::TestRequest::post().uri("/").set_payload(r#"{"event":"push"}"#).to_request();
        let echoed: Value = test::read_body_json(test::call_service(&app, request).await).await;

        assert_eq!(echoed["path"], "/webhook");
        assert_eq!(echoed["body"], r#"{"event":"push"}"#);
    }

    #[actix_web::test]
    async fn unsealed_bodies_pass_through() {
        let upstream = mock_upstream();
        let app = relay_service!(context("", &upstream, None, keyed(&KeyPair::generate())));

        for raw in ["not json at all", r#"{"event":"push"}"#] {
            let response = test::call_service(&app, test::TestRequest::post().uri("/").set_payload(raw).to_request()).await;
            let echoed: Value = test::read_body_json(response).await;
            assert_eq!(echoed["body"], raw);
            assert_eq!(echoed["method"], "POST");
        }
    }

    #[actix_web::test]
    async fn other_requests_are_routed_directly() {
        let upstream = mock_upstream();
        let routes = format!("/api={}", upstream);
        let app = relay_service!(context(&routes, "http://unused.invalid", Some("abc123"), keyed(&KeyPair::generate())));

        let request = test::TestRequest::get()
            .uri("/api/thing?q=1")
            .insert_header((header::HOST, "public.example"))
            .to_request();
        let response = test::call_service(&app, request).await;
        let echoed: Value = test::read_body_json(response).await;

        assert_eq!(echoed["method"], "GET");
        assert_eq!(echoed["path"], "/api/thing?q=1");
        assert_eq!(echoed["headers"]["x-forwarded-host"], "public.example");
        assert_eq!(echoed["headers"]["x-forwarded-prefix"], "/h/abc123");
    }

    #[actix_web::test]
    async fn direct_bodies_are_streamed() {
        let upstream = mock_upstream();
        let app = relay_service!(context("", &upstream, None, keyed(&KeyPair::generate())));

        let request = test::TestRequest::put().uri("/items/7").set_payload("streamed body").to_request();
        let echoed: Value = test::read_body_json(test::call_service(&app, request).await).await;

        assert_eq!(echoed["method"], "PUT");
        assert_eq!(echoed["body"], "streamed body");
        assert!(echoed["headers"].get("x-forwarded-prefix").is_none());
    }

    #[actix_web::test]
    async fn strict_mode_rejects_other_methods() {
        let relay = context("", "http://unused.invalid", None, keyed(&KeyPair::generate())).strict(true);
        let app = relay_service!(relay);

        let response = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[actix_web::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let app = relay_service!(context("", "http://127.0.0.1:9", None, keyed(&KeyPair::generate())));

        let response = test::call_service(&app, test::TestRequest::get().uri("/anything").to_request()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(test::read_body(response).await, "Bad Gateway");
    }
}
