use std::sync::Arc;

use actix_web::http::header::HeaderValue;

use crate::common::encryption::Decryptor;
use crate::common::error::ConfigError;
use crate::relay::forwarder::ForwardingPolicy;
use crate::relay::rewriter::ResponseRewriter;
use crate::relay::routes::RouteTable;

pub mod options;
pub mod handler_relay;
pub mod forwarder;
pub mod headers;
pub mod response;
pub mod rewriter;
pub mod routes;

/// Process-wide, read-only state shared by every worker.
pub struct RelayContext {
    pub routes: RouteTable,
    pub rewriter: Option<ResponseRewriter>,
    pub policy: ForwardingPolicy,
    pub decryptor: Arc<dyn Decryptor>,
    pub max_body_size: usize,
    pub max_rewrite_size: usize,
    pub strict: bool,
}

impl RelayContext {

    pub fn new(
        routes: RouteTable,
        tunnel_id: Option<&str>,
        decryptor: Arc<dyn Decryptor>,
        forwarded_host: &str,
    ) -> Result<Self, ConfigError> {
        let rewriter = tunnel_id.map(ResponseRewriter::new).transpose()?;
        let prefix = rewriter
            .as_ref()
            .and_then(|r| HeaderValue::from_str(r.prefix()).ok());
        let default_forwarded_host = HeaderValue::from_str(forwarded_host)
            .unwrap_or_else(|_| HeaderValue::from_static("localhost"));
        Ok(Self {
            routes,
            rewriter,
            policy: ForwardingPolicy { default_forwarded_host, prefix },
            decryptor,
            max_body_size: 1024 * 1024,
            max_rewrite_size: 10 * 1024 * 1024,
            strict: false,
        })
    }

    pub fn with_limits(mut self, max_body_size: usize, max_rewrite_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self.max_rewrite_size = max_rewrite_size;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}
