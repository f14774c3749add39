use std::time::Duration;

use clap::Parser;

use crate::common::error::ConfigError;
use crate::relay::routes::{parse_routes, RouteTable, Upstream};

/// Exit-side relay for encrypted tunnels: opens sealed envelopes and forwards them to local services.
#[derive(Clone, Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct RelayOptions {
    /// A bind address. The default value is 0.0.0.0
    #[clap(short, long, env = "DECRYPTER_BIND", default_value = "0.0.0.0")]
    pub bind_addr: String,
    /// The port number the relay listens on. The default value is 8081
    #[clap(short, long, env = "DECRYPTER_PORT", default_value = "8081")]
    pub port: u16,
    /// Where requests go when no route prefix matches
    #[clap(short, long, env = "FORWARD_DEST", default_value = "http://host.docker.internal:8080")]
    pub forward_dest: String,
    /// Comma separated `prefix=url` pairs, e.g. `/api=http://localhost:3001,/=http://localhost:3000`
    #[clap(short, long, env = "ROUTES", default_value = "")]
    pub routes: String,
    /// Mounts full-tunnel responses under /h/<tunnel-id>/. Empty disables rewriting
    #[clap(short, long, env = "TUNNEL_ID", default_value = "")]
    pub tunnel_id: String,
    /// PEM encoded X25519 private key written at registration
    #[clap(long, env = "PRIV_KEY_PATH", default_value = "/registration/priv.key")]
    pub private_key: String,
    /// Base64 encoded X25519 public key written at registration
    #[clap(long, env = "PUB_KEY_PATH", default_value = "/registration/pub.key")]
    pub public_key: String,
    /// silent, error, warn, info or debug
    #[clap(short, long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    /// Largest inbound body read for decryption, in bytes
    #[clap(long, env = "MAX_BODY_SIZE", default_value = "1048576")]
    pub max_body_size: usize,
    /// Largest HTML body buffered for rewriting, in bytes
    #[clap(long, env = "MAX_REWRITE_SIZE", default_value = "10485760")]
    pub max_rewrite_size: usize,
    /// Upstream request timeout in seconds
    #[clap(long, env = "UPSTREAM_TIMEOUT", default_value = "30")]
    pub upstream_timeout: u64,
    /// Sent as x-forwarded-host when the request carries no Host header
    #[clap(long, env = "FORWARDED_HOST", default_value = "localhost")]
    pub forwarded_host: String,
    /// Only accept POST /; everything else gets 405 instead of being forwarded directly
    #[clap(long, env = "DECRYPTER_STRICT")]
    pub strict: bool,
}

pub fn parse_options() -> RelayOptions {
    Parser::parse()
}

impl RelayOptions {

    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        Ok(RouteTable::new(parse_routes(&self.routes)?, Upstream::parse(&self.forward_dest)?))
    }

    pub fn tunnel_id(&self) -> Result<Option<String>, ConfigError> {
        let tunnel_id = self.tunnel_id.trim();
        if tunnel_id.is_empty() {
            return Ok(None);
        }
        if !tunnel_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ConfigError::InvalidTunnelId(tunnel_id.to_string()));
        }
        Ok(Some(tunnel_id.to_string()))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    /// The env_logger filter for `LOG_LEVEL`.
    pub fn log_filter(&self) -> Result<String, ConfigError> {
        let level = match self.log_level.trim().to_ascii_lowercase().as_str() {
            "silent" | "off" => return Ok("off".to_string()),
            level @ ("error" | "warn" | "info" | "debug" | "trace") => level.to_string(),
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        };
        Ok(format!("actix_server=info,actix_web=info,mole_relay={}", level))
    }
}
