#[macro_use]
extern crate log;

use std::io;
use std::sync::Arc;

use actix_web::{App, HttpServer, middleware, web};

use crate::common::encryption::{FileKeys, KeyProvider, SealedBoxDecryptor};
use crate::relay::forwarder::Forwarder;
use crate::relay::{handler_relay, options, RelayContext};

mod relay;
mod common;


#[actix_web::main]
async fn main() -> io::Result<()> {
    let options: options::RelayOptions = options::parse_options();

    let log_filter = options.log_filter().map_err(config_failure)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_filter)).init();

    common::print_banner("Relay");

    let routes = options.route_table().map_err(config_failure)?;
    for entry in routes.entries() {
        info!("Route {} -> {}", entry.prefix, entry.upstream.uri());
    }
    info!("Default destination {}", routes.resolve("/").uri());

    let tunnel_id = options.tunnel_id().map_err(config_failure)?;
    match &tunnel_id {
        Some(id) => info!("Full-tunnel responses are mounted under /h/{}/", id),
        None => info!("No tunnel id, responses are relayed unmodified"),
    }

    let keys = FileKeys::new(&options.private_key, &options.public_key);
    match keys.key_pair() {
        Some(pair) => info!("Relay public key {}", pair.encoded_public_key()),
        None => warn!("Decryption will fail until the registration keys are written"),
    }
    let decryptor = Arc::new(SealedBoxDecryptor::new(keys));

    let context = RelayContext::new(routes, tunnel_id.as_deref(), decryptor, &options.forwarded_host)
        .map_err(config_failure)?
        .with_limits(options.max_body_size, options.max_rewrite_size)
        .strict(options.strict);
    let context = web::Data::new(context);
    let timeout = options.upstream_timeout();

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(context.clone())
            // awc clients are per worker
            .app_data(web::Data::new(Forwarder::new(timeout)))
            .default_service(web::to(handler_relay::handle))
    })
        .bind(format!("{}:{}", options.bind_addr, options.port))?
        .run()
        .await
}

fn config_failure(e: common::error::ConfigError) -> io::Error {
    eprintln!("Invalid configuration: {}", e);
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}
