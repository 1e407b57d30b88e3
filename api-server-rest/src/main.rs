// Copyright (c) 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use clap::Parser;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use key_broker::config::Config;
use key_broker::KeyBroker;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

mod config;
mod keys;
mod policies;
mod router;

use config::{load_config, DEFAULT_CONFIG_PATH};
use keys::{KeysHandler, KEYS_ROOT};
use policies::{PoliciesHandler, POLICIES_ROOT};
use router::Router;

type GenericError = Box<dyn std::error::Error + Send + Sync>;

/// Key broker API server arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path for API Server
    #[arg(default_value_t = DEFAULT_CONFIG_PATH.to_string(), short, long = "config")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let args = Args::parse();

    let config = load_config(&args.config)?;
    info!(
        "Starting key broker API server with config {} (bind {})",
        args.config, config.bind
    );

    let broker_config = match &config.key_broker_config {
        Some(path) => {
            info!("Using key broker config file: {path}");
            Config::try_from(path.as_str()).context("load key broker config")?
        }
        None => {
            warn!("No key broker config file specified. Using a default configuration.");
            Config::new()?
        }
    };
    let broker = Arc::new(
        KeyBroker::new(&broker_config)
            .await
            .context("start key broker")?,
    );

    let address: SocketAddr = config.bind.parse().context("parse bind address")?;

    let mut router = Router::new();
    router.register_route(KEYS_ROOT, Box::new(KeysHandler::new(broker.clone())));
    router.register_route(POLICIES_ROOT, Box::new(PoliciesHandler::new(broker)));
    let router = Arc::new(router);

    let api_service = make_service_fn(|conn: &AddrStream| {
        let remote_addr = conn.remote_addr();
        let local_router = router.clone();

        async move {
            Ok::<_, GenericError>(service_fn(move |req| {
                let local_router = local_router.clone();
                async move { local_router.route(remote_addr, req).await }
            }))
        }
    });

    let server = Server::bind(&address)
        .serve(api_service)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
            }
        });

    info!("Key broker API server listening on http://{}", config.bind);

    if let Err(e) = server.await {
        error!("API server error: {}", e);
    }

    Ok(())
}
