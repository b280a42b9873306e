// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::path::PathBuf;
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use clap::{Arg, ArgAction, Command};
use storage::S3Store;

use omni_cache::listener::DEFAULT_LISTEN_ADDR;
use omni_cache::server::{Server, ServerConfig, DEFAULT_SHUTDOWN_TIMEOUT};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("omni-cache")
        .about("Cache sidecar fronting an S3-compatible object store")
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .default_value(DEFAULT_LISTEN_ADDR),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("AUTHORITY")
                .help("Authority to embed in URLs handed to clients (defaults to the listen address)"),
        )
        .arg(
            Arg::new("unix-socket")
                .long("unix-socket")
                .value_name("PATH")
                .help("Stream socket path (defaults to $HOME/.cirruslabs/omni-cache.sock)"),
        )
        .arg(
            Arg::new("no-unix-socket")
                .long("no-unix-socket")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("s3-bucket")
                .long("s3-bucket")
                .required(true)
                .value_name("BUCKET"),
        )
        .arg(
            Arg::new("s3-prefix")
                .long("s3-prefix")
                .value_name("PREFIX")
                .default_value(""),
        )
        .arg(
            Arg::new("s3-endpoint")
                .long("s3-endpoint")
                .value_name("URL")
                .help("Custom S3 endpoint (MinIO and friends); implies path-style addressing"),
        )
        .arg(Arg::new("s3-region").long("s3-region").value_name("REGION"))
        .get_matches();

    server_util::setup_logging();

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = matches.get_one::<String>("s3-region") {
        loader = loader.region(Region::new(region.clone()));
    }
    let s3_endpoint = matches.get_one::<String>("s3-endpoint");
    if let Some(endpoint) = s3_endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    let sdk_config = loader.load().await;

    let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
    if s3_endpoint.is_some() {
        s3_config = s3_config.force_path_style(true);
    }
    let client = aws_sdk_s3::Client::from_conf(s3_config.build());

    let bucket = matches.get_one::<String>("s3-bucket").unwrap();
    let prefix = matches.get_one::<String>("s3-prefix").unwrap();
    let storage = Arc::new(S3Store::new(client, bucket, prefix));

    let unix_socket_path = resolve_unix_socket_path(&matches);

    let config = ServerConfig {
        listen_addr: matches.get_one::<String>("listen").unwrap().clone(),
        unix_socket_path,
        host: matches.get_one::<String>("host").cloned(),
        shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
    };

    let server = Server::bind(config, storage, protocols::all_factories()).await?;
    tracing::info!(addr = %server.local_addr(), "serving omni-cache");

    server.serve(shutdown_signal()).await?;
    tracing::info!("shut down cleanly");
    Ok(())
}

#[cfg(unix)]
fn resolve_unix_socket_path(matches: &clap::ArgMatches) -> Option<PathBuf> {
    if matches.get_flag("no-unix-socket") {
        return None;
    }
    matches
        .get_one::<String>("unix-socket")
        .map(PathBuf::from)
        .or_else(omni_cache::listener::default_unix_socket_path)
}

#[cfg(not(unix))]
fn resolve_unix_socket_path(_matches: &clap::ArgMatches) -> Option<PathBuf> {
    None
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to attach SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("received shutdown signal, starting graceful shutdown");
}
