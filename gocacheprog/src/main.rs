// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};

use gocacheprog::cache::LocalCache;
use gocacheprog::client::SidecarClient;
use gocacheprog::session::Session;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("gocacheprog")
        .about("GOCACHEPROG helper backed by the omni-cache sidecar")
        .arg(
            Arg::new("cache-dir")
                .long("cache-dir")
                .value_name("DIR")
                .help("Directory for cached objects (defaults to a fresh session directory)"),
        )
        .arg(
            Arg::new("sidecar")
                .long("sidecar")
                .value_name("ADDR")
                .default_value("localhost:12321"),
        )
        .arg(
            Arg::new("sidecar-socket")
                .long("sidecar-socket")
                .value_name("PATH")
                .help("Sidecar stream socket (defaults to $HOME/.cirruslabs/omni-cache.sock)"),
        )
        .arg(Arg::new("no-socket").long("no-socket").action(ArgAction::SetTrue))
        .arg(
            Arg::new("strict")
                .long("strict")
                .action(ArgAction::SetTrue)
                .help("Fail put requests when the sidecar upload fails"),
        )
        .get_matches();

    server_util::setup_logging();

    let cache_dir = matches.get_one::<String>("cache-dir").map(PathBuf::from);
    let cache = LocalCache::open(cache_dir)?;
    tracing::info!(dir = %cache.dir().display(), "session cache directory");

    let sidecar = resolve_sidecar(&matches);
    let session = Session::new(cache, sidecar, matches.get_flag("strict"));

    session
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await?;
    Ok(())
}

/// Prefer the unix socket on unix-family systems; fall back to TCP.
#[cfg(unix)]
fn resolve_sidecar(matches: &clap::ArgMatches) -> SidecarClient {
    if !matches.get_flag("no-socket") {
        let socket_path = matches
            .get_one::<String>("sidecar-socket")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .map(|home| PathBuf::from(home).join(".cirruslabs/omni-cache.sock"))
            });
        if let Some(socket_path) = socket_path {
            if socket_path.exists() {
                return SidecarClient::unix(socket_path);
            }
        }
    }
    SidecarClient::tcp(matches.get_one::<String>("sidecar").unwrap())
}

#[cfg(not(unix))]
fn resolve_sidecar(matches: &clap::ArgMatches) -> SidecarClient {
    SidecarClient::tcp(matches.get_one::<String>("sidecar").unwrap())
}
