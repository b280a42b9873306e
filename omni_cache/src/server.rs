// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use protocol::{register_all, Deps, GrpcService, ProtocolFactory, Registrar, SharedStore};
use tower::util::BoxCloneService;

use crate::hybrid::{hybrid_service, GrpcRouter};
use crate::listener::{cleanup_unix_socket, Listeners, DEFAULT_LISTEN_ADDR};
use crate::stats_endpoint;

/// How long in-flight requests get to finish after the shutdown signal.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerConfig {
    /// Preferred TCP listen address; an ephemeral port is used when taken.
    pub listen_addr: String,

    /// Stream-socket path, or `None` to serve TCP only.
    pub unix_socket_path: Option<PathBuf>,

    /// Authority baked into URLs handed to clients. Defaults to the bound
    /// TCP listener address.
    pub host: Option<String>,

    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
            unix_socket_path: None,
            host: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

type HybridService = tower::steer::Steer<
    crate::hybrid::HttpService,
    fn(&http::Request<hyper::Body>, &[crate::hybrid::HttpService]) -> usize,
    http::Request<hyper::Body>,
>;

/// A fully registered server, bound to its listeners but not yet serving.
pub struct Server {
    listeners: Listeners,
    hybrid: HybridService,
    unix_socket_path: Option<PathBuf>,
    shutdown_timeout: Duration,
    deps: Deps,
}

impl Server {
    /// Bind the listeners and run every protocol factory against the
    /// registrar, in input order.
    pub async fn bind(
        config: ServerConfig,
        storage: SharedStore,
        factories: Vec<Box<dyn ProtocolFactory>>,
    ) -> Result<Server, String> {
        let listeners = Listeners::bind(&config.listen_addr, config.unix_socket_path)
            .await
            .map_err(|err| format!("failed to bind listeners: {err}"))?;
        let unix_socket_path = listeners.unix_socket_path.clone();

        let host = config
            .host
            .unwrap_or_else(|| listeners.tcp_addr.to_string());
        let deps = Deps::new(storage, host).map_err(|err| err.to_string())?;

        let mut registrar = Registrar::new(true);
        register_all(&factories, &deps, &mut registrar)
            .map_err(|err| format!("protocol registration failed: {err}"))?;
        let (router, mut grpc_services) = registrar.into_parts();

        // Server-owned surfaces: the stats endpoint on the HTTP side and the
        // standard health service on the gRPC side.
        let router = router.merge(stats_endpoint::routes(deps.stats.clone()));

        let (_health_reporter, health_service) = tonic_health::server::health_reporter();
        let health_service: GrpcService = BoxCloneService::new(health_service);
        grpc_services.push(("grpc.health.v1.Health", health_service));

        let grpc_router = GrpcRouter::new(grpc_services);
        tracing::info!(
            grpc_services = ?grpc_router.service_names(),
            "protocols registered"
        );

        let hybrid = hybrid_service(router, grpc_router);

        Ok(Server {
            listeners,
            hybrid,
            unix_socket_path,
            shutdown_timeout: config.shutdown_timeout,
            deps,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listeners.tcp_addr
    }

    pub fn deps(&self) -> &Deps {
        &self.deps
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests within
    /// the shutdown timeout and clean up the unix socket file.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), String>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let accept = hyper::server::accept::from_stream(self.listeners.into_accept_stream());
        let server = hyper::Server::builder(accept)
            .serve(tower::make::Shared::new(self.hybrid));

        let (signal_tx, signal_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = signal_tx.send(true);
        });

        let mut graceful_rx = signal_rx.clone();
        let graceful = server.with_graceful_shutdown(async move {
            while !*graceful_rx.borrow() {
                if graceful_rx.changed().await.is_err() {
                    return;
                }
            }
            tracing::info!("shutdown signal received, draining in-flight requests");
        });

        let shutdown_timeout = self.shutdown_timeout;
        let mut deadline_rx = signal_rx;
        let drain_deadline = async move {
            loop {
                if *deadline_rx.borrow() {
                    break;
                }
                if deadline_rx.changed().await.is_err() {
                    futures::future::pending::<()>().await;
                }
            }
            tokio::time::sleep(shutdown_timeout).await;
        };

        let result = tokio::select! {
            result = graceful => result.map_err(|err| format!("server error: {err}")),
            _ = drain_deadline => {
                tracing::warn!(
                    timeout_secs = shutdown_timeout.as_secs(),
                    "shutdown deadline exceeded, aborting in-flight requests"
                );
                Ok(())
            }
        };

        cleanup_unix_socket(&self.unix_socket_path);
        result
    }
}
