// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The protocol plug-in framework: each cache protocol is a factory with a
//! stable id that builds an instance from shared dependencies and registers
//! its HTTP routes and gRPC services against the transport mux.

#![deny(warnings)]

use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::MethodRouter;
use axum::Router;
use stats::CacheStats;
use storage::MultipartStore;
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tower::util::BoxCloneService;
use tower::Service;
use url_proxy::UrlProxy;

/// Timeout for presigned URL transfers and origin fetches.
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub type SharedStore = Arc<dyn MultipartStore + Send + Sync + 'static>;

/// Dependencies handed to every protocol factory.
#[derive(Clone)]
pub struct Deps {
    /// Blob/multipart backend.
    pub storage: SharedStore,

    /// Client for presigned URL transfers and origin fetches.
    pub http_client: reqwest::Client,

    /// Streams between clients and presigned endpoints.
    pub url_proxy: UrlProxy,

    /// Hit/miss and transfer counters.
    pub stats: Arc<CacheStats>,

    /// Reachable authority for URLs that protocols embed in responses,
    /// e.g. `localhost:12321`.
    pub host: String,
}

impl Deps {
    pub fn new(storage: SharedStore, host: impl Into<String>) -> Result<Self, RegistrationError> {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .pool_max_idle_per_host(4 * parallelism)
            .build()
            .map_err(|err| {
                RegistrationError::Other(format!("failed to build HTTP client: {err}"))
            })?;
        let stats = Arc::new(CacheStats::new());
        Ok(Self::with_client(storage, host, http_client, stats))
    }

    pub fn with_client(
        storage: SharedStore,
        host: impl Into<String>,
        http_client: reqwest::Client,
        stats: Arc<CacheStats>,
    ) -> Self {
        let url_proxy = UrlProxy::new(http_client.clone(), stats.clone());
        Deps {
            storage,
            http_client,
            url_proxy,
            stats,
            host: host.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistrationError {
    DuplicateId(String),
    DuplicateGrpcService(String),
    GrpcUnavailable(String),
    Other(String),
}

impl std::error::Error for RegistrationError {}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::DuplicateId(id) => {
                write!(f, "duplicate protocol id: {id}")
            }
            RegistrationError::DuplicateGrpcService(name) => {
                write!(f, "gRPC service registered twice: {name}")
            }
            RegistrationError::GrpcUnavailable(protocol) => {
                write!(f, "protocol {protocol} requires gRPC but none is available")
            }
            RegistrationError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// A boxed tower service as tonic generates them: one per gRPC service,
/// dispatched by the leading path segment of the request URI.
pub type GrpcService =
    BoxCloneService<http::Request<hyper::Body>, http::Response<BoxBody>, Infallible>;

/// Collects HTTP routes and gRPC services from protocols during startup.
pub struct Registrar {
    http: Option<Router>,
    grpc: Option<Vec<(&'static str, GrpcService)>>,
}

impl Registrar {
    /// `grpc_available` is false when the transport cannot serve gRPC (a
    /// protocol that needs it must then fail registration).
    pub fn new(grpc_available: bool) -> Self {
        Registrar {
            http: Some(Router::new()),
            grpc: grpc_available.then(Vec::new),
        }
    }

    /// Register a method-scoped HTTP route. Patterns use the axum syntax,
    /// including trailing wildcards such as `/cache/*key`.
    pub fn route(&mut self, path: &str, method_router: MethodRouter) {
        let router = self.http.take().expect("router present");
        self.http = Some(router.route(path, method_router));
    }

    pub fn grpc_available(&self) -> bool {
        self.grpc.is_some()
    }

    pub fn add_grpc_service<S>(&mut self, protocol_id: &str, service: S) -> Result<(), RegistrationError>
    where
        S: Service<http::Request<hyper::Body>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let services = self
            .grpc
            .as_mut()
            .ok_or_else(|| RegistrationError::GrpcUnavailable(protocol_id.to_owned()))?;
        if services.iter().any(|(name, _)| *name == S::NAME) {
            return Err(RegistrationError::DuplicateGrpcService(S::NAME.to_owned()));
        }
        services.push((S::NAME, BoxCloneService::new(service)));
        Ok(())
    }

    pub fn into_parts(self) -> (Router, Vec<(&'static str, GrpcService)>) {
        (
            self.http.expect("router present"),
            self.grpc.unwrap_or_default(),
        )
    }
}

/// Constructs protocol instances. The id is stable and used to detect
/// duplicate registrations.
pub trait ProtocolFactory: Send + Sync {
    fn id(&self) -> &'static str;

    fn create(&self, deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError>;
}

/// A live protocol instance. Registration consumes the instance: handlers
/// capture their state in the routes and services they add.
pub trait Protocol: Send {
    fn register(self: Box<Self>, registrar: &mut Registrar) -> Result<(), RegistrationError>;
}

/// Run every factory in input order against the registrar.
pub fn register_all(
    factories: &[Box<dyn ProtocolFactory>],
    deps: &Deps,
    registrar: &mut Registrar,
) -> Result<(), RegistrationError> {
    let mut seen_ids = HashSet::new();
    for factory in factories {
        if !seen_ids.insert(factory.id()) {
            return Err(RegistrationError::DuplicateId(factory.id().to_owned()));
        }
        let protocol = factory.create(deps)?;
        protocol.register(registrar)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use storage::testutil::MemoryStore;

    use super::{Deps, Protocol, ProtocolFactory, Registrar, RegistrationError};

    struct NoopProtocol;

    impl Protocol for NoopProtocol {
        fn register(self: Box<Self>, _registrar: &mut Registrar) -> Result<(), RegistrationError> {
            Ok(())
        }
    }

    struct NoopFactory {
        id: &'static str,
    }

    impl ProtocolFactory for NoopFactory {
        fn id(&self) -> &'static str {
            self.id
        }

        fn create(&self, _deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError> {
            Ok(Box::new(NoopProtocol))
        }
    }

    struct GrpcNeedingFactory;

    impl ProtocolFactory for GrpcNeedingFactory {
        fn id(&self) -> &'static str {
            "needs-grpc"
        }

        fn create(&self, _deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError> {
            Ok(Box::new(GrpcNeedingProtocol))
        }
    }

    struct GrpcNeedingProtocol;

    impl Protocol for GrpcNeedingProtocol {
        fn register(self: Box<Self>, registrar: &mut Registrar) -> Result<(), RegistrationError> {
            if !registrar.grpc_available() {
                return Err(RegistrationError::GrpcUnavailable("needs-grpc".to_owned()));
            }
            Ok(())
        }
    }

    fn deps() -> Deps {
        Deps::new(Arc::new(MemoryStore::new()), "localhost:12321").unwrap()
    }

    #[test]
    fn duplicate_factory_ids_are_rejected() {
        let factories: Vec<Box<dyn ProtocolFactory>> = vec![
            Box::new(NoopFactory { id: "http" }),
            Box::new(NoopFactory { id: "http" }),
        ];
        let mut registrar = Registrar::new(true);
        let err = super::register_all(&factories, &deps(), &mut registrar).unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateId("http".to_owned()));
    }

    #[test]
    fn grpc_protocol_fails_without_grpc() {
        let factories: Vec<Box<dyn ProtocolFactory>> = vec![Box::new(GrpcNeedingFactory)];

        let mut registrar = Registrar::new(false);
        let err = super::register_all(&factories, &deps(), &mut registrar).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::GrpcUnavailable("needs-grpc".to_owned())
        );

        let mut registrar = Registrar::new(true);
        super::register_all(&factories, &deps(), &mut registrar).unwrap();
    }
}
