// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Request classification for the shared listeners: HTTP/2 requests whose
//! content type starts with `application/grpc` go to the gRPC router, all
//! other requests to the HTTP mux. Plaintext HTTP/2 works because hyper
//! detects the h2 preface on every connection, so gRPC clients connect
//! without TLS.

use std::convert::Infallible;
use std::task::{Context, Poll};

use axum::body::boxed;
use http::header::CONTENT_TYPE;
use http::{Request, Response, Version};
use hyper::Body;
use protocol::GrpcService;
use tower::steer::Steer;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

pub type HttpService = BoxCloneService<Request<Body>, Response<axum::body::BoxBody>, Infallible>;

pub fn is_grpc_request<B>(request: &Request<B>) -> bool {
    request.version() == Version::HTTP_2
        && request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/grpc"))
            .unwrap_or(false)
}

/// Routes gRPC requests to the registered service whose name matches the
/// first path segment (`/package.Service/Method`). Unknown services get a
/// trailers-only UNIMPLEMENTED response, as a gRPC server would produce.
#[derive(Clone)]
pub struct GrpcRouter {
    services: Vec<(&'static str, GrpcService)>,
}

impl GrpcRouter {
    pub fn new(services: Vec<(&'static str, GrpcService)>) -> Self {
        GrpcRouter { services }
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|(name, _)| *name).collect()
    }
}

fn unimplemented_response() -> Response<tonic::body::BoxBody> {
    Response::builder()
        .header(CONTENT_TYPE, "application/grpc")
        .header("grpc-status", (tonic::Code::Unimplemented as i32).to_string())
        .header("grpc-message", "unknown service")
        .body(tonic::body::empty_body())
        .unwrap()
}

impl Service<Request<Body>> for GrpcRouter {
    type Response = Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let service_name = request
            .uri()
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
            .to_owned();

        let service = self
            .services
            .iter()
            .find(|(name, _)| *name == service_name)
            .map(|(_, service)| service.clone());

        Box::pin(async move {
            match service {
                Some(service) => service.oneshot(request).await,
                None => Ok(unimplemented_response()),
            }
        })
    }
}

/// One service for the whole listener: picks the gRPC router or the HTTP mux
/// per request.
pub fn hybrid_service(
    http: axum::Router,
    grpc: GrpcRouter,
) -> Steer<HttpService, fn(&Request<Body>, &[HttpService]) -> usize, Request<Body>> {
    let http: HttpService = BoxCloneService::new(http);
    let grpc: HttpService =
        BoxCloneService::new(grpc.map_response(|response| response.map(boxed)));

    fn pick(request: &Request<Body>, _services: &[HttpService]) -> usize {
        if is_grpc_request(request) {
            1
        } else {
            0
        }
    }

    Steer::new(vec![http, grpc], pick as fn(&Request<Body>, &[HttpService]) -> usize)
}
