// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! HTTP client for the sidecar's cache endpoint. On unix-family systems the
//! helper dials the sidecar's stream socket; elsewhere it uses TCP against a
//! normalized base URL.

use std::path::PathBuf;

use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector};

/// Keys the helper writes into the sidecar's generic HTTP cache.
fn cache_key(action_hex: &str) -> String {
    format!("gocacheprog/{action_hex}")
}

enum Transport {
    Tcp {
        client: hyper::Client<HttpConnector>,
        base_url: String,
    },
    Unix {
        client: hyper::Client<UnixConnector>,
        socket_path: PathBuf,
    },
}

pub struct SidecarClient {
    transport: Transport,
}

impl SidecarClient {
    /// TCP transport against `host` (an authority such as `localhost:12321`
    /// or a full `http://` URL).
    pub fn tcp(host: &str) -> SidecarClient {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_owned()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };
        SidecarClient {
            transport: Transport::Tcp {
                client: hyper::Client::new(),
                base_url,
            },
        }
    }

    /// Unix-socket transport against the sidecar's stream socket.
    pub fn unix(socket_path: PathBuf) -> SidecarClient {
        SidecarClient {
            transport: Transport::Unix {
                client: hyper::Client::unix(),
                socket_path,
            },
        }
    }

    pub async fn upload(&self, action_hex: &str, body: Bytes) -> Result<(), String> {
        let key = cache_key(action_hex);
        let (client_request, response) = match &self.transport {
            Transport::Tcp { client, base_url } => {
                let uri = format!("{base_url}/{key}");
                let request = Request::builder()
                    .method(Method::PUT)
                    .uri(&uri)
                    .body(Body::from(body))
                    .map_err(|err| format!("build request: {err}"))?;
                (uri, client.request(request).await)
            }
            Transport::Unix {
                client,
                socket_path,
            } => {
                let uri: hyper::Uri = hyperlocal::Uri::new(socket_path, &format!("/{key}")).into();
                let request = Request::builder()
                    .method(Method::PUT)
                    .uri(uri.clone())
                    .body(Body::from(body))
                    .map_err(|err| format!("build request: {err}"))?;
                (uri.to_string(), client.request(request).await)
            }
        };

        let response = response.map_err(|err| format!("PUT {client_request}: {err}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "PUT {client_request}: sidecar returned {}",
                response.status()
            ));
        }
        Ok(())
    }
}
