// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The request loop: capabilities first, then one response per request until
//! `close` or the parent hangs up. Requests arrive in order on stdin, so the
//! handler is single-threaded.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::cache::LocalCache;
use crate::client::SidecarClient;
use crate::wire::{self, Request, Response};

pub struct Session {
    pub cache: LocalCache,
    pub sidecar: SidecarClient,
    /// When set, a failed sidecar upload fails the whole `put` request; the
    /// default keeps the local entry and logs the failure.
    pub strict: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Session {
    pub fn new(cache: LocalCache, sidecar: SidecarClient, strict: bool) -> Session {
        Session {
            cache,
            sidecar,
            strict,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<(), String>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);

        wire::write_response(&mut writer, &Response::capabilities()).await?;

        loop {
            let request = match wire::read_request(&mut reader).await? {
                Some(request) => request,
                // Parent hung up; treat like close.
                None => break,
            };

            let response = match request.command.as_str() {
                "get" => self.handle_get(&request),
                "put" => {
                    let body = if request.body_size > 0 {
                        wire::read_body(&mut reader, request.body_size).await?
                    } else {
                        bytes::Bytes::new()
                    };
                    self.handle_put(&request, body).await
                }
                "close" => {
                    wire::write_response(&mut writer, &Response {
                        id: request.id,
                        ..Response::default()
                    })
                    .await?;
                    break;
                }
                other => Response::error(request.id, format!("unknown command {other:?}")),
            };

            wire::write_response(&mut writer, &response).await?;
        }

        self.cache.remove_incomplete_files().await;
        tracing::info!(
            hits = self.hits.load(Ordering::Relaxed),
            misses = self.misses.load(Ordering::Relaxed),
            entries = self.cache.len(),
            "session finished"
        );
        Ok(())
    }

    fn handle_get(&self, request: &Request) -> Response {
        let action = match wire::decode_id("ActionID", request.action_id.as_ref()) {
            Ok(action) => action,
            Err(err) => return Response::error(request.id, err),
        };
        let action_hex = hex::encode(action);

        match self.cache.get(&action_hex) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Response {
                    id: request.id,
                    output_id: Some(base64::encode(&entry.output_id)),
                    size: Some(entry.size as i64),
                    time: Some(entry.put_time),
                    disk_path: Some(entry.disk_path.display().to_string()),
                    ..Response::default()
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Response {
                    id: request.id,
                    miss: Some(true),
                    ..Response::default()
                }
            }
        }
    }

    async fn handle_put(&self, request: &Request, body: bytes::Bytes) -> Response {
        let action = match wire::decode_id("ActionID", request.action_id.as_ref()) {
            Ok(action) => action,
            Err(err) => return Response::error(request.id, err),
        };
        let output_id = match wire::decode_id("OutputID", request.output_id.as_ref()) {
            Ok(output_id) => output_id,
            Err(err) => return Response::error(request.id, err),
        };
        let action_hex = hex::encode(action);

        let entry = match self.cache.put(&action_hex, output_id, body.clone()).await {
            Ok(entry) => entry,
            Err(err) => {
                return Response::error(request.id, format!("local cache write failed: {err}"))
            }
        };

        if let Err(err) = self.sidecar.upload(&action_hex, body).await {
            if self.strict {
                return Response::error(request.id, format!("sidecar upload failed: {err}"));
            }
            // The local entry still serves this session.
            tracing::warn!(action = action_hex, error = %err, "sidecar upload failed");
        }

        Response {
            id: request.id,
            disk_path: Some(entry.disk_path.display().to_string()),
            ..Response::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::put;
    use axum::Router;
    use serde_json::Value;
    use tokio::io::AsyncWriteExt;

    use crate::cache::LocalCache;
    use crate::client::SidecarClient;

    use super::Session;

    async fn spawn_sidecar(status: axum::http::StatusCode) -> std::net::SocketAddr {
        let router = Router::new().route("/*key", put(move || async move { status }));
        let server =
            axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(router.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    async fn run_session(strict: bool, sidecar_status: axum::http::StatusCode, input: String) -> Vec<Value> {
        let sidecar = spawn_sidecar(sidecar_status).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(Some(dir.path().to_path_buf())).unwrap();
        let session = Session::new(cache, SidecarClient::tcp(&sidecar.to_string()), strict);

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut output = Vec::new();
        session.run(server, &mut output).await.unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn put_get_close_script(action: &[u8], output: &[u8], body: &[u8]) -> String {
        format!(
            "{}\n{}\n{}\n{}\n",
            serde_json::json!({
                "ID": 1,
                "Command": "put",
                "ActionID": base64::encode(action),
                "OutputID": base64::encode(output),
                "BodySize": body.len(),
            }),
            serde_json::to_string(&base64::encode(body)).unwrap(),
            serde_json::json!({
                "ID": 2,
                "Command": "get",
                "ActionID": base64::encode(action),
            }),
            serde_json::json!({"ID": 3, "Command": "close"}),
        )
    }

    #[tokio::test]
    async fn put_then_get_hits_with_matching_metadata() {
        let responses = run_session(
            false,
            axum::http::StatusCode::CREATED,
            put_get_close_script(b"action-1", b"output-1", b"the body"),
        )
        .await;

        // capabilities, put, get, close
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0]["ID"], 0);
        assert_eq!(
            responses[0]["KnownCommands"],
            serde_json::json!(["get", "put", "close"])
        );

        assert_eq!(responses[1]["ID"], 1);
        assert!(responses[1].get("Err").is_none());
        let disk_path = responses[1]["DiskPath"].as_str().unwrap();

        assert_eq!(responses[2]["ID"], 2);
        assert_eq!(responses[2]["OutputID"], base64::encode(b"output-1"));
        assert_eq!(responses[2]["Size"], 8);
        assert_eq!(responses[2]["DiskPath"], disk_path);
        assert!(responses[2].get("Miss").is_none());

        let contents = std::fs::read(disk_path).unwrap();
        assert_eq!(contents, b"the body");

        assert_eq!(responses[3]["ID"], 3);
    }

    #[tokio::test]
    async fn get_without_put_is_a_miss() {
        let script = format!(
            "{}\n{}\n",
            serde_json::json!({
                "ID": 1,
                "Command": "get",
                "ActionID": base64::encode(b"unknown"),
            }),
            serde_json::json!({"ID": 2, "Command": "close"}),
        );
        let responses = run_session(false, axum::http::StatusCode::CREATED, script).await;
        assert_eq!(responses[1]["Miss"], true);
    }

    #[tokio::test]
    async fn strict_mode_fails_put_on_sidecar_error() {
        let responses = run_session(
            true,
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            put_get_close_script(b"action-1", b"output-1", b"the body"),
        )
        .await;
        assert!(responses[1]["Err"]
            .as_str()
            .unwrap()
            .contains("sidecar upload failed"));
    }

    #[tokio::test]
    async fn non_strict_mode_keeps_the_local_entry_on_sidecar_error() {
        let responses = run_session(
            false,
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            put_get_close_script(b"action-1", b"output-1", b"the body"),
        )
        .await;
        assert!(responses[1].get("Err").is_none());
        // the following get still hits locally
        assert_eq!(responses[2]["Size"], 8);
    }
}
