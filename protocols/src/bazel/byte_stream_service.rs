// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use digest::Digest;
use futures::{Stream, StreamExt};
use sha2::{Digest as Sha2Digest, Sha256};
use tonic::{Request, Response, Status, Streaming};

use protos::google::bytestream::byte_stream_server::ByteStream;
use protos::google::bytestream::{
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};

use super::resource_name::{
    parse_read_resource_name, parse_write_resource_name, ResourceNameError,
};
use super::InnerServer;

const READ_CHUNK_SIZE: usize = 64 * 1024;

pub(super) struct ByteStreamService {
    pub(super) inner: Arc<InnerServer>,
}

fn resource_status(err: ResourceNameError) -> Status {
    match err {
        ResourceNameError::Unsupported(msg) => Status::unimplemented(msg),
        ResourceNameError::Malformed(msg) => Status::invalid_argument(msg),
    }
}

#[tonic::async_trait]
impl ByteStream for ByteStreamService {
    type ReadStream = Pin<Box<dyn Stream<Item = Result<ReadResponse, Status>> + Send + 'static>>;

    #[tracing::instrument(skip_all)]
    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let request = request.into_inner();

        let parsed = parse_read_resource_name(&request.resource_name).map_err(resource_status)?;
        let digest =
            Digest::new(parsed.hash, parsed.size).map_err(Status::invalid_argument)?;

        let read_offset = match request.read_offset {
            x if x < 0 => return Err(Status::out_of_range("negative read_offset")),
            x if x as u64 > digest.size_bytes => {
                return Err(Status::out_of_range(format!(
                    "read_offset exceeds size of resource: {request:?}"
                )))
            }
            x => x as usize,
        };

        let read_limit = match request.read_limit {
            x if x < 0 => return Err(Status::out_of_range("negative read_limit")),
            0 => None,
            x => Some(x as usize),
        };

        // The blob is fetched whole once; offset and limit carve a window out
        // of it.
        let data = match self.inner.read_blob(parsed.instance_name, &digest).await {
            Ok(Some(data)) => data,
            Ok(None) => return Err(Status::not_found("")),
            Err(err) => return Err(Status::internal(err)),
        };

        let window_start = read_offset.min(data.len());
        let window_end = match read_limit {
            Some(limit) => (window_start + limit).min(data.len()),
            None => data.len(),
        };
        let window = data.slice(window_start..window_end);

        let stream = async_stream::stream! {
            let mut offset = 0;
            while offset < window.len() {
                let end = (offset + READ_CHUNK_SIZE).min(window.len());
                yield Ok(ReadResponse { data: window.slice(offset..end) });
                offset = end;
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }

    #[tracing::instrument(skip_all)]
    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let mut stream = request.into_inner();

        // The first message must carry the resource name to write to.
        let first_msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => return Err(err),
            None => return Err(Status::cancelled("client disconnected")),
        };

        let resource_name = first_msg.resource_name.clone();
        let parsed = parse_write_resource_name(&resource_name).map_err(resource_status)?;
        let digest =
            Digest::new(parsed.hash, parsed.size).map_err(Status::invalid_argument)?;
        let instance = parsed.instance_name.to_owned();

        let mut content = BytesMut::with_capacity(digest.size_bytes.min(4 * 1024 * 1024) as usize);
        let mut hasher = Sha256::default();
        let mut committed_size: i64 = 0;
        let mut finished = false;

        let mut next_msg = Some(first_msg);
        while let Some(msg) = next_msg {
            // Later messages may omit the resource name but must not change it.
            if !msg.resource_name.is_empty() && msg.resource_name != resource_name {
                return Err(Status::invalid_argument(
                    "resource_name changed mid-stream",
                ));
            }

            // Strictly sequential writes; there is no resumption within a
            // stream.
            if msg.write_offset != committed_size {
                return Err(Status::invalid_argument(format!(
                    "write_offset {} does not match bytes written so far {committed_size}",
                    msg.write_offset
                )));
            }

            if !msg.data.is_empty() {
                hasher.update(&msg.data);
                content.extend_from_slice(&msg.data);
                committed_size += msg.data.len() as i64;
            }

            if msg.finish_write {
                finished = true;
                break;
            }

            next_msg = match stream.next().await {
                Some(Ok(msg)) => Some(msg),
                Some(Err(status)) => {
                    return Err(Status::cancelled(format!("client stream error: {status}")))
                }
                None => None,
            };
        }

        if !finished {
            return Err(Status::cancelled(
                "write stream closed without specifying finish_write",
            ));
        }

        if committed_size as u64 != digest.size_bytes {
            return Err(Status::invalid_argument(format!(
                "committed size {committed_size} does not match digest size {}",
                digest.size_bytes
            )));
        }

        let actual = Digest::from_slice(hasher.finalize().as_slice(), committed_size as u64)
            .map_err(Status::internal)?;
        if actual != digest {
            return Err(Status::invalid_argument(format!(
                "content hash does not match resource digest (declared={digest:?}, actual={actual:?})"
            )));
        }

        self.inner
            .write_blob(&instance, &digest, content.freeze())
            .await
            .map_err(Status::internal)?;

        Ok(Response::new(WriteResponse { committed_size }))
    }

    /// Resumable uploads are not supported, so this is purely an existence
    /// probe.
    #[tracing::instrument(skip_all)]
    async fn query_write_status(
        &self,
        request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        let request = request.into_inner();
        let parsed = parse_write_resource_name(&request.resource_name).map_err(resource_status)?;
        let digest =
            Digest::new(parsed.hash, parsed.size).map_err(Status::invalid_argument)?;

        let exists = self
            .inner
            .blob_exists(parsed.instance_name, &digest)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        let response = if exists {
            QueryWriteStatusResponse {
                committed_size: digest.size_bytes as i64,
                complete: true,
            }
        } else {
            QueryWriteStatusResponse {
                committed_size: 0,
                complete: false,
            }
        };
        Ok(Response::new(response))
    }
}
