// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use bytes::Bytes;
use digest::Digest;
use futures::future;
use tonic::{Request, Response, Status};

use protos::build::bazel::remote::execution::v2::{
    batch_read_blobs_response, batch_update_blobs_response, compressor,
    content_addressable_storage_server::ContentAddressableStorage, BatchReadBlobsRequest,
    BatchReadBlobsResponse, BatchUpdateBlobsRequest, BatchUpdateBlobsResponse,
    Digest as ApiDigest, FindMissingBlobsRequest, FindMissingBlobsResponse,
};

use super::{convert_digests, InnerServer};

pub(super) struct CasService {
    pub(super) inner: Arc<InnerServer>,
}

impl CasService {
    /// Reads a single blob and returns the response struct used by the
    /// `batch_read_blobs` RPC implementation.
    async fn read_blob(
        &self,
        instance: &str,
        api_digest: ApiDigest,
    ) -> batch_read_blobs_response::Response {
        fn make_response(
            digest: ApiDigest,
            code: protos::google::rpc::Code,
            message: impl Into<String>,
        ) -> batch_read_blobs_response::Response {
            batch_read_blobs_response::Response {
                digest: Some(digest),
                data: Bytes::default(),
                status: Some(protos::google::rpc::Status {
                    code: code as i32,
                    message: message.into(),
                    ..protos::google::rpc::Status::default()
                }),
                compressor: compressor::Value::Identity as i32,
            }
        }

        let digest: Digest = match api_digest.clone().try_into() {
            Ok(digest) => digest,
            Err(_) => {
                return make_response(
                    api_digest,
                    protos::google::rpc::Code::InvalidArgument,
                    "Invalid digest",
                );
            }
        };

        let data = match self.inner.read_blob(instance, &digest).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                return make_response(api_digest, protos::google::rpc::Code::NotFound, "");
            }
            Err(err) => {
                return make_response(api_digest, protos::google::rpc::Code::Internal, err);
            }
        };

        // A stored blob that no longer matches its digest is data loss, not a
        // normal miss.
        if data.len() as u64 != digest.size_bytes {
            return make_response(
                api_digest,
                protos::google::rpc::Code::DataLoss,
                format!(
                    "digest has wrong size (expected={}, actual={})",
                    digest.size_bytes,
                    data.len()
                ),
            );
        }

        batch_read_blobs_response::Response {
            digest: Some(api_digest),
            data,
            status: Some(protos::google::rpc::Status {
                code: protos::google::rpc::Code::Ok as i32,
                ..protos::google::rpc::Status::default()
            }),
            compressor: compressor::Value::Identity as i32,
        }
    }

    /// Write a single blob given its entire content (used by
    /// `batch_update_blobs`).
    async fn write_blob(
        &self,
        instance: &str,
        request: protos::build::bazel::remote::execution::v2::batch_update_blobs_request::Request,
    ) -> batch_update_blobs_response::Response {
        fn make_response(
            digest: Option<ApiDigest>,
            code: protos::google::rpc::Code,
            message: impl Into<String>,
        ) -> batch_update_blobs_response::Response {
            batch_update_blobs_response::Response {
                digest,
                status: Some(protos::google::rpc::Status {
                    code: code as i32,
                    message: message.into(),
                    ..protos::google::rpc::Status::default()
                }),
            }
        }

        if request.compressor != compressor::Value::Identity as i32 {
            return make_response(
                request.digest,
                protos::google::rpc::Code::InvalidArgument,
                "only IDENTITY compression is supported",
            );
        }

        let api_digest = match request.digest.clone() {
            Some(api_digest) => api_digest,
            None => {
                return make_response(
                    request.digest,
                    protos::google::rpc::Code::InvalidArgument,
                    "Missing digest",
                );
            }
        };

        let digest: Digest = match api_digest.try_into() {
            Ok(digest) => digest,
            Err(_) => {
                return make_response(
                    request.digest,
                    protos::google::rpc::Code::InvalidArgument,
                    "Invalid digest",
                );
            }
        };

        // The declared digest must actually describe the payload.
        let actual = Digest::of_bytes(&request.data);
        if actual != digest {
            return make_response(
                request.digest,
                protos::google::rpc::Code::InvalidArgument,
                format!(
                    "data does not match digest (declared={:?}, actual={:?})",
                    digest, actual
                ),
            );
        }

        match self.inner.write_blob(instance, &digest, request.data).await {
            Ok(()) => make_response(request.digest, protos::google::rpc::Code::Ok, ""),
            Err(err) => make_response(request.digest, protos::google::rpc::Code::Internal, err),
        }
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for CasService {
    #[tracing::instrument(skip_all)]
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        let request = request.into_inner();
        let instance = request.instance_name;
        let digests = convert_digests(request.blob_digests)?;

        let checks: Vec<_> = digests
            .iter()
            .map(|digest| async {
                match self.inner.blob_exists(&instance, digest).await {
                    Ok(false) => Ok(Some(*digest)),
                    Ok(true) => Ok(None),
                    Err(err) => Err(Status::internal(err.to_string())),
                }
            })
            .collect();

        let missing = future::join_all(checks)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .map(|digest| digest.into())
            .collect();

        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests: missing,
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        let request = request.into_inner();
        let instance = request.instance_name;

        let write_futures: Vec<_> = request
            .requests
            .into_iter()
            .map(|req| self.write_blob(&instance, req))
            .collect();

        let responses = future::join_all(write_futures).await;

        Ok(Response::new(BatchUpdateBlobsResponse { responses }))
    }

    #[tracing::instrument(skip_all)]
    async fn batch_read_blobs(
        &self,
        request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        let request = request.into_inner();
        let instance = request.instance_name;

        let read_futures: Vec<_> = request
            .digests
            .into_iter()
            .map(|digest| self.read_blob(&instance, digest))
            .collect();

        let responses = future::join_all(read_futures).await;

        Ok(Response::new(BatchReadBlobsResponse { responses }))
    }
}
