// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use storage::StorageError;
use tonic::{Request, Response, Status};
use url_proxy::ProxyError;

use protos::compilation_cache_service::cas::v1::cas_bytes::Contents;
use protos::compilation_cache_service::cas::v1::cas_db_server::CasDb;
use protos::compilation_cache_service::cas::v1::{
    cas_get_response, cas_load_response, CasBytes, CasDataId, CasGetRequest, CasGetResponse,
    CasLoadRequest, CasLoadResponse, CasObject, CasPutRequest, CasPutResponse, CasSaveRequest,
    CasSaveResponse, ResponseError,
};

use super::object::{
    cas_storage_key, format_cas_id, object_digest, parse_cas_id, DIGEST_SIZE,
};
use super::LlvmState;

pub(super) struct LlvmCasService {
    pub(super) state: Arc<LlvmState>,
}

fn response_error(message: impl Into<String>) -> ResponseError {
    ResponseError {
        description: message.into(),
    }
}

impl LlvmCasService {
    async fn load_object(&self, digest: &[u8; DIGEST_SIZE]) -> Result<Option<CasObject>, String> {
        let key = cas_storage_key(digest);
        let deps = &self.state.deps;
        let urls = match deps.storage.download_urls(&key).await {
            Ok(urls) => urls,
            Err(StorageError::CacheNotFound) => return Ok(None),
            Err(err) => return Err(err.to_string()),
        };
        let payload = match deps.url_proxy.download_bytes(&urls).await {
            Ok(payload) => payload,
            Err(ProxyError::NotFound) => return Ok(None),
            Err(err) => return Err(err.to_string()),
        };
        let object =
            CasObject::decode(payload).map_err(|err| format!("stored object does not decode: {err}"))?;
        Ok(Some(object))
    }

    async fn store_object(
        &self,
        digest: &[u8; DIGEST_SIZE],
        object: &CasObject,
    ) -> Result<(), String> {
        let key = cas_storage_key(digest);
        let deps = &self.state.deps;
        let info = deps
            .storage
            .upload_url(&key, None)
            .await
            .map_err(|err| err.to_string())?;
        deps.url_proxy
            .upload_bytes(&info, Bytes::from(object.encode_to_vec()))
            .await
            .map_err(|err| err.to_string())?;
        Ok(())
    }

    /// Resolve a blob to its bytes, reading from the shared filesystem when
    /// the client passed a path.
    async fn blob_contents(&self, blob: Option<CasBytes>) -> Result<Bytes, Status> {
        let contents = blob
            .and_then(|b| b.contents)
            .ok_or_else(|| Status::invalid_argument("missing blob contents"))?;
        match contents {
            Contents::Data(data) => Ok(data),
            Contents::FilePath(path) => tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .map_err(|err| Status::invalid_argument(format!("read blob from {path}: {err}"))),
        }
    }

    /// Hand the blob back inline, or materialize it into a temp file when the
    /// client asked for a path.
    async fn deliver_blob(&self, data: Bytes, write_to_disk: bool) -> Result<CasBytes, Status> {
        if !write_to_disk {
            return Ok(CasBytes {
                contents: Some(Contents::Data(data)),
            });
        }

        let path = std::env::temp_dir().join(format!("omni-cache-llvm-{:016x}", rand::random::<u64>()));
        tokio::fs::write(&path, &data)
            .await
            .map_err(|err| Status::internal(format!("materialize blob: {err}")))?;
        Ok(CasBytes {
            contents: Some(Contents::FilePath(path.display().to_string())),
        })
    }

    fn parse_references(
        references: &[CasDataId],
    ) -> Result<Vec<[u8; DIGEST_SIZE]>, Status> {
        references
            .iter()
            .map(|reference| {
                parse_cas_id(&reference.id)
                    .map_err(|err| Status::invalid_argument(format!("reference: {err}")))
            })
            .collect()
    }

    async fn store(
        &self,
        refs: Vec<[u8; DIGEST_SIZE]>,
        data: Bytes,
    ) -> Result<CasDataId, String> {
        let digest = object_digest(&refs, &data);
        let object = CasObject {
            blob: Some(CasBytes {
                contents: Some(Contents::Data(data)),
            }),
            // References are normalized to the printable form in storage.
            references: refs
                .iter()
                .map(|reference| CasDataId {
                    id: format_cas_id(reference),
                })
                .collect(),
        };
        self.store_object(&digest, &object).await?;
        Ok(CasDataId {
            id: format_cas_id(&digest),
        })
    }
}

#[tonic::async_trait]
impl CasDb for LlvmCasService {
    #[tracing::instrument(skip_all)]
    async fn get(
        &self,
        request: Request<CasGetRequest>,
    ) -> Result<Response<CasGetResponse>, Status> {
        let request = request.into_inner();
        let id = request
            .cas_id
            .ok_or_else(|| Status::invalid_argument("missing CAS id"))?;
        let digest = parse_cas_id(&id.id).map_err(Status::invalid_argument)?;

        let object = match self.load_object(&digest).await {
            Ok(Some(object)) => object,
            Ok(None) => {
                self.state.deps.stats.record_miss();
                return Ok(Response::new(CasGetResponse {
                    outcome: cas_get_response::Outcome::ObjectNotFound as i32,
                    data: None,
                    error: None,
                }));
            }
            Err(err) => {
                return Ok(Response::new(CasGetResponse {
                    outcome: cas_get_response::Outcome::Error as i32,
                    data: None,
                    error: Some(response_error(err)),
                }))
            }
        };

        let blob = self.blob_contents(object.blob).await?;
        let delivered = self.deliver_blob(blob, request.write_to_disk).await?;

        self.state.deps.stats.record_hit();
        Ok(Response::new(CasGetResponse {
            outcome: cas_get_response::Outcome::Success as i32,
            data: Some(CasObject {
                blob: Some(delivered),
                references: object.references,
            }),
            error: None,
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn put(
        &self,
        request: Request<CasPutRequest>,
    ) -> Result<Response<CasPutResponse>, Status> {
        let request = request.into_inner();
        let object = request
            .data
            .ok_or_else(|| Status::invalid_argument("missing object"))?;
        let refs = Self::parse_references(&object.references)?;
        let data = self.blob_contents(object.blob).await?;

        match self.store(refs, data).await {
            Ok(cas_id) => Ok(Response::new(CasPutResponse {
                cas_id: Some(cas_id),
                error: None,
            })),
            Err(err) => Ok(Response::new(CasPutResponse {
                cas_id: None,
                error: Some(response_error(err)),
            })),
        }
    }

    #[tracing::instrument(skip_all)]
    async fn load(
        &self,
        request: Request<CasLoadRequest>,
    ) -> Result<Response<CasLoadResponse>, Status> {
        let request = request.into_inner();
        let id = request
            .cas_id
            .ok_or_else(|| Status::invalid_argument("missing CAS id"))?;
        let digest = parse_cas_id(&id.id).map_err(Status::invalid_argument)?;

        let object = match self.load_object(&digest).await {
            Ok(Some(object)) => object,
            Ok(None) => {
                self.state.deps.stats.record_miss();
                return Ok(Response::new(CasLoadResponse {
                    outcome: cas_load_response::Outcome::ObjectNotFound as i32,
                    data: None,
                    error: None,
                }));
            }
            Err(err) => {
                return Ok(Response::new(CasLoadResponse {
                    outcome: cas_load_response::Outcome::Error as i32,
                    data: None,
                    error: Some(response_error(err)),
                }))
            }
        };

        let blob = self.blob_contents(object.blob).await?;
        let delivered = self.deliver_blob(blob, request.write_to_disk).await?;

        self.state.deps.stats.record_hit();
        Ok(Response::new(CasLoadResponse {
            outcome: cas_load_response::Outcome::Success as i32,
            data: Some(delivered),
            error: None,
        }))
    }

    /// Save stores a leaf blob: no references.
    #[tracing::instrument(skip_all)]
    async fn save(
        &self,
        request: Request<CasSaveRequest>,
    ) -> Result<Response<CasSaveResponse>, Status> {
        let request = request.into_inner();
        let data = self.blob_contents(request.data).await?;

        match self.store(Vec::new(), data).await {
            Ok(cas_id) => Ok(Response::new(CasSaveResponse {
                cas_id: Some(cas_id),
                error: None,
            })),
            Err(err) => Ok(Response::new(CasSaveResponse {
                cas_id: None,
                error: Some(response_error(err)),
            })),
        }
    }
}
