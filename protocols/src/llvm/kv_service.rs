// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use storage::StorageError;
use tonic::{Request, Response, Status};
use url_proxy::ProxyError;

use protos::compilation_cache_service::keyvalue::v1::key_value_db_server::KeyValueDb;
use protos::compilation_cache_service::keyvalue::v1::{
    get_value_response, put_value_response, GetValueRequest, GetValueResponse, PutValueRequest,
    PutValueResponse, ResponseError, Value,
};

use super::object::kv_storage_key;
use super::LlvmState;

pub(super) struct LlvmKvService {
    pub(super) state: Arc<LlvmState>,
}

#[tonic::async_trait]
impl KeyValueDb for LlvmKvService {
    #[tracing::instrument(skip_all)]
    async fn get_value(
        &self,
        request: Request<GetValueRequest>,
    ) -> Result<Response<GetValueResponse>, Status> {
        let request = request.into_inner();
        if request.key.is_empty() {
            return Err(Status::invalid_argument("empty key"));
        }
        let key = kv_storage_key(&request.key);

        fn error_response(message: String) -> GetValueResponse {
            GetValueResponse {
                outcome: get_value_response::Outcome::Error as i32,
                value: None,
                error: Some(ResponseError {
                    description: message,
                }),
            }
        }

        let deps = &self.state.deps;
        let payload = match deps.storage.download_urls(&key).await {
            Ok(urls) => match deps.url_proxy.download_bytes(&urls).await {
                Ok(payload) => Some(payload),
                Err(ProxyError::NotFound) => None,
                Err(err) => return Ok(Response::new(error_response(err.to_string()))),
            },
            Err(StorageError::CacheNotFound) => None,
            Err(err) => return Ok(Response::new(error_response(err.to_string()))),
        };

        let payload = match payload {
            Some(payload) => payload,
            None => {
                deps.stats.record_miss();
                return Ok(Response::new(GetValueResponse {
                    outcome: get_value_response::Outcome::KeyNotFound as i32,
                    value: None,
                    error: None,
                }));
            }
        };

        let value = match Value::decode(payload) {
            Ok(value) => value,
            Err(err) => {
                return Ok(Response::new(error_response(format!(
                    "stored value does not decode: {err}"
                ))))
            }
        };

        deps.stats.record_hit();
        Ok(Response::new(GetValueResponse {
            outcome: get_value_response::Outcome::Success as i32,
            value: Some(value),
            error: None,
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn put_value(
        &self,
        request: Request<PutValueRequest>,
    ) -> Result<Response<PutValueResponse>, Status> {
        let request = request.into_inner();
        if request.key.is_empty() {
            return Err(Status::invalid_argument("empty key"));
        }
        let key = kv_storage_key(&request.key);
        let value = request.value.unwrap_or_default();
        let payload = Bytes::from(value.encode_to_vec());

        fn error_response(message: String) -> PutValueResponse {
            PutValueResponse {
                outcome: put_value_response::Outcome::Error as i32,
                error: Some(ResponseError {
                    description: message,
                }),
            }
        }

        let deps = &self.state.deps;
        let info = match deps.storage.upload_url(&key, None).await {
            Ok(info) => info,
            Err(err) => return Ok(Response::new(error_response(err.to_string()))),
        };
        if let Err(err) = deps.url_proxy.upload_bytes(&info, payload).await {
            return Ok(Response::new(error_response(err.to_string())));
        }

        Ok(Response::new(PutValueResponse {
            outcome: put_value_response::Outcome::Success as i32,
            error: None,
        }))
    }
}
