// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Bazel Remote Execution API v2: content-addressable storage, the
//! ByteStream transfer service, server capabilities, and the Remote Asset
//! Fetch/Push services, all backed by the presigned-URL blob store.
//!
//! Only SHA-256 is supported. The canonical empty blob short-circuits every
//! CAS operation without touching storage.

use std::sync::Arc;

use bytes::Bytes;
use digest::Digest;
use itertools::{Either, Itertools};
use protocol::{Deps, Protocol, ProtocolFactory, Registrar, RegistrationError};
use protos::build::bazel::remote::asset::v1::fetch_server::FetchServer;
use protos::build::bazel::remote::asset::v1::push_server::PushServer;
use protos::build::bazel::remote::execution::v2 as remoting_protos;
use protos::build::bazel::remote::execution::v2::capabilities_server::CapabilitiesServer;
use protos::build::bazel::remote::execution::v2::content_addressable_storage_server::ContentAddressableStorageServer;
use protos::google::bytestream::byte_stream_server::ByteStreamServer;
use storage::StorageError;
use tonic::Status;
use url_proxy::ProxyError;

mod asset_service;
mod byte_stream_service;
mod capabilities_service;
mod cas_service;
mod resource_name;


use asset_service::AssetService;
use byte_stream_service::ByteStreamService;
use capabilities_service::CapabilitiesService;
use cas_service::CasService;

pub struct BazelFactory;

impl ProtocolFactory for BazelFactory {
    fn id(&self) -> &'static str {
        "bazel"
    }

    fn create(&self, deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError> {
        Ok(Box::new(BazelProtocol {
            inner: Arc::new(InnerServer { deps: deps.clone() }),
        }))
    }
}

pub struct BazelProtocol {
    inner: Arc<InnerServer>,
}

impl Protocol for BazelProtocol {
    fn register(self: Box<Self>, registrar: &mut Registrar) -> Result<(), RegistrationError> {
        if !registrar.grpc_available() {
            return Err(RegistrationError::GrpcUnavailable("bazel".to_owned()));
        }

        registrar.add_grpc_service(
            "bazel",
            ContentAddressableStorageServer::new(CasService {
                inner: self.inner.clone(),
            }),
        )?;
        registrar.add_grpc_service(
            "bazel",
            ByteStreamServer::new(ByteStreamService {
                inner: self.inner.clone(),
            }),
        )?;
        registrar.add_grpc_service(
            "bazel",
            CapabilitiesServer::new(CapabilitiesService {
                inner: self.inner.clone(),
            }),
        )?;
        registrar.add_grpc_service(
            "bazel",
            FetchServer::new(AssetService {
                inner: self.inner.clone(),
            }),
        )?;
        registrar.add_grpc_service(
            "bazel",
            PushServer::new(AssetService { inner: self.inner }),
        )?;
        Ok(())
    }
}

pub(crate) struct InnerServer {
    pub(crate) deps: Deps,
}

/// `bazel/cas/v2/<base64url-instance-or-underscore>/sha256/<hex>/<size>`
pub(crate) fn cas_blob_key(instance: &str, digest: &Digest) -> String {
    let instance_segment = if instance.is_empty() {
        "_".to_owned()
    } else {
        base64::encode_config(instance, base64::URL_SAFE_NO_PAD)
    };
    format!(
        "bazel/cas/v2/{}/sha256/{}/{}",
        instance_segment,
        digest.hex(),
        digest.size_bytes
    )
}

impl InnerServer {
    pub(crate) async fn blob_exists(
        &self,
        instance: &str,
        digest: &Digest,
    ) -> Result<bool, StorageError> {
        if digest.is_empty() {
            return Ok(true);
        }
        match self
            .deps
            .storage
            .cache_info(&cas_blob_key(instance, digest), &[])
            .await
        {
            Ok(_) => Ok(true),
            Err(StorageError::CacheNotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Download the whole blob. `Ok(None)` means the blob is absent.
    pub(crate) async fn read_blob(
        &self,
        instance: &str,
        digest: &Digest,
    ) -> Result<Option<Bytes>, String> {
        if digest.is_empty() {
            return Ok(Some(Bytes::new()));
        }
        let urls = match self
            .deps
            .storage
            .download_urls(&cas_blob_key(instance, digest))
            .await
        {
            Ok(urls) => urls,
            Err(StorageError::CacheNotFound) => return Ok(None),
            Err(err) => return Err(err.to_string()),
        };
        match self.deps.url_proxy.download_bytes(&urls).await {
            Ok(data) => Ok(Some(data)),
            Err(ProxyError::NotFound) => Ok(None),
            Err(err) => Err(err.to_string()),
        }
    }

    pub(crate) async fn write_blob(
        &self,
        instance: &str,
        digest: &Digest,
        data: Bytes,
    ) -> Result<(), String> {
        if digest.is_empty() {
            return Ok(());
        }
        let info = self
            .deps
            .storage
            .upload_url(&cas_blob_key(instance, digest), None)
            .await
            .map_err(|err| err.to_string())?;
        self.deps
            .url_proxy
            .upload_bytes(&info, data)
            .await
            .map_err(|err| err.to_string())?;
        Ok(())
    }
}

/// Convert a list of REAPI digests into the internal Digest type.
pub(crate) fn convert_digests(
    digests: Vec<remoting_protos::Digest>,
) -> Result<Vec<Digest>, Status> {
    let (digests, errors): (Vec<_>, Vec<_>) = digests
        .into_iter()
        .map(|d| d.try_into())
        .partition_map(|r: Result<Digest, String>| match r {
            Ok(d) => Either::Left(d),
            Err(e) => Either::Right(e),
        });

    if !errors.is_empty() {
        return Err(Status::invalid_argument(format!(
            "digest errors: {}",
            errors.join(", ")
        )));
    }

    Ok(digests)
}
