// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use tonic::{Request, Response, Status};

use protos::build::bazel::remote::execution::v2::{
    capabilities_server::Capabilities, digest_function::Value as DigestFunction_Value,
    ActionCacheUpdateCapabilities, CacheCapabilities, GetCapabilitiesRequest, ServerCapabilities,
};
use protos::build::bazel::semver::SemVer;

use super::InnerServer;

pub(super) struct CapabilitiesService {
    #[allow(dead_code)]
    pub(super) inner: Arc<InnerServer>,
}

#[tonic::async_trait]
impl Capabilities for CapabilitiesService {
    #[tracing::instrument(skip_all)]
    async fn get_capabilities(
        &self,
        _request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        let response = ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_function: vec![DigestFunction_Value::Sha256 as i32],
                action_cache_update_capabilities: Some(ActionCacheUpdateCapabilities {
                    // There is no action cache behind this sidecar.
                    update_enabled: false,
                }),
                // 0 means "no limit" here; clients that read it as "batching
                // disabled" fall back to ByteStream, which is fully supported.
                max_batch_total_size_bytes: 0,
                ..CacheCapabilities::default()
            }),
            low_api_version: Some(SemVer {
                major: 2,
                minor: 0,
                patch: 0,
                prerelease: String::new(),
            }),
            high_api_version: Some(SemVer {
                major: 2,
                minor: 3,
                patch: 0,
                prerelease: String::new(),
            }),
            ..ServerCapabilities::default()
        };

        Ok(Response::new(response))
    }
}
