// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The cache protocols served by the sidecar. Each module exposes a
//! [`protocol::ProtocolFactory`] that the server wires against the shared
//! transport mux.

#![deny(warnings)]
#![allow(clippy::new_without_default)]

pub mod azure_blob;
pub mod bazel;
pub mod gha;
pub mod http_cache;
pub mod llvm;
pub mod session;
pub mod tuist;

#[cfg(test)]
pub(crate) mod testutil;

use protocol::ProtocolFactory;

/// Every protocol factory, in mount order.
pub fn all_factories() -> Vec<Box<dyn ProtocolFactory>> {
    vec![
        Box::new(http_cache::HttpCacheFactory),
        Box::new(azure_blob::AzureBlobFactory),
        Box::new(gha::GhaV1Factory),
        Box::new(gha::GhaV2Factory),
        Box::new(tuist::TuistFactory),
        Box::new(bazel::BazelFactory),
        Box::new(llvm::LlvmCacheFactory),
    ]
}
