// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! LLVM compilation cache: a key-value service for the compiler's cached
//! result records and a CAS service for the content-addressed object graph
//! behind them. Both ride the same gRPC endpoint as the Bazel services.

use std::sync::Arc;

use protocol::{Deps, Protocol, ProtocolFactory, Registrar, RegistrationError};
use protos::compilation_cache_service::cas::v1::cas_db_server::CasDbServer;
use protos::compilation_cache_service::keyvalue::v1::key_value_db_server::KeyValueDbServer;

mod cas_service;
mod kv_service;
pub(crate) mod object;


use cas_service::LlvmCasService;
use kv_service::LlvmKvService;

pub struct LlvmCacheFactory;

impl ProtocolFactory for LlvmCacheFactory {
    fn id(&self) -> &'static str {
        "llvm-cache"
    }

    fn create(&self, deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError> {
        Ok(Box::new(LlvmCache {
            state: Arc::new(LlvmState { deps: deps.clone() }),
        }))
    }
}

pub(crate) struct LlvmState {
    pub(crate) deps: Deps,
}

pub struct LlvmCache {
    state: Arc<LlvmState>,
}

impl Protocol for LlvmCache {
    fn register(self: Box<Self>, registrar: &mut Registrar) -> Result<(), RegistrationError> {
        if !registrar.grpc_available() {
            return Err(RegistrationError::GrpcUnavailable("llvm-cache".to_owned()));
        }
        registrar.add_grpc_service(
            "llvm-cache",
            KeyValueDbServer::new(LlvmKvService {
                state: self.state.clone(),
            }),
        )?;
        registrar.add_grpc_service(
            "llvm-cache",
            CasDbServer::new(LlvmCasService { state: self.state }),
        )?;
        Ok(())
    }
}
