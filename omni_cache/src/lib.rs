// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The sidecar server: shared listeners (TCP and unix socket), the HTTP/gRPC
//! transport mux, protocol registration, the stats endpoint, and graceful
//! shutdown.

#![deny(warnings)]

pub mod hybrid;
pub mod listener;
pub mod server;
pub mod stats_endpoint;
