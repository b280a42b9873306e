// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! GOCACHEPROG helper: a long-lived child process the Go toolchain talks to
//! over stdin/stdout. Requests are newline-delimited JSON; binary bodies ride
//! as a separate line holding a JSON string of base64 bytes. Cached objects
//! live on local disk and are mirrored to the Omni-Cache sidecar.

#![deny(warnings)]

pub mod cache;
pub mod client;
pub mod session;
pub mod wire;
