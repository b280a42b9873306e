// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! GitHub Actions cache protocols: the classic v1 REST API with its multipart
//! upload session machine, and the v2 Twirp API that fronts the Azure Blob
//! compatibility shim.

pub mod v1;
pub mod v2;

pub use v1::GhaV1Factory;
pub use v2::GhaV2Factory;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Query-escape set: everything but `[A-Za-z0-9-_.~]` is escaped.
const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub(crate) fn encode_component(raw: &str) -> String {
    utf8_percent_encode(raw, QUERY_ESCAPE).to_string()
}

pub(crate) fn decode_component(encoded: &str) -> String {
    percent_decode_str(encoded)
        .decode_utf8_lossy()
        .into_owned()
}

/// Storage key for a cache entry, version first so restore-key prefix search
/// stays scoped to one version.
pub(crate) fn storage_key(version: &str, key: &str) -> String {
    format!("{}-{}", encode_component(version), encode_component(key))
}

/// Recover the client-visible key from a matched storage key.
pub(crate) fn client_key(storage_key: &str, version: &str) -> String {
    let prefix = format!("{}-", encode_component(version));
    let encoded_key = storage_key.strip_prefix(&prefix).unwrap_or(storage_key);
    decode_component(encoded_key)
}

/// Re-escape a storage key for embedding in a URL path: the HTTP mux decodes
/// percent escapes once, so what arrives at the cache handler is the storage
/// key itself.
pub(crate) fn url_path_component(storage_key: &str) -> String {
    utf8_percent_encode(storage_key, QUERY_ESCAPE).to_string()
}
