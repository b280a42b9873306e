// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! CAS object identity. An object is (references, data); its digest is BLAKE3
//! over `LE64(#refs) || refs || LE64(len(data)) || data`, where every
//! reference is itself a 32-byte digest. Ids travel either as the raw 32
//! bytes or as the printable `llvmcas://<64 hex>` form; both name the same
//! object.

use bytes::Bytes;

pub(crate) const CAS_ID_PREFIX: &str = "llvmcas://";

pub(crate) const DIGEST_SIZE: usize = 32;

pub(crate) fn parse_cas_id(id: &[u8]) -> Result<[u8; DIGEST_SIZE], String> {
    if id.is_empty() {
        return Err("empty CAS id".to_owned());
    }

    if id.len() == DIGEST_SIZE {
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(id);
        return Ok(digest);
    }

    if let Ok(printable) = std::str::from_utf8(id) {
        if let Some(hex_digest) = printable.strip_prefix(CAS_ID_PREFIX) {
            if hex_digest.len() != DIGEST_SIZE * 2 {
                return Err(format!(
                    "CAS id hex digest has length {}, expected {}",
                    hex_digest.len(),
                    DIGEST_SIZE * 2
                ));
            }
            let decoded = hex::decode(hex_digest)
                .map_err(|err| format!("CAS id is not valid hex: {err}"))?;
            let mut digest = [0u8; DIGEST_SIZE];
            digest.copy_from_slice(&decoded);
            return Ok(digest);
        }
    }

    Err(format!("unrecognized CAS id of {} bytes", id.len()))
}

/// The printable id form, as stored and as returned in responses.
pub(crate) fn format_cas_id(digest: &[u8; DIGEST_SIZE]) -> Bytes {
    Bytes::from(format!("{CAS_ID_PREFIX}{}", hex::encode(digest)))
}

pub(crate) fn object_digest(refs: &[[u8; DIGEST_SIZE]], data: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(refs.len() as u64).to_le_bytes());
    for reference in refs {
        hasher.update(reference);
    }
    hasher.update(&(data.len() as u64).to_le_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

pub(crate) fn kv_storage_key(key: &[u8]) -> String {
    format!(
        "llvm-cache/kv/{}",
        base64::encode_config(key, base64::URL_SAFE_NO_PAD)
    )
}

pub(crate) fn cas_storage_key(digest: &[u8; DIGEST_SIZE]) -> String {
    format!("llvm-cache/cas/{}", hex::encode(digest))
}
