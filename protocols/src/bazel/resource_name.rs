// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum ResourceNameError {
    /// The name is well formed but asks for something this server does not
    /// implement (compressed blobs).
    Unsupported(String),
    Malformed(String),
}

impl fmt::Display for ResourceNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceNameError::Unsupported(msg) | ResourceNameError::Malformed(msg) => {
                write!(f, "{msg}")
            }
        }
    }
}

fn malformed(msg: impl Into<String>) -> ResourceNameError {
    ResourceNameError::Malformed(msg.into())
}

fn check_compression(parts: &[&str]) -> Result<(), ResourceNameError> {
    if parts.iter().any(|p| *p == "compressed-blobs") {
        return Err(ResourceNameError::Unsupported(
            "compressed blobs are not supported".to_owned(),
        ));
    }
    Ok(())
}

/// Recover the instance-name prefix (everything before `parts[boundary]`)
/// from the original string, preserving any slashes inside it.
fn instance_prefix<'a>(resource: &'a str, parts: &[&str], boundary: usize) -> &'a str {
    if boundary == 0 {
        ""
    } else {
        let instance_parts = &parts[0..boundary];
        let end = instance_parts.iter().map(|p| p.len()).sum::<usize>() + instance_parts.len() - 1;
        &resource[0..end]
    }
}

/// The digest components may carry a leading `sha256` function segment
/// (`blobs/sha256/<hash>/<size>`) or the bare two-segment form.
fn parse_digest_segments(segments: &[&str]) -> Result<(usize, usize), ResourceNameError> {
    match segments.first() {
        Some(&"sha256") => Ok((1, 2)),
        Some(_) => Ok((0, 1)),
        None => Err(malformed("Malformed resource name: missing digest")),
    }
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) struct ParsedReadResourceName<'a> {
    pub instance_name: &'a str,
    pub hash: &'a str,
    pub size: u64,
}

/// Parses a read resource name of the form `{instance_name}/blobs/{hash}/{size}`
/// (optionally `blobs/sha256/{hash}/{size}`). The `{instance_name}` may be
/// blank, with no leading slash.
pub(crate) fn parse_read_resource_name(
    resource: &str,
) -> Result<ParsedReadResourceName<'_>, ResourceNameError> {
    if resource.is_empty() {
        return Err(malformed("Missing resource name"));
    }

    let parts: Vec<_> = resource.split('/').collect();
    check_compression(&parts)?;

    let blobs_index = match parts.iter().position(|p| *p == "blobs") {
        Some(index) => index,
        None => return Err(malformed("Malformed resource name: missing `blobs` component")),
    };

    let digest_segments = &parts[blobs_index + 1..];
    let (hash_offset, size_offset) = parse_digest_segments(digest_segments)?;
    if digest_segments.len() <= size_offset {
        return Err(malformed(
            "Malformed resource name: not enough path components after `blobs`",
        ));
    }

    let size = digest_segments[size_offset]
        .parse::<u64>()
        .map_err(|_| malformed("Malformed resource name: cannot parse size"))?;

    Ok(ParsedReadResourceName {
        instance_name: instance_prefix(resource, &parts, blobs_index),
        hash: digest_segments[hash_offset],
        size,
    })
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) struct ParsedWriteResourceName<'a> {
    pub instance_name: &'a str,
    pub uuid: &'a str,
    pub hash: &'a str,
    pub size: u64,
}

/// Parses a write resource name of the form
/// `{instance_name}/uploads/{uuid}/blobs/{hash}/{size}` (optionally with a
/// `sha256` segment after `blobs`). Components after the size are accepted
/// and ignored.
pub(crate) fn parse_write_resource_name(
    resource: &str,
) -> Result<ParsedWriteResourceName<'_>, ResourceNameError> {
    if resource.is_empty() {
        return Err(malformed("Missing resource name"));
    }

    let parts: Vec<_> = resource.split('/').collect();
    check_compression(&parts)?;

    let uploads_index = match parts.iter().position(|p| *p == "uploads") {
        Some(index) => index,
        None => {
            return Err(malformed(
                "Malformed resource name: missing `uploads` component",
            ))
        }
    };

    if parts.len() - uploads_index < 5 {
        return Err(malformed(
            "Malformed resource name: not enough path components after `uploads`",
        ));
    }

    if parts[uploads_index + 2] != "blobs" {
        return Err(malformed("Malformed resource name: expected `blobs` component"));
    }

    let digest_segments = &parts[uploads_index + 3..];
    let (hash_offset, size_offset) = parse_digest_segments(digest_segments)?;
    if digest_segments.len() <= size_offset {
        return Err(malformed(
            "Malformed resource name: not enough path components after `blobs`",
        ));
    }

    let size = digest_segments[size_offset]
        .parse::<u64>()
        .map_err(|_| malformed("Malformed resource name: cannot parse size"))?;

    Ok(ParsedWriteResourceName {
        instance_name: instance_prefix(resource, &parts, uploads_index),
        uuid: parts[uploads_index + 1],
        hash: digest_segments[hash_offset],
        size,
    })
}
