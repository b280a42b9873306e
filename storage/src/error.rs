// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use tonic::Status;

/// Errors surfaced by blob-store operations. `CacheNotFound` is the sentinel
/// that distinguishes "the key is absent" from a transport failure; callers
/// treat it as normal control flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageError {
    CacheNotFound,
    InvalidArgument(String),
    Unavailable(String),
    Internal(String),
}

impl std::error::Error for StorageError {}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::CacheNotFound => write!(f, "cache entry not found"),
            StorageError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            StorageError::Unavailable(msg) => write!(f, "{msg}"),
            StorageError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::CacheNotFound)
    }
}

impl From<String> for StorageError {
    fn from(msg: String) -> Self {
        StorageError::Internal(msg)
    }
}

impl From<StorageError> for String {
    fn from(err: StorageError) -> Self {
        format!("{err}")
    }
}

impl From<StorageError> for Status {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::CacheNotFound => Status::not_found(""),
            StorageError::InvalidArgument(msg) => Status::invalid_argument(msg),
            StorageError::Unavailable(msg) => Status::unavailable(msg),
            StorageError::Internal(msg) => Status::internal(msg),
        }
    }
}
