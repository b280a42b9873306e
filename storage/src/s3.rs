// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::{PresignedRequest, PresigningConfig};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::sync::OnceCell;

use crate::{BlobStore, CacheInfo, MultipartStore, StorageError, UrlInfo};

/// Lifetime of presigned URLs. Must cover at least one request timeout so a
/// client that receives a URL right before its own deadline can still use it.
const PRESIGN_TTL: Duration = Duration::from_secs(10 * 60);

const OCTET_STREAM: &str = "application/octet-stream";

/// Blob store backed by an S3-compatible bucket. Clients transfer data
/// directly against presigned URLs; this process only issues control-plane
/// calls (head, list, multipart bookkeeping).
pub struct S3Store {
    client: Client,
    bucket: String,
    key_prefix: String,
    bucket_ready: OnceCell<()>,
}

impl S3Store {
    /// The bucket name is normalized to lower case (S3 bucket names are
    /// case-insensitive on creation but case-sensitive on use).
    pub fn new(client: Client, bucket: &str, key_prefix: &str) -> Self {
        S3Store {
            client,
            bucket: bucket.to_lowercase(),
            key_prefix: key_prefix.trim_matches('/').to_owned(),
            bucket_ready: OnceCell::new(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}/{}", self.key_prefix, key)
        }
    }

    fn client_key<'a>(&self, object_key: &'a str) -> &'a str {
        if self.key_prefix.is_empty() {
            object_key
        } else {
            object_key
                .strip_prefix(&self.key_prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(object_key)
        }
    }

    fn presign_config(&self) -> Result<PresigningConfig, StorageError> {
        PresigningConfig::expires_in(PRESIGN_TTL)
            .map_err(|err| StorageError::Internal(format!("presigning config: {err}")))
    }

    /// Create the bucket on first use if it does not exist yet.
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        self.bucket_ready
            .get_or_try_init(|| async {
                match self.client.head_bucket().bucket(&self.bucket).send().await {
                    Ok(_) => return Ok(()),
                    Err(err) => {
                        let service_err = err.into_service_error();
                        if !service_err.is_not_found() {
                            return Err(StorageError::Unavailable(format!(
                                "head bucket {}: {service_err}",
                                self.bucket
                            )));
                        }
                    }
                }

                tracing::info!(bucket = %self.bucket, "creating bucket");
                match self.client.create_bucket().bucket(&self.bucket).send().await {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        let service_err = err.into_service_error();
                        if service_err.is_bucket_already_owned_by_you()
                            || service_err.is_bucket_already_exists()
                        {
                            Ok(())
                        } else {
                            Err(StorageError::Unavailable(format!(
                                "create bucket {}: {service_err}",
                                self.bucket
                            )))
                        }
                    }
                }
            })
            .await
            .map(|_| ())
    }

    async fn head(&self, object_key: &str) -> Result<CacheInfo, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|err| {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    StorageError::CacheNotFound
                } else {
                    StorageError::Unavailable(format!("head object {object_key}: {service_err}"))
                }
            })?;

        Ok(CacheInfo {
            key: self.client_key(object_key).to_owned(),
            size: output.content_length().unwrap_or(0).max(0) as u64,
            metadata: output.metadata().cloned(),
        })
    }

    /// First object key under `prefix` in the backend's listing order.
    async fn first_key_with_prefix(&self, prefix: &str) -> Result<Option<String>, StorageError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|err| {
                StorageError::Unavailable(format!("list objects with prefix {prefix}: {err}"))
            })?;

        Ok(output
            .contents()
            .first()
            .and_then(|object| object.key())
            .map(|key| key.to_owned()))
    }
}

fn url_info_from_presigned(presigned: PresignedRequest) -> UrlInfo {
    let extra_headers: HashMap<String, String> = presigned
        .headers()
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect();
    UrlInfo {
        url: presigned.uri().to_owned(),
        extra_headers,
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn download_urls(&self, key: &str) -> Result<Vec<UrlInfo>, StorageError> {
        self.ensure_bucket().await?;
        let object_key = self.object_key(key);

        // Presigning never touches the object, so probe existence first to be
        // able to report CacheNotFound instead of a URL that will 404.
        self.head(&object_key).await?;

        let get = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .presigned(self.presign_config()?)
            .await
            .map_err(|err| StorageError::Unavailable(format!("presign get {key}: {err}")))?;

        // A presigned URL is only valid for the method it was signed for, so a
        // separate HEAD-signed URL rides along for callers that probe size
        // before transferring. The URL proxy walks the list in order.
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .presigned(self.presign_config()?)
            .await
            .map_err(|err| StorageError::Unavailable(format!("presign head {key}: {err}")))?;

        Ok(vec![
            url_info_from_presigned(get),
            url_info_from_presigned(head),
        ])
    }

    async fn upload_url(
        &self,
        key: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<UrlInfo, StorageError> {
        self.ensure_bucket().await?;
        let object_key = self.object_key(key);

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(OCTET_STREAM)
            .set_metadata(metadata.cloned())
            .presigned(self.presign_config()?)
            .await
            .map_err(|err| StorageError::Unavailable(format!("presign put {key}: {err}")))?;

        let mut info = url_info_from_presigned(presigned);
        // The client must send the signed headers back verbatim, content type
        // and user metadata included.
        info.extra_headers
            .entry("Content-Type".to_owned())
            .or_insert_with(|| OCTET_STREAM.to_owned());
        if let Some(metadata) = metadata {
            for (name, value) in metadata {
                info.extra_headers
                    .entry(format!("x-amz-meta-{name}"))
                    .or_insert_with(|| value.clone());
            }
        }
        Ok(info)
    }

    async fn cache_info(&self, key: &str, prefixes: &[String]) -> Result<CacheInfo, StorageError> {
        self.ensure_bucket().await?;

        match self.head(&self.object_key(key)).await {
            Ok(info) => return Ok(info),
            Err(StorageError::CacheNotFound) => {}
            Err(err) => return Err(err),
        }

        for prefix in prefixes {
            if let Some(matched) = self.first_key_with_prefix(&self.object_key(prefix)).await? {
                return self.head(&matched).await;
            }
        }

        Err(StorageError::CacheNotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_bucket().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|err| StorageError::Unavailable(format!("delete object {key}: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl MultipartStore for S3Store {
    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<String, StorageError> {
        self.ensure_bucket().await?;
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .content_type(OCTET_STREAM)
            .set_metadata(metadata.cloned())
            .send()
            .await
            .map_err(|err| {
                StorageError::Unavailable(format!("create multipart upload {key}: {err}"))
            })?;

        output
            .upload_id()
            .map(|id| id.to_owned())
            .ok_or_else(|| StorageError::Internal("backend returned no upload id".to_owned()))
    }

    async fn upload_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        content_length: u64,
    ) -> Result<UrlInfo, StorageError> {
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .content_length(content_length as i64)
            .presigned(self.presign_config()?)
            .await
            .map_err(|err| {
                StorageError::Unavailable(format!(
                    "presign part {part_number} of upload {upload_id}: {err}"
                ))
            })?;

        Ok(url_info_from_presigned(presigned))
    }

    async fn commit_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<(), StorageError> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|(part_number, etag)| {
                CompletedPart::builder()
                    .part_number(*part_number as i32)
                    .e_tag(etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| {
                StorageError::Unavailable(format!("commit multipart upload {upload_id}: {err}"))
            })?;
        Ok(())
    }
}
