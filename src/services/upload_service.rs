//! src/services/upload_service.rs
//!
//! UploadService - authenticate, check size and quota, sniff the format,
//! stream the payload to the blob store, then record metadata. A metadata
//! failure after the payload landed triggers a best-effort delete of the
//! payload before the error is returned.
//!
//! The quota check is not atomic with the write: two concurrent uploads near
//! the boundary can both pass and overshoot by at most one file.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::{
        account::Account,
        object::{StoredObject, alias_for, new_identifier, public_url_for, storage_key_for},
    },
    services::{
        blob_store::{BlobError, BlobStore, ByteStream, PutOptions, ServerSideEncryption},
        metadata_store::MetadataStore,
        sniff::{SNIFF_LEN, sniff_image},
    },
};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::{info, warn};

/// Cache directive requested for every stored image.
pub const CACHE_CONTROL: &str = "max-age=31536000";

/// Per-file size ceilings.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_file_bytes_trial: i64,
    pub max_file_bytes_paid: i64,
}

impl UploadLimits {
    pub fn max_file_bytes(&self, account: &Account) -> i64 {
        if account.plan.is_trial() {
            self.max_file_bytes_trial
        } else {
            self.max_file_bytes_paid
        }
    }
}

#[derive(Clone)]
pub struct UploadService {
    metadata: MetadataStore,
    blobs: Arc<dyn BlobStore>,
    base_url: String,
    limits: UploadLimits,
}

impl UploadService {
    pub fn new(
        metadata: MetadataStore,
        blobs: Arc<dyn BlobStore>,
        base_url: impl Into<String>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            metadata,
            blobs,
            base_url: base_url.into(),
            limits,
        }
    }

    pub async fn authenticate(&self, api_key: &str) -> ServiceResult<Account> {
        self.metadata
            .find_account_by_key(api_key)
            .await?
            .ok_or(ServiceError::InvalidCredential)
    }

    pub async fn upload(
        &self,
        api_key: &str,
        body: ByteStream,
        declared_size: i64,
    ) -> ServiceResult<StoredObject> {
        let account = self.authenticate(api_key).await?;
        self.upload_for(&account, body, declared_size).await
    }

    /// Upload on behalf of an already-resolved account.
    pub async fn upload_for(
        &self,
        account: &Account,
        mut body: ByteStream,
        declared_size: i64,
    ) -> ServiceResult<StoredObject> {
        if declared_size < 0 {
            return Err(ServiceError::InvalidParameter(
                "declared size must not be negative".into(),
            ));
        }
        let limit = self.limits.max_file_bytes(account);
        if declared_size > limit {
            return Err(ServiceError::FileTooLarge {
                size: declared_size,
                limit,
            });
        }

        let (used, _) = self.metadata.storage_usage(account.id).await?;
        let quota = account.storage_quota_bytes();
        if used + declared_size > quota {
            return Err(ServiceError::QuotaExceeded {
                used,
                requested: declared_size,
                quota,
            });
        }

        let prefix = read_prefix(&mut body, SNIFF_LEN).await?;
        let format = sniff_image(&prefix).ok_or(ServiceError::UnsupportedType)?;

        let id = new_identifier();
        let extension = format.extension();
        let storage_key = storage_key_for(&id, extension);
        let full_body = stream::once(async move { Ok::<_, std::io::Error>(prefix) })
            .chain(body)
            .boxed();

        let options = PutOptions {
            content_length: declared_size as u64,
            content_type: format.mime_type().to_string(),
            cache_control: CACHE_CONTROL.to_string(),
            encryption: ServerSideEncryption::Aes256,
        };
        let receipt = self
            .blobs
            .put(&storage_key, full_body, options)
            .await
            .map_err(|err| match err {
                BlobError::LengthMismatch { declared, received } => {
                    ServiceError::InvalidParameter(format!(
                        "declared size {declared} does not match the {received} bytes received"
                    ))
                }
                other => ServiceError::Blob(other),
            })?;

        let object = StoredObject {
            alias: alias_for(&id),
            account_id: account.id,
            extension: extension.to_string(),
            content_type: format.mime_type().to_string(),
            size_bytes: declared_size,
            url: public_url_for(&self.base_url, &id, extension),
            storage_key,
            uploaded_at: Utc::now(),
            deleted_at: None,
            id,
        };

        if let Err(err) = self.metadata.insert_object(&object).await {
            if let Err(cleanup_err) = self.blobs.delete(&object.storage_key).await {
                warn!(
                    key = %object.storage_key,
                    error = %cleanup_err,
                    "failed to remove blob after metadata insert failure"
                );
            }
            return Err(ServiceError::Database(err));
        }

        info!(
            id = %object.id,
            account = %account.id,
            size = object.size_bytes,
            etag = %receipt.etag,
            "stored upload"
        );
        Ok(object)
    }
}

/// Pull chunks until at least `len` bytes are buffered or the body ends.
/// Everything read is returned, so no bytes are lost when re-chaining.
async fn read_prefix(body: &mut ByteStream, len: usize) -> ServiceResult<Bytes> {
    let mut buf = BytesMut::with_capacity(len);
    while buf.len() < len {
        match body.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(err)) => return Err(ServiceError::Blob(BlobError::Io(err))),
            None => break,
        }
    }
    Ok(buf.freeze())
}
