//! Read, list and soft-delete operations on stored objects.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::{
        account::Account,
        object::{StoredObject, normalize_reference},
    },
    services::{
        blob_store::{BlobError, BlobStore, ByteStream},
        metadata_store::{MetadataStore, ObjectSort},
    },
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Raw listing parameters as supplied by the caller.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ObjectPage {
    pub files: Vec<StoredObject>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub sort: &'static str,
    /// Path of the following page, absent on the last one.
    pub next: Option<String>,
}

#[derive(Clone)]
pub struct ObjectService {
    metadata: MetadataStore,
    blobs: Arc<dyn BlobStore>,
}

impl ObjectService {
    pub fn new(metadata: MetadataStore, blobs: Arc<dyn BlobStore>) -> Self {
        Self { metadata, blobs }
    }

    /// Look up a live object by identifier and extension and open its payload.
    pub async fn open(
        &self,
        reference: &str,
        extension: &str,
    ) -> ServiceResult<(StoredObject, ByteStream)> {
        let id = normalize_reference(reference).ok_or(ServiceError::NotFound)?;
        let object = self
            .metadata
            .find_object(&id)
            .await?
            .filter(|o| o.extension.eq_ignore_ascii_case(extension))
            .ok_or(ServiceError::NotFound)?;

        let body = match self.blobs.get(&object.storage_key).await {
            Ok(body) => body,
            Err(BlobError::NotFound(_)) => return Err(ServiceError::NotFound),
            Err(err) => return Err(err.into()),
        };
        Ok((object, body))
    }

    /// Soft-delete an object the caller owns. Missing and foreign objects are
    /// reported the same way.
    pub async fn delete(&self, account: &Account, reference: &str) -> ServiceResult<StoredObject> {
        let id = normalize_reference(reference).ok_or(ServiceError::NotFound)?;
        let object = self
            .metadata
            .find_object(&id)
            .await?
            .filter(|o| o.account_id == account.id)
            .ok_or(ServiceError::NotFound)?;

        let now = Utc::now();
        if !self.metadata.soft_delete_object(&id, account.id, now).await? {
            return Err(ServiceError::NotFound);
        }
        info!(id = %id, account = %account.id, "soft-deleted object");
        Ok(StoredObject {
            deleted_at: Some(now),
            ..object
        })
    }

    pub async fn list(&self, account: &Account, params: ListParams) -> ServiceResult<ObjectPage> {
        let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ServiceError::InvalidParameter(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        let offset = params.offset.unwrap_or(0);
        if offset < 0 {
            return Err(ServiceError::InvalidParameter(
                "offset must not be negative".into(),
            ));
        }
        let sort = match params.sort.as_deref() {
            None => ObjectSort::default(),
            Some(value) => ObjectSort::parse(value).ok_or_else(|| {
                ServiceError::InvalidParameter(format!(
                    "sort must be one of uploaded_at_desc, uploaded_at_asc, size_desc, size_asc; got `{value}`"
                ))
            })?,
        };

        let (files, total) = self
            .metadata
            .list_objects(account.id, limit, offset, sort)
            .await?;
        let next = offset
            .checked_add(limit)
            .filter(|next| *next < total)
            .map(|next| format!("/files?limit={limit}&offset={next}&sort={}", sort.as_str()));

        Ok(ObjectPage {
            files,
            total,
            limit,
            offset,
            sort: sort.as_str(),
            next,
        })
    }
}
