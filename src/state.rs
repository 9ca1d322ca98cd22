//! Shared application state handed to every handler and middleware.

use crate::services::{
    blob_store::BlobStore,
    key_service::KeyService,
    metadata_store::MetadataStore,
    object_service::ObjectService,
    rate_limiter::RateLimiter,
    upload_service::{UploadLimits, UploadService},
    usage_reporter::UsageReporter,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub metadata: MetadataStore,
    pub blobs: Arc<dyn BlobStore>,
    pub uploads: UploadService,
    pub objects: ObjectService,
    pub usage: UsageReporter,
    pub keys: KeyService,
    /// Keyed by account id.
    pub account_limiter: Arc<RateLimiter>,
    /// Keyed by client address; guards unauthenticated endpoints.
    pub ip_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        metadata: MetadataStore,
        blobs: Arc<dyn BlobStore>,
        base_url: &str,
        limits: UploadLimits,
    ) -> Self {
        let account_limiter = Arc::new(RateLimiter::new());
        Self {
            uploads: UploadService::new(metadata.clone(), blobs.clone(), base_url, limits),
            objects: ObjectService::new(metadata.clone(), blobs.clone()),
            usage: UsageReporter::new(metadata.clone(), account_limiter.clone()),
            keys: KeyService::new(metadata.clone()),
            ip_limiter: Arc::new(RateLimiter::new()),
            account_limiter,
            metadata,
            blobs,
        }
    }
}
