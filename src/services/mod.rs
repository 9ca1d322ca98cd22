pub mod bandwidth_accountant;
pub mod blob_store;
pub mod key_service;
pub mod lifecycle_worker;
pub mod metadata_store;
pub mod object_service;
pub mod rate_limiter;
pub mod sniff;
pub mod upload_service;
pub mod usage_reporter;
