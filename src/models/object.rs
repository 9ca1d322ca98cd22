//! Represents an uploaded image and the keys derived from its identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Prefix of the external alias returned to clients.
pub const ALIAS_PREFIX: &str = "img_";

/// Length of the canonical identifier (UUIDv7 as uppercase hex, no hyphens).
pub const IDENTIFIER_LEN: usize = 32;

/// A stored image's metadata. The payload itself lives in the blob store
/// under `storage_key`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct StoredObject {
    /// Canonical time-ordered identifier (uppercase).
    pub id: String,

    /// External alias: `img_` + lowercase identifier.
    pub alias: String,

    /// Owning account.
    pub account_id: Uuid,

    /// Canonical extension of the sniffed format (e.g. `jpg`).
    pub extension: String,

    /// Canonical MIME type of the sniffed format.
    pub content_type: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Partitioned blob-store key, fixed for the object's lifetime.
    pub storage_key: String,

    /// Public URL clients fetch the image from.
    pub url: String,

    pub uploaded_at: DateTime<Utc>,

    /// Set when the owner deletes the object; purged later.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredObject {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Generate a new time-ordered identifier.
pub fn new_identifier() -> String {
    Uuid::now_v7().simple().to_string().to_ascii_uppercase()
}

/// `img_` + lowercase identifier.
pub fn alias_for(id: &str) -> String {
    format!("{}{}", ALIAS_PREFIX, id.to_ascii_lowercase())
}

/// Three-level partition path: `a/b/c/<ID>.<ext>` from the lowercase first
/// three characters of the identifier.
pub fn storage_key_for(id: &str, extension: &str) -> String {
    let lower = id.to_ascii_lowercase();
    let mut shards = lower.chars().take(3);
    let (a, b, c) = (
        shards.next().unwrap_or('0'),
        shards.next().unwrap_or('0'),
        shards.next().unwrap_or('0'),
    );
    format!("{a}/{b}/{c}/{id}.{extension}")
}

pub fn public_url_for(base_url: &str, id: &str, extension: &str) -> String {
    format!("{}/i/{}.{}", base_url.trim_end_matches('/'), id, extension)
}

/// Normalize a client-supplied reference (alias or raw identifier, any case)
/// to the canonical identifier. Returns `None` for anything that cannot be one.
pub fn normalize_reference(reference: &str) -> Option<String> {
    let raw = reference
        .get(..ALIAS_PREFIX.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(ALIAS_PREFIX))
        .map(|_| &reference[ALIAS_PREFIX.len()..])
        .unwrap_or(reference);
    if raw.len() != IDENTIFIER_LEN || !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    Some(raw.to_ascii_uppercase())
}
