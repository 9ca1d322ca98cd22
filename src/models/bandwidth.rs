//! Daily bandwidth aggregate per account.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Bytes served from the CDN for one account on one calendar day (UTC).
///
/// Written only by the bandwidth accountant; each run replaces the totals
/// for the day rather than adding to them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct BandwidthRecord {
    pub account_id: Uuid,
    pub day: NaiveDate,
    pub bytes_served: i64,
    pub request_count: i64,
    pub updated_at: DateTime<Utc>,
}
