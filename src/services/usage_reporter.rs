//! Read-only usage summary for one account.

use crate::{
    errors::ServiceResult,
    models::account::{Account, Plan},
    services::{metadata_store::MetadataStore, rate_limiter::RateLimiter},
};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, PartialEq)]
pub struct StorageUsage {
    pub used_bytes: i64,
    pub quota_bytes: i64,
    pub percent_used: f64,
    pub file_count: i64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct BandwidthUsage {
    /// First day of the billing period.
    pub period_start: NaiveDate,
    /// First day after the billing period.
    pub period_end: NaiveDate,
    pub used_bytes: i64,
    pub quota_bytes: i64,
    pub percent_used: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct RequestUsage {
    pub used_this_hour: u32,
    pub limit_per_hour: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct UsageReport {
    pub account_id: Uuid,
    pub plan: Plan,
    pub storage: StorageUsage,
    pub bandwidth: BandwidthUsage,
    pub requests: RequestUsage,
}

#[derive(Clone)]
pub struct UsageReporter {
    metadata: MetadataStore,
    limiter: Arc<RateLimiter>,
}

impl UsageReporter {
    pub fn new(metadata: MetadataStore, limiter: Arc<RateLimiter>) -> Self {
        Self { metadata, limiter }
    }

    pub async fn report(&self, account: &Account) -> ServiceResult<UsageReport> {
        self.report_for_day(account, Utc::now().date_naive()).await
    }

    /// Usage with the billing period taken as the calendar month of `today`.
    pub async fn report_for_day(
        &self,
        account: &Account,
        today: NaiveDate,
    ) -> ServiceResult<UsageReport> {
        let (used_bytes, file_count) = self.metadata.storage_usage(account.id).await?;
        let (period_start, period_end) = month_bounds(today);
        let bandwidth_used = self
            .metadata
            .bandwidth_between(account.id, period_start, period_end)
            .await?;
        let window = self.limiter.window_usage(&account.id.to_string());

        Ok(UsageReport {
            account_id: account.id,
            plan: account.plan,
            storage: StorageUsage {
                used_bytes,
                quota_bytes: account.storage_quota_bytes(),
                percent_used: percent(used_bytes, account.storage_quota_bytes()),
                file_count,
            },
            bandwidth: BandwidthUsage {
                period_start,
                period_end,
                used_bytes: bandwidth_used,
                quota_bytes: account.bandwidth_quota_bytes(),
                percent_used: percent(bandwidth_used, account.bandwidth_quota_bytes()),
            },
            requests: RequestUsage {
                used_this_hour: window.count,
                limit_per_hour: account.hourly_request_quota(),
                reset_at: window.reset_at,
            },
        })
    }
}

fn percent(used: i64, quota: i64) -> f64 {
    if quota <= 0 {
        return 0.0;
    }
    used as f64 * 100.0 / quota as f64
}

/// `[first of month, first of next month)`.
fn month_bounds(day: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = day.with_day(1).unwrap_or(day);
    let (year, month) = if start.month() == 12 {
        (start.year() + 1, 1)
    } else {
        (start.year(), start.month() + 1)
    };
    let end = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(start);
    (start, end)
}
