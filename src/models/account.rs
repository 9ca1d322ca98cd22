//! Accounts, their plan tier, and the limits each tier grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

const MIB: i64 = 1024 * 1024;
const GIB: i64 = 1024 * MIB;

/// Plan tier of an account. Trial objects expire automatically.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Plan {
    Trial,
    Starter,
    Pro,
}

/// Quotas granted by a plan.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlanLimits {
    pub storage_bytes: i64,
    pub bandwidth_bytes: i64,
    pub requests_per_hour: u32,
}

impl Plan {
    pub fn limits(self) -> PlanLimits {
        match self {
            Plan::Trial => PlanLimits {
                storage_bytes: 100 * MIB,
                bandwidth_bytes: GIB,
                requests_per_hour: 100,
            },
            Plan::Starter => PlanLimits {
                storage_bytes: 10 * GIB,
                bandwidth_bytes: 50 * GIB,
                requests_per_hour: 1_000,
            },
            Plan::Pro => PlanLimits {
                storage_bytes: 100 * GIB,
                bandwidth_bytes: 500 * GIB,
                requests_per_hour: 10_000,
            },
        }
    }

    pub fn is_trial(self) -> bool {
        matches!(self, Plan::Trial)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Trial => "trial",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
        }
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "trial" => Ok(Plan::Trial),
            "starter" => Ok(Plan::Starter),
            "pro" => Ok(Plan::Pro),
            other => Err(format!("unknown plan `{other}` (expected trial, starter or pro)")),
        }
    }
}

/// An API account. The bearer key is the only credential.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Account {
    pub id: Uuid,

    /// Opaque bearer key presented by clients.
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Mutable plan tier; quotas are derived from it.
    pub plan: Plan,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn limits(&self) -> PlanLimits {
        self.plan.limits()
    }

    pub fn storage_quota_bytes(&self) -> i64 {
        self.limits().storage_bytes
    }

    pub fn bandwidth_quota_bytes(&self) -> i64 {
        self.limits().bandwidth_bytes
    }

    pub fn hourly_request_quota(&self) -> u32 {
        self.limits().requests_per_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_limits_grow_with_tier() {
        let trial = Plan::Trial.limits();
        let starter = Plan::Starter.limits();
        let pro = Plan::Pro.limits();

        assert_eq!(trial.storage_bytes, 100 * MIB);
        assert!(trial.storage_bytes < starter.storage_bytes);
        assert!(starter.storage_bytes < pro.storage_bytes);
        assert!(trial.requests_per_hour < starter.requests_per_hour);
        assert!(starter.bandwidth_bytes < pro.bandwidth_bytes);
    }

    #[test]
    fn test_only_trial_is_trial() {
        assert!(Plan::Trial.is_trial());
        assert!(!Plan::Starter.is_trial());
        assert!(!Plan::Pro.is_trial());
        assert_eq!(Plan::Pro.as_str(), "pro");
    }

    #[test]
    fn test_plan_parses_case_insensitively() {
        assert_eq!("Starter".parse::<Plan>(), Ok(Plan::Starter));
        assert_eq!("pro".parse::<Plan>(), Ok(Plan::Pro));
        assert!("enterprise".parse::<Plan>().is_err());
    }
}
