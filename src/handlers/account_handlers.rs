//! Key issuance and usage reporting.

use crate::{
    errors::AppError,
    models::account::{Account, Plan, PlanLimits},
    services::usage_reporter::UsageReport,
    state::AppState,
};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct IssuedKey {
    pub api_key: String,
    pub plan: Plan,
    pub limits: PlanLimits,
}

/// `GET /key` - create a trial account and return its key once.
pub async fn issue_key(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let account = state.keys.issue_trial_key().await?;
    Ok((
        StatusCode::CREATED,
        Json(IssuedKey {
            limits: account.limits(),
            plan: account.plan,
            api_key: account.api_key,
        }),
    ))
}

/// `GET /stats`
pub async fn usage_stats(
    State(state): State<AppState>,
    Extension(account): Extension<Account>,
) -> Result<Json<UsageReport>, AppError> {
    Ok(Json(state.usage.report(&account).await?))
}
