//! Defines routes for the image API.
//!
//! ## Structure
//! - **Public**
//!   - `GET    /healthz`, `GET /readyz` - probes
//!   - `GET    /i/{id}.{ext}` - serve an image
//!
//! - **Per-address limited**
//!   - `GET    /key` - issue a trial key
//!
//! - **Authenticated, per-account limited**
//!   - `POST   /upload` - upload an image (raw body)
//!   - `GET    /files` - list own images
//!   - `GET    /stats` - usage summary
//!   - `DELETE /i/{id}` - soft-delete an image

use crate::{
    handlers::{
        account_handlers::{issue_key, usage_stats},
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, list_objects, serve_object, upload_object},
    },
    middleware::rate_limit::{account_gate, ip_gate},
    state::AppState,
};
use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};

/// Build the full router. Each group carries its own admission gate.
pub fn routes(state: AppState) -> Router {
    let public = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/i/{file}", get(serve_object));

    let key_issuance = Router::new()
        .route("/key", get(issue_key))
        .route_layer(from_fn_with_state(state.clone(), ip_gate));

    let authenticated = Router::new()
        .route("/upload", post(upload_object))
        .route("/files", get(list_objects))
        .route("/stats", get(usage_stats))
        .route("/i/{file}", delete(delete_object))
        .route_layer(from_fn_with_state(state.clone(), account_gate));

    Router::new()
        .merge(public)
        .merge(key_issuance)
        .merge(authenticated)
        .with_state(state)
}
