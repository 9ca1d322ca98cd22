//! Core data models for the image usage service.
//!
//! These entities map to database tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`.

pub mod account;
pub mod bandwidth;
pub mod object;
