//! Chatdesk API - REST surface for blast campaigns
//!
//! Operators create campaigns, review generated messages and steer delivery
//! through these endpoints. Every handler delegates to the blast engine.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;

pub use auth::{AppState, OperatorContext};
pub use error::{ApiError, ErrorResponse};
pub use routes::create_router;
