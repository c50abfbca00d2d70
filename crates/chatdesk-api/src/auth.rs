//! Operator identity and shared handler state
//!
//! Authentication happens in front of this service; the API only records
//! which operator performed a review action.

use axum::{extract::Request, middleware::Next, response::Response};
use chatdesk_common::types::OperatorId;
use chatdesk_core::BlastEngine;
use chatdesk_storage::DatabasePool;
use std::sync::Arc;
use tracing::debug;

/// Header naming the operator behind a request
pub const OPERATOR_HEADER: &str = "x-operator-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BlastEngine>,
    /// Present when running against Postgres; used by readiness checks
    pub db_pool: Option<DatabasePool>,
}

/// Operator extracted from the request headers
#[derive(Debug, Clone, Default)]
pub struct OperatorContext {
    pub operator: OperatorId,
}

/// Read the operator header, falling back to the anonymous operator
pub fn extract_operator(req: &Request) -> OperatorId {
    req.headers()
        .get(OPERATOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(OperatorId::new)
        .unwrap_or_default()
}

/// Attach an [`OperatorContext`] to every request
pub async fn operator_middleware(mut request: Request, next: Next) -> Response {
    let operator = extract_operator(&request);
    debug!(operator = %operator, path = %request.uri().path(), "Operator request");
    request.extensions_mut().insert(OperatorContext { operator });
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(header: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/api/v1/campaigns");
        if let Some(value) = header {
            builder = builder.header(OPERATOR_HEADER, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_operator_header_is_used() {
        assert_eq!(extract_operator(&request(Some("ana"))).as_str(), "ana");
    }

    #[test]
    fn test_missing_or_blank_header_is_anonymous() {
        assert_eq!(extract_operator(&request(None)).as_str(), OperatorId::ANONYMOUS);
        assert_eq!(extract_operator(&request(Some("  "))).as_str(), OperatorId::ANONYMOUS);
    }
}
