//! API routes

use axum::{
    http::HeaderValue,
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{operator_middleware, AppState};
use crate::handlers::{campaigns, health, recipients};

/// Create the API router
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    let state = Arc::new(state);

    // Health check routes
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness))
        .with_state(state.clone());

    // Campaign routes
    let campaign_routes = Router::new()
        .route(
            "/",
            get(campaigns::list_campaigns).post(campaigns::create_campaign),
        )
        .route(
            "/:campaign_id",
            get(campaigns::get_campaign)
                .put(campaigns::update_campaign)
                .delete(campaigns::delete_campaign),
        )
        .route("/:campaign_id/start", post(campaigns::start_campaign))
        .route("/:campaign_id/pause", post(campaigns::pause_campaign))
        .route("/:campaign_id/cancel", post(campaigns::cancel_campaign))
        .route("/:campaign_id/schedule", post(campaigns::schedule_campaign))
        .route("/:campaign_id/generate", post(campaigns::generate_batch))
        .route("/:campaign_id/preview", post(campaigns::preview_message))
        .route("/:campaign_id/stats", get(campaigns::get_campaign_stats))
        .route("/:campaign_id/queue", get(campaigns::get_queue))
        .route("/:campaign_id/recipients", get(campaigns::list_recipients));

    // Recipient review routes
    let recipient_routes = Router::new()
        .route("/:recipient_id/approve", post(recipients::approve_recipient))
        .route("/:recipient_id/edit", post(recipients::edit_recipient))
        .route("/:recipient_id/skip", post(recipients::skip_recipient))
        .route(
            "/:recipient_id/regenerate",
            post(recipients::regenerate_recipient),
        )
        .route("/:recipient_id/retry", post(recipients::retry_recipient))
        .route("/:recipient_id/schedule", put(recipients::schedule_recipient));

    // API v1 routes carry the operator identity
    let api_v1 = Router::new()
        .nest("/campaigns", campaign_routes)
        .nest("/recipients", recipient_routes)
        .layer(middleware::from_fn(operator_middleware))
        .with_state(state.clone());

    // Prometheus scrape endpoint
    let metrics_routes = Router::new()
        .route("/", get(health::metrics))
        .with_state(state);

    Router::new()
        .nest("/health", health_routes)
        .nest("/metrics", metrics_routes)
        .nest("/api/v1", api_v1)
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        return CorsLayer::new();
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorResponse;
    use crate::handlers::campaigns::{CampaignListResponse, CampaignResponse, PreviewResponse};
    use crate::handlers::recipients::RecipientResponse;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use chatdesk_common::types::ContactId;
    use chatdesk_common::Result;
    use chatdesk_core::{
        BlastEngine, BlastMetrics, ChannelAdapter, ContactContext, EngineContext, EngineSettings,
        OutboundMessage, TextGenerator,
    };
    use chatdesk_storage::{
        CampaignStatus, ContactDirectory, CreateContact, MemoryStore, RecipientStatus,
    };
    use pretty_assertions::assert_eq;
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct EchoGenerator;

    #[async_trait]
    impl TextGenerator for EchoGenerator {
        async fn generate(&self, _prompt: &str, contact: &ContactContext) -> Result<String> {
            Ok(format!("Hello {}", contact.name))
        }
    }

    struct NullChannel;

    #[async_trait]
    impl ChannelAdapter for NullChannel {
        async fn send(&self, message: &OutboundMessage) -> Result<String> {
            Ok(format!("msg-{}", message.recipient_id))
        }
    }

    struct TestResponse {
        status: StatusCode,
        body: Vec<u8>,
    }

    impl TestResponse {
        fn json<T: DeserializeOwned>(&self) -> T {
            serde_json::from_slice(&self.body).unwrap()
        }

        fn text(&self) -> String {
            String::from_utf8(self.body.clone()).unwrap()
        }
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        operator: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(operator) = operator {
            builder = builder.header(crate::auth::OPERATOR_HEADER, operator);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        TestResponse {
            status,
            body: body.to_vec(),
        }
    }

    async fn app(contacts: usize) -> (Router, Vec<ContactId>) {
        let store = Arc::new(MemoryStore::new());
        let mut ids = Vec::new();
        for i in 0..contacts {
            let contact = ContactDirectory::create(
                store.as_ref(),
                CreateContact {
                    name: format!("Contact {}", i + 1),
                    phone: Some(format!("+4915100000{:02}", i)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            ids.push(contact.id);
        }

        let ctx = EngineContext::new(
            store.clone(),
            store.clone(),
            store,
            Arc::new(EchoGenerator),
            Arc::new(NullChannel),
            BlastMetrics::new().unwrap(),
            EngineSettings::default(),
        );
        let state = AppState {
            engine: Arc::new(BlastEngine::new(ctx)),
            db_pool: None,
        };

        (create_router(state, &[]), ids)
    }

    async fn create_campaign(app: &Router, contacts: &[ContactId]) -> CampaignResponse {
        let response = call(
            app,
            Method::POST,
            "/api/v1/campaigns",
            None,
            Some(json!({
                "name": "Spring promo",
                "prompt": "Mention the spring sale",
                "contact_ids": contacts,
                "min_interval_secs": 1,
                "max_interval_secs": 3,
            })),
        )
        .await;
        assert_eq!(response.status, StatusCode::CREATED);
        response.json::<CampaignResponse>()
    }

    #[tokio::test]
    async fn test_create_and_get_campaign() {
        let (app, contacts) = app(3).await;
        let created = create_campaign(&app, &contacts).await;
        assert_eq!(created.status, CampaignStatus::Draft);
        assert_eq!(created.total_recipients, 3);
        assert_eq!(created.created_by.as_deref(), Some("operator"));

        let fetched = call(
            &app,
            Method::GET,
            &format!("/api/v1/campaigns/{}", created.id),
            None,
            None,
        )
        .await
        .json::<CampaignResponse>();
        assert_eq!(fetched.id, created.id);

        let list = call(&app, Method::GET, "/api/v1/campaigns?status=draft", None, None)
            .await
            .json::<CampaignListResponse>();
        assert_eq!(list.total, 1);
        assert_eq!(list.data.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_and_not_found_errors() {
        let (app, _) = app(0).await;

        let response = call(
            &app,
            Method::POST,
            "/api/v1/campaigns",
            None,
            Some(json!({"name": "Empty", "prompt": "Hi", "contact_ids": []})),
        )
        .await;
        assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.json::<ErrorResponse>().error, "validation_error");

        let response = call(
            &app,
            Method::GET,
            &format!("/api/v1/campaigns/{}", uuid::Uuid::now_v7()),
            None,
            None,
        )
        .await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        let response = call(&app, Method::GET, "/api/v1/campaigns?status=sending", None, None).await;
        assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_conflict() {
        let (app, contacts) = app(1).await;
        let campaign = create_campaign(&app, &contacts).await;

        let response = call(
            &app,
            Method::POST,
            &format!("/api/v1/campaigns/{}/pause", campaign.id),
            None,
            None,
        )
        .await;
        assert_eq!(response.status, StatusCode::CONFLICT);
        let body = response.json::<ErrorResponse>();
        assert_eq!(body.error, "invalid_transition");
        assert_eq!(body.message, "Cannot pause campaign in status 'draft'");
    }

    #[tokio::test]
    async fn test_generate_review_and_approve() {
        let (app, contacts) = app(2).await;
        let campaign = create_campaign(&app, &contacts).await;

        let report = call(
            &app,
            Method::POST,
            &format!("/api/v1/campaigns/{}/generate", campaign.id),
            None,
            Some(json!({"batch_size": 5})),
        )
        .await
        .json::<Value>();
        assert_eq!(report["generated"], 2);

        let queue = call(
            &app,
            Method::GET,
            &format!("/api/v1/campaigns/{}/queue", campaign.id),
            None,
            None,
        )
        .await
        .json::<Value>();
        assert_eq!(queue["awaiting_review"], 2);
        let recipient_id = queue["recipients"][0]["id"].as_str().unwrap().to_string();

        let approved = call(
            &app,
            Method::POST,
            &format!("/api/v1/recipients/{}/approve", recipient_id),
            Some("ana"),
            Some(json!({"override_text": "Hello from Ana"})),
        )
        .await
        .json::<RecipientResponse>();
        assert_eq!(approved.status, RecipientStatus::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("ana"));
        assert_eq!(approved.final_text.as_deref(), Some("Hello from Ana"));

        // Approving twice is rejected
        let response = call(
            &app,
            Method::POST,
            &format!("/api/v1/recipients/{}/approve", recipient_id),
            None,
            None,
        )
        .await;
        assert_eq!(response.status, StatusCode::CONFLICT);

        let approved_only = call(
            &app,
            Method::GET,
            &format!("/api/v1/campaigns/{}/recipients?status=approved", campaign.id),
            None,
            None,
        )
        .await
        .json::<Vec<RecipientResponse>>();
        assert_eq!(approved_only.len(), 1);
    }

    #[tokio::test]
    async fn test_preview_does_not_persist() {
        let (app, contacts) = app(1).await;
        let campaign = create_campaign(&app, &contacts).await;

        let preview = call(
            &app,
            Method::POST,
            &format!("/api/v1/campaigns/{}/preview", campaign.id),
            None,
            Some(json!({"contact_id": contacts[0]})),
        )
        .await
        .json::<PreviewResponse>();
        assert_eq!(preview.text, "Hello Contact 1");

        let stats = call(
            &app,
            Method::GET,
            &format!("/api/v1/campaigns/{}/stats", campaign.id),
            None,
            None,
        )
        .await
        .json::<Value>();
        assert_eq!(stats["counts"]["pending"], 1);
        assert_eq!(stats["campaign"]["generated_count"], 0);
    }

    #[tokio::test]
    async fn test_delete_draft_campaign() {
        let (app, contacts) = app(1).await;
        let campaign = create_campaign(&app, &contacts).await;
        let uri = format!("/api/v1/campaigns/{}", campaign.id);

        let response = call(&app, Method::DELETE, &uri, None, None).await;
        assert_eq!(response.status, StatusCode::NO_CONTENT);

        let response = call(&app, Method::GET, &uri, None, None).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (app, _) = app(0).await;

        let response = call(&app, Method::GET, "/health", None, None).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.json::<Value>()["status"], "healthy");

        let response = call(&app, Method::GET, "/health/ready", None, None).await;
        assert_eq!(response.status, StatusCode::OK);

        let response = call(&app, Method::GET, "/metrics", None, None).await;
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.text().contains("chatdesk_blast_active_pacers"));
    }
}
