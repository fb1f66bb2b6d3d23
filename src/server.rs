//! Gitclaim HTTP server
//!
//! Webhook intake plus the small bounty API used by the web frontend.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::CollaboratorError;
use crate::model::{Bounty, NewBounty};
use crate::repository::BountyRepository;
use crate::router::{EventEnvelope, EventRouter};
use crate::upload::JsonUploader;

pub struct AppState {
    pub events: EventRouter,
    pub repository: Arc<dyn BountyRepository>,
    pub uploader: Arc<dyn JsonUploader>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        events: EventRouter,
        repository: Arc<dyn BountyRepository>,
        uploader: Arc<dyn JsonUploader>,
    ) -> Self {
        Self {
            events,
            repository,
            uploader,
            started_at: Instant::now(),
        }
    }
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn create_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/github/webhook", post(webhook_handler))
        .route(
            "/github/bounties",
            get(list_bounties_handler).post(create_bounty_handler),
        )
        .route("/upload", post(upload_handler))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Localhost on any port plus the configured origins.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<String> = origins
        .iter()
        .map(|o| o.trim_end_matches('/').to_string())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _| {
                let Ok(origin) = origin.to_str() else {
                    return false;
                };
                is_localhost(origin) || allowed.iter().any(|a| a == origin)
            },
        ))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

fn is_localhost(origin: &str) -> bool {
    let host = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    host == "localhost" || host == "127.0.0.1"
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub uptime_secs: u64,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> (StatusCode, &'static str) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let event_type = header("X-GitHub-Event");
    info!(
        "Received {} webhook (delivery {})",
        event_type,
        header("X-GitHub-Delivery")
    );

    let envelope = EventEnvelope::new(event_type, payload);
    match state.events.route(&envelope).await {
        Ok(_) => (StatusCode::OK, "Event received"),
        Err(e) => {
            error!("Error processing {} event: {}", envelope.event_type, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Error processing event")
        }
    }
}

async fn create_bounty_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewBounty>,
) -> Result<(StatusCode, Json<Bounty>), ApiError> {
    let bounty = request
        .into_bounty()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    let existing = state
        .repository
        .find_by_issue(&bounty.repo, bounty.issue)
        .await
        .map_err(|e| {
            error!("Failed to look up bounty: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create bounty")
        })?;
    if existing.is_some() {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("a bounty for {} already exists", bounty.issue_url()),
        ));
    }

    state.repository.create(&bounty).await.map_err(|e| {
        error!("Failed to create bounty: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create bounty")
    })?;
    info!(
        "Bounty {} created for {} ({} {})",
        bounty.id,
        bounty.issue_url(),
        bounty.amount,
        bounty.coin
    );
    Ok((StatusCode::CREATED, Json(bounty)))
}

#[derive(Debug, Deserialize)]
pub struct ListBountiesQuery {
    #[serde(rename = "bountyOwner")]
    pub bounty_owner: Option<String>,
}

async fn list_bounties_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListBountiesQuery>,
) -> Result<Json<Vec<Bounty>>, ApiError> {
    let owner = query.bounty_owner.as_deref().filter(|o| !o.is_empty());
    state.repository.list(owner).await.map(Json).map_err(|e| {
        error!("Failed to list bounties: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list bounties")
    })
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Json(document): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if !document.is_object() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "expected a JSON object",
        ));
    }
    match state.uploader.store(&document).await {
        Ok(url) => Ok(Json(json!({ "url": url }))),
        Err(CollaboratorError::Config(msg)) => {
            warn!("Upload unavailable: {}", msg);
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, msg))
        }
        Err(e) => {
            error!("Upload failed: {}", e);
            Err(api_error(StatusCode::BAD_GATEWAY, "Upload failed"))
        }
    }
}

/// Run the server
pub async fn run_server(config: &ServerConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state, &config.cors_origins);
    let addr = format!("{}:{}", config.host, config.port);

    info!("Starting gitclaim server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::PullRequestLinker;
    use crate::notification::NotificationGateway;
    use crate::pipeline::{PipelineSettings, ProofPipeline, ProofQueue};
    use crate::storage::SqliteBountyRepository;
    use crate::verifier::{ProofVerifier, VerificationOutcome};
    use crate::webproof::WebProofFetcher;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Offline;

    #[async_trait]
    impl JsonUploader for Offline {
        async fn store(&self, data: &Value) -> Result<String, CollaboratorError> {
            if data.get("fail").is_some() {
                return Err(CollaboratorError::Config("no key".to_string()));
            }
            Ok("https://gateway.example/ipfs/cid".to_string())
        }
    }

    #[async_trait]
    impl WebProofFetcher for Offline {
        async fn fetch(&self, _locator: &str) -> Result<Value, CollaboratorError> {
            Err(CollaboratorError::NoProof("offline".to_string()))
        }
    }

    #[async_trait]
    impl ProofVerifier for Offline {
        async fn verify(
            &self,
            _locator: &str,
            _prover: &str,
            _verifier: &str,
            _proof: &Value,
        ) -> Result<VerificationOutcome, CollaboratorError> {
            Err(CollaboratorError::InvalidResponse("offline".to_string()))
        }
    }

    #[async_trait]
    impl NotificationGateway for Offline {
        async fn post_comment(
            &self,
            _repo: &str,
            _thread_number: u64,
            _body: &str,
        ) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    fn app() -> Router {
        let repository: Arc<dyn BountyRepository> =
            Arc::new(SqliteBountyRepository::in_memory().unwrap());
        let offline = Arc::new(Offline);
        let pipeline = Arc::new(ProofPipeline::new(
            repository.clone(),
            offline.clone(),
            offline.clone(),
            offline.clone(),
            offline.clone(),
            PipelineSettings::default(),
        ));
        let (queue, _jobs) = ProofQueue::new();
        let linker = Arc::new(PullRequestLinker::new(
            repository.clone(),
            offline.clone(),
            pipeline,
            Arc::new(queue),
        ));
        let state = Arc::new(AppState::new(
            EventRouter::new(linker),
            repository,
            offline,
        ));
        create_router(state, &["https://gitclaim.axlabs.com".to_string()])
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn bounty_request(coin: Option<&str>) -> Value {
        let mut request = json!({
            "repo": "https://github.com/acme/widget",
            "issue": 42,
            "amount": 50.0,
            "chain_id": "8453",
            "bountyOwner": "funder",
            "languages": [{ "language": "Rust", "percentage": 100.0 }]
        });
        if let Some(coin) = coin {
            request["coin"] = json!(coin);
        }
        request
    }

    #[tokio::test]
    async fn test_create_and_list_bounties() {
        let app = app();

        let response = app
            .clone()
            .oneshot(post_json("/github/bounties", bounty_request(None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post_json("/github/bounties", bounty_request(Some("USDC"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["bountyOwner"], "funder");
        assert_eq!(created["status"], "open");

        let response = app
            .clone()
            .oneshot(post_json("/github/bounties", bounty_request(Some("USDC"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/github/bounties?bountyOwner=FUNDER")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/github/bounties?bountyOwner=someone-else")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(body_json(response).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_acknowledges_known_and_unknown_events() {
        let app = app();
        for event in ["push", "pull_request"] {
            let mut request = post_json("/github/webhook", json!({ "action": "labeled" }));
            request
                .headers_mut()
                .insert("X-GitHub-Event", HeaderValue::from_static(event));
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_upload_returns_locator() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json("/upload", json!({ "hello": "world" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await["url"],
            "https://gateway.example/ipfs/cid"
        );

        let response = app
            .oneshot(post_json("/upload", json!({ "fail": true })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cors_allows_localhost_and_configured_origins() {
        let app = app();
        for (origin, allowed) in [
            ("http://localhost:3000", true),
            ("https://gitclaim.axlabs.com", true),
            ("https://evil.example", false),
        ] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri("/health")
                        .header("Origin", origin)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(
                response
                    .headers()
                    .contains_key("access-control-allow-origin"),
                allowed,
                "{}",
                origin
            );
        }
    }
}
