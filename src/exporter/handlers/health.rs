use crate::{exporter::GIT_COMMIT_HASH, reconciler::Status};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    generation: u64,
    targets: Vec<String>,
}

impl From<&Status> for Health {
    fn from(status: &Status) -> Self {
        Self {
            commit: GIT_COMMIT_HASH.to_string(),
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            generation: status.generation,
            targets: status.targets.clone(),
        }
    }
}

// Create response body based on method
fn create_response_body(method: &Method, health: &Health) -> Body {
    if method == Method::GET {
        Json(health).into_response().into_body()
    } else {
        Body::empty()
    }
}

// Create X-App header
fn create_app_headers(health: &Health) -> HeaderMap {
    let short_hash = health.commit.get(0..7).unwrap_or("");

    let header_value = format!("{}:{}:{}", health.name, health.version, short_hash);

    match header_value.parse::<HeaderValue>() {
        Ok(x_app_header_value) => {
            let mut headers = HeaderMap::new();
            headers.insert("X-App", x_app_header_value);
            headers
        }
        Err(err) => {
            debug!("Failed to parse X-App header: {}", err);
            HeaderMap::new()
        }
    }
}

// Main axum handler for health
pub async fn health(
    method: Method,
    Extension(status): Extension<watch::Receiver<Status>>,
) -> impl IntoResponse {
    let status = status.borrow().clone();
    let health = Health::from(&status);
    let body = create_response_body(&method, &health);
    let headers = create_app_headers(&health);

    if status.is_ready() {
        (StatusCode::OK, headers, body)
    } else {
        debug!("no configuration applied yet");
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}
