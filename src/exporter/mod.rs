use crate::reconciler::Status;
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::{Next, from_fn},
    response::Response,
    routing::get,
};
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TraceId};
use opentelemetry_http::HeaderExtractor;
use prometheus::Registry;
use std::time::Duration;
use tokio::{net::TcpListener, sync::watch};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, error, info, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use ulid::Ulid;

mod handlers;
mod shutdown;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = if let Some(hash) = built_info::GIT_COMMIT_HASH {
    hash
} else {
    ":-("
};

/// Build the HTTP router serving `/metrics` and `/health`.
pub fn router(registry: Registry, status: watch::Receiver<Status>) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(make_span)
        .on_response(on_response);

    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health).options(handlers::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(trace_layer)
                .layer(from_fn(add_trace_headers))
                .layer(Extension(registry))
                .layer(Extension(status)),
        )
}

async fn bind(port: u16, listen: Option<&str>) -> Result<(TcpListener, String)> {
    match listen {
        Some(addr) => {
            // Try to parse as IpAddr to validate and determine type
            let ip = addr.parse::<std::net::IpAddr>().map_err(|_| {
                anyhow!(
                    "Invalid IP address: '{addr}'. Expected IPv4 (e.g., 0.0.0.0, 127.0.0.1) or IPv6 (e.g., ::, ::1)"
                )
            })?;

            let bind_addr = std::net::SocketAddr::new(ip, port);
            let listener = TcpListener::bind(bind_addr)
                .await
                .with_context(|| format!("Failed to bind to {bind_addr}"))?;

            Ok((listener, bind_addr.to_string()))
        }
        None => {
            // Auto: try IPv6 first, fallback to IPv4
            match TcpListener::bind(format!("[::]:{port}")).await {
                Ok(l) => Ok((l, format!("[::]:{port}"))),
                // If IPv6 fails, fall back to binding to IPv4 address
                Err(_) => Ok((
                    TcpListener::bind(format!("0.0.0.0:{port}"))
                        .await
                        .with_context(|| format!("Failed to bind to 0.0.0.0:{port}"))?,
                    format!("0.0.0.0:{port}"),
                )),
            }
        }
    }
}

/// Serve the exporter until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the listen address is invalid or cannot be bound.
pub async fn new(
    port: u16,
    listen: Option<String>,
    registry: Registry,
    status: watch::Receiver<Status>,
) -> Result<()> {
    let (listener, bind_addr) = bind(port, listen.as_deref()).await?;

    let targets = status.borrow().targets.clone();

    println!(
        "{} {} - Listening on {bind_addr}\n\nConfigured targets:\n{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        format_list(&targets),
    );

    let app = router(registry, status);

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await
    {
        error!(error=%e, "server error");
    }

    info!("http server stopped");

    Ok(())
}

// Helper to format a list of items with a leading dash and indentation for the
// start up message
fn format_list<T: std::fmt::Display>(items: &[T]) -> String {
    if items.is_empty() {
        return "  (none)".to_string();
    }

    items
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn make_span(request: &Request<Body>) -> Span {
    let parent_cx =
        global::get_text_map_propagator(|prop| prop.extract(&HeaderExtractor(request.headers())));

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none");

    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let span = info_span!(
        "http.server.request",
        otel.kind = "server",
        otel.status_code = tracing::field::Empty,
        http.method = request.method().as_str(),
        http.route = request.uri().path(),
        http.target = %request.uri(),
        http.scheme = request.uri().scheme_str().unwrap_or("http"),
        http.user_agent = user_agent,
        request_id = request_id,
    );

    let _ = span.set_parent(parent_cx);

    span
}

fn on_response<B>(response: &axum::http::Response<B>, latency: Duration, span: &Span) {
    if response.status().is_server_error() {
        span.record("otel.status_code", "ERROR");
    } else {
        span.record("otel.status_code", "OK");
    }

    let elapsed_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
    let trace_id = span.context().span().span_context().trace_id();

    if trace_id == TraceId::INVALID {
        info!(
            parent: span,
            status = response.status().as_u16(),
            elapsed_ms,
            "request completed"
        );
    } else {
        info!(
            parent: span,
            status = response.status().as_u16(),
            elapsed_ms,
            trace_id = %trace_id,
            "request completed"
        );
    }
}

async fn add_trace_headers(req: Request<Body>, next: Next) -> Response {
    let mut res = next.run(req).await;

    // CLONE the SpanContext to avoid borrowing a temporary
    let span_context = Span::current().context().span().span_context().clone();

    if span_context.is_valid()
        && let Ok(val) = HeaderValue::from_str(&span_context.trace_id().to_string())
    {
        res.headers_mut()
            .insert(HeaderName::from_static("x-trace-id"), val);
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_exists() {
        // GIT_COMMIT_HASH is a compile-time constant, either a git hash or ":-("
        assert!(GIT_COMMIT_HASH.len() >= 3);

        // It should be either a hex string (git hash) or the fallback
        let is_hex = GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit());
        let is_fallback = GIT_COMMIT_HASH == ":-(";
        assert!(is_hex || is_fallback);
    }

    #[test]
    fn test_format_list_empty() {
        let items: Vec<String> = vec![];
        assert_eq!(format_list(&items), "  (none)");
    }

    #[test]
    fn test_format_list_multiple_items() {
        let items = vec!["db1", "db2"];
        // Each item on its own line, indented with a leading dash
        assert_eq!(format_list(&items), "  - db1\n  - db2");
    }

    // Test the on_response function behavior
    #[test]
    fn test_on_response_status_codes() {
        use axum::http::{Response, StatusCode};

        let span = info_span!("test", otel.status_code = tracing::field::Empty);
        let latency = Duration::from_millis(100);

        let ok = Response::builder()
            .status(StatusCode::OK)
            .body(())
            .expect("response");
        // This should not panic
        on_response(&ok, latency, &span);

        let err = Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(())
            .expect("response");
        on_response(&err, latency, &span);
    }

    #[test]
    fn test_make_span_creates_span() {
        let request = Request::builder()
            .method("GET")
            .uri("/metrics")
            .header("user-agent", "test-client")
            .header("x-request-id", "01J0000000000000000000000")
            .body(Body::empty())
            .expect("request");

        let span = make_span(&request);

        // Verify span was created with correct metadata
        assert_eq!(
            span.metadata().map(|m| m.name()),
            Some("http.server.request")
        );
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_ip() {
        let result = bind(0, Some("not-an-ip")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bind_ipv4_loopback() -> Result<()> {
        let (listener, addr) = bind(0, Some("127.0.0.1")).await?;
        assert_eq!(addr, "127.0.0.1:0");
        assert!(listener.local_addr()?.ip().is_loopback());
        Ok(())
    }
}
