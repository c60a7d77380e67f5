use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{debug, error};

const CONTENT_TYPE_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

// Render every family in the text exposition format
fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub async fn metrics(Extension(registry): Extension<Registry>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_TEXT));

    match render(&registry) {
        Ok(body) => {
            debug!(bytes = body.len(), "rendered metrics");
            (StatusCode::OK, headers, body)
        }
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("Error encoding metrics: {e}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricEvent, MetricSink, TargetLabels};

    #[test]
    fn test_render() -> Result<(), prometheus::Error> {
        let registry = Registry::new();
        let sink = MetricSink::new("sql", "exporter")?;
        sink.register(&registry)?;

        assert_eq!(render(&registry)?, "");

        sink.set(&MetricEvent::Up {
            labels: TargetLabels::new("db1", "orders"),
            value: 1.0,
        });

        let body = render(&registry)?;
        assert!(body.contains("# TYPE sql_exporter_up gauge"));
        assert!(body.contains(r#"sql_exporter_up{database="orders",id="db1"} 1"#));
        Ok(())
    }
}
