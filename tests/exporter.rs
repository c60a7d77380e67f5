use anyhow::Result;
use query_exporter::{
    app::Settings,
    exporter,
    metrics::MetricEvent,
    pool::ColumnValue,
    reconciler::{Reconciler, Status},
};
use serde_json::Value;
use tokio::sync::watch;

mod common;

use common::FakeDatabase;

#[tokio::test]
async fn test_metrics_endpoint() -> Result<()> {
    let (ctx, _writer) = common::context(Settings::default());
    ctx.emitter
        .emit(MetricEvent::QueryValue {
            labels: common::column("db1", "orders", "rowcount", "n"),
            value: 42.0,
        })
        .await;
    ctx.emitter.flush().await;

    let (_tx, status) = watch::channel(Status::default());
    let port = common::get_available_port();
    let registry = ctx.registry.clone();

    let handle = tokio::spawn(async move {
        exporter::new(port, Some("127.0.0.1".to_string()), registry, status).await
    });

    assert!(
        common::wait_for_server(port, 50).await,
        "Server failed to start on port {port}"
    );

    let response = reqwest::get(format!("{}/metrics", common::get_test_url(port))).await?;

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/plain; version=0.0.4; charset=utf-8")
    );
    assert!(response.headers().contains_key("x-request-id"));

    let body = response.text().await?;
    assert!(body.contains(
        r#"sql_exporter_query_value{column="n",database="orders",id="db1",query="rowcount"} 42"#
    ));

    handle.abort();

    Ok(())
}

#[tokio::test]
async fn test_health_before_and_after_first_generation() -> Result<()> {
    let db = FakeDatabase::new();
    db.returns(
        "select 1 as one",
        common::rows(&["one"], vec![vec![ColumnValue::Int(1)]]),
    );

    let (ctx, _writer) = common::context(Settings::default());
    let mut reconciler = Reconciler::new(&ctx, db.connector());

    let port = common::get_available_port();
    let registry = ctx.registry.clone();
    let status = reconciler.subscribe();

    let handle = tokio::spawn(async move {
        exporter::new(port, Some("127.0.0.1".to_string()), registry, status).await
    });

    assert!(common::wait_for_server(port, 50).await);

    let url = format!("{}/health", common::get_test_url(port));
    let client = reqwest::Client::new();

    let response = client.get(&url).send().await?;
    assert_eq!(response.status(), 503);

    reconciler
        .reconcile(
            "- id: db1\n  database: orders\n",
            "- id: db1\n  queries:\n    - {name: one, sql: select 1 as one}\n",
        )
        .await?;

    let response = client.get(&url).send().await?;
    assert_eq!(response.status(), 200);

    let x_app = response
        .headers()
        .get("x-app")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_default();
    assert!(x_app.starts_with(&format!(
        "{}:{}:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )));

    let body: Value = response.json().await?;
    assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["generation"], 1);
    assert_eq!(body["targets"], serde_json::json!(["db1"]));
    assert!(body["commit"].is_string());

    let response = client
        .request(reqwest::Method::OPTIONS, &url)
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert!(response.text().await?.is_empty());

    handle.abort();

    Ok(())
}

#[tokio::test]
async fn test_invalid_listen_address() {
    let (ctx, _writer) = common::context(Settings::default());
    let (_tx, status) = watch::channel(Status::default());

    let result = exporter::new(
        common::get_available_port(),
        Some("not-an-ip".to_string()),
        ctx.registry.clone(),
        status,
    )
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_unknown_route() -> Result<()> {
    let (ctx, _writer) = common::context(Settings::default());
    let (_tx, status) = watch::channel(Status::default());
    let port = common::get_available_port();
    let registry = ctx.registry.clone();

    let handle = tokio::spawn(async move {
        exporter::new(port, Some("127.0.0.1".to_string()), registry, status).await
    });

    assert!(common::wait_for_server(port, 50).await);

    let response = reqwest::get(format!("{}/nope", common::get_test_url(port))).await?;
    assert_eq!(response.status(), 404);

    handle.abort();

    Ok(())
}
