//! Connector manifests from configuration through to the router.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{body_json, empty_request, json_request, TestApp};
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use mervo_api::Config;
use mervo_delivery::DeliveryQueue;
use serde_json::json;
use tower::ServiceExt;

const CONNECTORS_TOML: &str = r#"
[[connectors]]
id = "slack-notifier"
key = "slack_notifier"
name = "Slack Notifier"
description = "Posts notifications to Slack"
supported_events = ["job.created", "job.completed"]

[[connectors]]
id = "google-drive"
name = "Google Drive Export"
required_permissions = ["drive.write"]
supported_events = ["job.completed"]
"#;

fn config_with_connectors() -> Result<Config> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::string(CONNECTORS_TOML));
    Config::from_figment(&figment)
}

#[tokio::test]
async fn configured_connectors_are_listed() -> Result<()> {
    let test_app = TestApp::configured(&config_with_connectors()?).await?;

    let response = test_app.router().oneshot(empty_request("GET", "/connectors")?).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let listed = body_json(response).await?;
    let listed = listed.as_array().expect("connector list");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["id"], "google-drive");
    assert_eq!(listed[0]["required_permissions"], json!(["drive.write"]));
    assert!(listed[0].get("key").is_none());
    assert_eq!(listed[1]["id"], "slack-notifier");
    assert_eq!(listed[1]["key"], "slack_notifier");
    assert_eq!(listed[1]["supported_events"], json!(["job.created", "job.completed"]));
    Ok(())
}

#[tokio::test]
async fn no_configured_connectors_lists_empty() -> Result<()> {
    let test_app = TestApp::configured(&Config::default()).await?;

    let response = test_app.router().oneshot(empty_request("GET", "/connectors")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?, json!([]));
    Ok(())
}

#[tokio::test]
async fn configured_connector_gates_enqueue_by_id_or_key() -> Result<()> {
    let test_app = TestApp::configured(&config_with_connectors()?).await?;
    let app = test_app.router();

    for connector_id in ["slack-notifier", "slack_notifier"] {
        let body = json!({
            "url": "https://example.com/hook",
            "payload": {"job": 1},
            "connector_id": connector_id,
            "event_type": "job.created",
        });
        let response = app.clone().oneshot(json_request("POST", "/deliveries", &body)?).await?;
        assert_eq!(response.status(), StatusCode::CREATED, "{connector_id}");
    }

    let refused = json!({
        "url": "https://example.com/hook",
        "payload": {},
        "connector_id": "google-drive",
        "event_type": "job.created",
    });
    let response = app.oneshot(json_request("POST", "/deliveries", &refused)?).await?;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await?["error"]["code"], "E1005");

    assert_eq!(test_app.queue.list(None, 10).await?.len(), 2);
    Ok(())
}
