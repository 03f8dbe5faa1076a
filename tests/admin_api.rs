//! HTTP tests for the management API

mod common;

use common::*;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use socks5_server_r::config::ServerConfig;
use socks5_server_r::App;
use std::time::Duration;

struct TestApi {
    app: App,
    base_url: String,
    client: Client,
}

impl TestApi {
    async fn start(token: Option<&str>) -> Self {
        let app = start(app_config(ServerConfig::default(), token)).await;
        let base_url = format!("http://{}", app.admin_addr());
        Self {
            app,
            base_url,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }
}

#[tokio::test]
async fn test_ping_and_stats() {
    let api = TestApi::start(None).await;

    let (status, body) = api.get("/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "msg": "pong" }));

    let (status, body) = api.get("/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    for key in [
        "connections",
        "totalConnections",
        "uptime",
        "startTime",
        "status",
        "rejectedAuth",
        "bytesIn",
        "bytesOut",
    ] {
        assert!(body.get(key).is_some(), "missing {}", key);
    }
    assert_eq!(body["connections"], 0);

    let (status, body) = api.get("/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["timestamp"].as_u64().is_some());
    api.app.shutdown().await;
}

#[tokio::test]
async fn test_config_get_and_update() {
    let api = TestApi::start(None).await;

    let (status, body) = api.get("/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["host"], "127.0.0.1");
    assert!(body.get("password").is_none());
    assert_eq!(body["authMethods"], json!(["无认证"]));

    let resp = api
        .client
        .put(api.url("/api/config"))
        .json(&json!({ "port": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let err: Value = resp.json().await.unwrap();
    assert!(err["error"].is_string());
    let (_, unchanged) = api.get("/api/config").await;
    assert_eq!(unchanged, body);

    let resp = api
        .client
        .put(api.url("/api/config"))
        .json(&json!({
            "user": "admin",
            "password": "secret",
            "authMethods": ["无认证", "用户名密码认证"],
            "maxConnections": 50,
            "blackList": ["192.0.2.0/24"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let updated: Value = resp.json().await.unwrap();
    assert_eq!(updated["config"]["maxConnections"], 50);
    assert_eq!(updated["config"]["blackList"], json!(["192.0.2.0/24"]));
    assert!(updated["config"].get("password").is_none());

    // Malformed JSON is a 400 with an error body
    let resp = api
        .client
        .put(api.url("/api/config"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    api.app.shutdown().await;
}

#[tokio::test]
async fn test_connections_endpoints() {
    let api = TestApi::start(None).await;
    let target = echo_server().await;
    let proxy = api.app.socks_addr().unwrap();
    let mut client = socks_connect(proxy, target).await.unwrap();

    let (status, body) = api.get("/api/connections").await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["target"], target.to_string());
    assert_eq!(list[0]["clientIP"], "127.0.0.1");
    assert_eq!(list[0]["state"], "relaying");
    let start_time = list[0]["startTime"].as_str().unwrap();
    assert!(humantime::parse_rfc3339(start_time).is_ok());
    let id = list[0]["id"].as_u64().unwrap();

    let (status, one) = api.get(&format!("/api/connections/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["id"], id);

    let (status, err) = api.get("/api/connections/424242").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(err["error"].is_string());

    let resp = api
        .client
        .delete(api.url("/api/connections/424242"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(api.app.aggregator().current_stats().connections, 1);

    let resp = api
        .client
        .delete(api.url(&format!("/api/connections/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(closed_within(&mut client, Duration::from_secs(2)).await);

    let agg = api.app.aggregator().clone();
    assert!(wait_until(|| agg.current_stats().connections == 0).await);
    api.app.shutdown().await;
}

#[tokio::test]
async fn test_logs_and_connectivity_check() {
    let api = TestApi::start(None).await;

    let (status, body) = api.get("/api/logs?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 5);
    assert!(body["logs"].is_array());

    let (_, body) = api.get("/api/logs").await;
    assert_eq!(body["limit"], 100);

    let target = echo_server().await;
    let resp = api
        .client
        .post(api.url("/api/test"))
        .json(&json!({ "host": "127.0.0.1", "port": target.port() }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);

    let resp = api
        .client
        .post(api.url("/api/test"))
        .json(&json!({ "host": "", "port": 80 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let closed_port = free_port();
    let resp = api
        .client
        .post(api.url("/api/test"))
        .json(&json!({ "host": "127.0.0.1", "port": closed_port }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    api.app.shutdown().await;
}

#[tokio::test]
async fn test_restart_returns_immediately() {
    let api = TestApi::start(None).await;
    let resp = api
        .client
        .post(api.url("/api/restart"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].is_string());
    assert!(body["timestamp"].as_u64().is_some());

    let agg = api.app.aggregator().clone();
    assert!(wait_until(|| agg.status() == socks5_server_r::business::ServerStatus::Running).await);
    api.app.shutdown().await;
}

#[tokio::test]
async fn test_bearer_token_required() {
    let api = TestApi::start(Some("s3cret")).await;

    // Health check stays open
    let (status, _) = api.get("/ping").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = api.get("/api/stats").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let resp = api
        .client
        .get(api.url("/api/stats"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = api
        .client
        .get(api.url("/api/stats"))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    api.app.shutdown().await;
}
