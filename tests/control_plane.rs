use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use portico::gateway::sync::{Poller, Settings};
use portico::gateway::{Gateway, GatewayConfig};
use portico::profiles::ProfileRegistry;

fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
            true
        }
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

fn settings(base_url: String) -> Settings {
    Settings {
        token: "gw-token".to_string(),
        port: 0,
        control_plane_url: base_url,
        sync_interval: Duration::from_secs(30),
    }
}

fn gateway() -> Arc<Gateway> {
    Arc::new(Gateway::new(ProfileRegistry::builtin()))
}

fn wire_config() -> serde_json::Value {
    json!({
        "serverId": "srv-1",
        "gatewayId": "gw-1",
        "pepper": "pepper",
        "version": 7,
        "connections": [{
            "id": "conn-1",
            "slug": "acme-time",
            "domain": "time.acme.test",
            "profile": "time",
            "apiKeyHash": "deadbeef",
            "enabled": true,
            "envVars": {},
            "rateLimit": 60,
            "maxConcurrency": 10,
        }],
    })
}

#[tokio::test]
async fn sync_applies_config_and_sends_version_header() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/internal/gateway/sync")
            .header("authorization", "Bearer gw-token")
            .header("x-config-version", "0");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"success": true, "data": wire_config()}));
    });

    let gateway = gateway();
    let mut poller = Poller::new(gateway.clone(), &settings(server.base_url())).unwrap();
    poller.sync_once().await;

    mock.assert();
    assert_eq!(poller.consecutive_failures(), 0);
    assert_eq!(gateway.version(), 7);
    assert!(gateway.lookup("time.acme.test").await.is_some());
}

#[tokio::test]
async fn not_modified_resets_the_failure_counter() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    let mut failing = server.mock(|when, then| {
        when.method(GET).path("/internal/gateway/sync");
        then.status(500).body("boom");
    });

    let gateway = gateway();
    let mut poller = Poller::new(gateway, &settings(server.base_url())).unwrap();
    poller.sync_once().await;
    poller.sync_once().await;
    assert_eq!(poller.consecutive_failures(), 2);

    failing.delete();
    server.mock(|when, then| {
        when.method(GET).path("/internal/gateway/sync");
        then.status(304);
    });
    poller.sync_once().await;
    assert_eq!(poller.consecutive_failures(), 0);
}

#[tokio::test]
async fn token_rotation_header_replaces_the_bearer() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    let mut first = server.mock(|when, then| {
        when.method(GET)
            .path("/internal/gateway/sync")
            .header("authorization", "Bearer gw-token");
        then.status(304).header("X-Gateway-Token", "gw-token-2");
    });

    let gateway = gateway();
    let mut poller = Poller::new(gateway, &settings(server.base_url())).unwrap();
    poller.sync_once().await;
    assert_eq!(poller.token(), "gw-token-2");
    first.assert();

    first.delete();
    let second = server.mock(|when, then| {
        when.method(GET)
            .path("/internal/gateway/sync")
            .header("authorization", "Bearer gw-token-2");
        then.status(304);
    });
    poller.sync_once().await;
    second.assert();
}

#[tokio::test]
async fn auth_failure_counts_but_keeps_last_good_config() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/internal/gateway/sync");
        then.status(401);
    });

    let gateway = gateway();
    // Seed a last-known-good configuration out of band.
    let config: GatewayConfig = serde_json::from_value(wire_config()).unwrap();
    gateway.apply_config(config).await;

    let mut poller = Poller::new(gateway.clone(), &settings(server.base_url())).unwrap();
    poller.sync_once().await;
    assert_eq!(poller.consecutive_failures(), 1);
    assert_eq!(gateway.version(), 7);
    assert!(gateway.lookup("time.acme.test").await.is_some());
}

#[tokio::test]
async fn success_false_applies_nothing() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/internal/gateway/sync");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"success": false, "data": wire_config()}));
    });

    let gateway = gateway();
    let mut poller = Poller::new(gateway.clone(), &settings(server.base_url())).unwrap();
    poller.sync_once().await;
    assert_eq!(poller.consecutive_failures(), 0);
    assert_eq!(gateway.version(), 0);
    assert!(gateway.lookup("time.acme.test").await.is_none());
}

#[tokio::test]
async fn metrics_push_sends_deltas_once() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/internal/gateway/metrics")
            .header("authorization", "Bearer gw-token")
            .body_contains("\"connectionId\":\"conn-9\"");
        then.status(200);
    });

    let gateway = gateway();
    gateway.record_request("conn-9", 12.5, false).await;
    gateway.record_request("conn-9", 30.0, true).await;

    let poller = Poller::new(gateway.clone(), &settings(server.base_url())).unwrap();
    poller.report_once().await;
    mock.assert();

    // Deltas were reset; a second tick has nothing to push.
    poller.report_once().await;
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn empty_metrics_are_not_pushed() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/internal/gateway/metrics");
        then.status(200);
    });

    let gateway = gateway();
    let poller = Poller::new(gateway, &settings(server.base_url())).unwrap();
    poller.report_once().await;
    assert_eq!(mock.hits(), 0);
}

#[tokio::test]
async fn transport_failure_counts_without_clearing_state() {
    let gateway = gateway();
    let config: GatewayConfig = serde_json::from_value(wire_config()).unwrap();
    gateway.apply_config(config).await;

    // Nothing listens on this address; the request itself fails.
    let mut poller = Poller::new(
        gateway.clone(),
        &settings("http://127.0.0.1:9".to_string()),
    )
    .unwrap();
    poller.sync_once().await;
    assert_eq!(poller.consecutive_failures(), 1);
    assert_eq!(gateway.version(), 7);

    assert!(gateway.lookup("time.acme.test").await.is_some());
}
