//! Integration tests for the Session Gateway: real WS/HTTP clients against
//! a gateway instance wired to `InMemoryStorage`, the same way the fake
//! storage layer stands in for Redis in the core crate's own tests.
use apix_protocol::{ClientFrame, ServerFrame, TokenClaims};
use apix_test_support::{InMemoryStorage, MockWsClient};
use gateway::{build_router, AppState, Config};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "test-signing-secret";

fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".into(),
        redis_url: String::new(),
        jwt_signing_secret: SECRET.into(),
        log_level: "error".into(),
        heartbeat_interval: Duration::from_secs(3600),
        default_api_calls_per_hour: 10_000,
        default_ws_messages_per_minute: 1_000,
        max_event_rate_per_session: 1_000,
        audit_retention_days: 90,
        replay_max_rate_events_per_sec: 1_000.0,
        max_sessions_per_tenant: 10_000,
    }
}

fn token_for(org_id: &str, user_id: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = TokenClaims {
        sub: Some(user_id.to_owned()),
        org_id: org_id.to_owned(),
        org_slug: format!("{org_id}-slug"),
        roles: vec!["member".into()],
        permissions: vec!["*:*".into()],
        iat: now,
        exp: now + 3600,
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

/// Starts a gateway instance on an ephemeral port backed by in-memory
/// storage, returning its base `http://` and `ws://` addresses.
async fn spawn_gateway() -> (String, String) {
    let storage = Arc::new(InMemoryStorage::new());
    let state = AppState::new(test_config(), storage.clone(), storage);
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (format!("http://{addr}"), format!("ws://{addr}"))
}

#[tokio::test]
async fn publish_fans_out_to_other_subscribers_in_the_same_tenant() {
    let (_http, ws) = spawn_gateway().await;
    let token = token_for("org1", "alice");

    let mut publisher = MockWsClient::connect_with_token(&format!("{ws}/ws/v1/gateway"), &token).await.unwrap();
    let mut subscriber =
        MockWsClient::connect_with_token(&format!("{ws}/ws/v1/gateway?userId=bob"), &token_for("org1", "bob"))
            .await
            .unwrap();

    assert!(matches!(publisher.recv_frame().await.unwrap(), ServerFrame::Connected { .. }));
    assert!(matches!(subscriber.recv_frame().await.unwrap(), ServerFrame::Connected { .. }));

    subscriber
        .send_frame(&ClientFrame::Subscribe { channels: vec!["orders".into()], filters: None })
        .await
        .unwrap();
    match subscriber.recv_frame().await.unwrap() {
        ServerFrame::Subscribed { channels } => assert_eq!(channels, vec!["orders".to_owned()]),
        other => panic!("expected Subscribed, got {other:?}"),
    }

    publisher
        .send_frame(&ClientFrame::Publish {
            event_type: "order.created".into(),
            channel: "orders".into(),
            payload: serde_json::json!({ "orderId": "o-1" }),
            metadata: None,
        })
        .await
        .unwrap();

    match publisher.recv_frame().await.unwrap() {
        ServerFrame::Published { channel, .. } => assert_eq!(channel, "orders"),
        other => panic!("expected Published, got {other:?}"),
    }

    let event = subscriber.recv_until(|f| matches!(f, ServerFrame::Event { .. })).await.unwrap();
    match event {
        ServerFrame::Event { event } => {
            assert_eq!(event.channel, "orders");
            assert_eq!(event.event_type, "order.created");
            assert_eq!(event.org_id, "org1");
        }
        other => panic!("expected Event, got {other:?}"),
    }
}

#[tokio::test]
async fn tenants_never_receive_each_others_channel_traffic() {
    let (_http, ws) = spawn_gateway().await;

    let mut org_a = MockWsClient::connect_with_token(&format!("{ws}/ws/v1/gateway"), &token_for("org-a", "a1")).await.unwrap();
    let mut org_b = MockWsClient::connect_with_token(&format!("{ws}/ws/v1/gateway"), &token_for("org-b", "b1")).await.unwrap();
    assert!(matches!(org_a.recv_frame().await.unwrap(), ServerFrame::Connected { .. }));
    assert!(matches!(org_b.recv_frame().await.unwrap(), ServerFrame::Connected { .. }));

    org_b.send_frame(&ClientFrame::Subscribe { channels: vec!["orders".into()], filters: None }).await.unwrap();
    assert!(matches!(org_b.recv_frame().await.unwrap(), ServerFrame::Subscribed { .. }));

    org_a
        .send_frame(&ClientFrame::Publish {
            event_type: "order.created".into(),
            channel: "orders".into(),
            payload: serde_json::json!({ "orderId": "o-1" }),
            metadata: None,
        })
        .await
        .unwrap();
    assert!(matches!(org_a.recv_frame().await.unwrap(), ServerFrame::Published { .. }));

    // org-b subscribed to the same channel *name*, but the room key is
    // namespaced by org_id, so nothing should arrive within a short window.
    let result = tokio::time::timeout(Duration::from_millis(300), org_b.recv_frame()).await;
    assert!(result.is_err(), "org-b must not observe org-a's event");
}

#[tokio::test]
async fn publish_with_mismatched_organization_id_in_metadata_is_denied() {
    let (_http, ws) = spawn_gateway().await;
    let mut client = MockWsClient::connect_with_token(&format!("{ws}/ws/v1/gateway"), &token_for("org1", "alice")).await.unwrap();
    assert!(matches!(client.recv_frame().await.unwrap(), ServerFrame::Connected { .. }));

    let mut metadata = serde_json::Map::new();
    metadata.insert("organizationId".into(), serde_json::json!("org-someone-else"));
    client
        .send_frame(&ClientFrame::Publish {
            event_type: "order.created".into(),
            channel: "orders".into(),
            payload: serde_json::json!({}),
            metadata: Some(metadata),
        })
        .await
        .unwrap();

    match client.recv_frame().await.unwrap() {
        ServerFrame::Error { code, .. } => assert_eq!(code, apix_protocol::error_codes::CROSS_TENANT_DENIED),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn subscribing_to_zero_channels_is_a_no_op() {
    let (_http, ws) = spawn_gateway().await;
    let mut client = MockWsClient::connect_with_token(&format!("{ws}/ws/v1/gateway"), &token_for("org1", "alice")).await.unwrap();
    assert!(matches!(client.recv_frame().await.unwrap(), ServerFrame::Connected { .. }));

    client.send_frame(&ClientFrame::Subscribe { channels: vec![], filters: None }).await.unwrap();
    match client.recv_frame().await.unwrap() {
        ServerFrame::Subscribed { channels } => assert!(channels.is_empty()),
        other => panic!("expected Subscribed, got {other:?}"),
    }
}

#[tokio::test]
async fn subscribing_to_more_than_fifty_channels_is_rejected() {
    let (_http, ws) = spawn_gateway().await;
    let mut client = MockWsClient::connect_with_token(&format!("{ws}/ws/v1/gateway"), &token_for("org1", "alice")).await.unwrap();
    assert!(matches!(client.recv_frame().await.unwrap(), ServerFrame::Connected { .. }));

    let channels: Vec<String> = (0..51).map(|i| format!("chan-{i}")).collect();
    client.send_frame(&ClientFrame::Subscribe { channels, filters: None }).await.unwrap();
    match client.recv_frame().await.unwrap() {
        ServerFrame::Error { code, .. } => assert_eq!(code, apix_protocol::error_codes::INVALID_ARGUMENT),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_is_answered_with_a_pong() {
    let (_http, ws) = spawn_gateway().await;
    let mut client = MockWsClient::connect_with_token(&format!("{ws}/ws/v1/gateway"), &token_for("org1", "alice")).await.unwrap();
    assert!(matches!(client.recv_frame().await.unwrap(), ServerFrame::Connected { .. }));

    client.send_frame(&ClientFrame::Ping { client_ts: chrono::Utc::now().timestamp_millis() }).await.unwrap();
    assert!(matches!(client.recv_frame().await.unwrap(), ServerFrame::Pong { .. }));
}

#[tokio::test]
async fn missing_credentials_close_the_connection_with_an_auth_error() {
    let (_http, ws) = spawn_gateway().await;
    let mut client = MockWsClient::connect(&format!("{ws}/ws/v1/gateway")).await.unwrap();
    // No header/query credentials were supplied, so the gateway waits for a
    // handshake frame carrying `{"auth": {"token": "..."}}`. Anything else
    // (including a well-formed frame lacking that shape) is rejected.
    client.send_frame(&ClientFrame::Ping { client_ts: 0 }).await.unwrap();
    match client.recv_frame().await.unwrap() {
        ServerFrame::Error { code, .. } => assert_eq!(code, apix_protocol::error_codes::AUTH_REQUIRED),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn subscriptions_created_over_rest_are_visible_to_a_list_call() {
    let (http, _ws) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let token = token_for("org1", "alice");

    let created: serde_json::Value = client
        .post(format!("{http}/api/v1/subscriptions"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "channel": "orders" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(created.get("subscription_id").is_some());

    let listed: serde_json::Value = client
        .get(format!("{http}/api/v1/subscriptions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let subscriptions = listed.get("subscriptions").and_then(|v| v.as_array()).unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].get("channel").unwrap(), "orders");
}

#[tokio::test]
async fn replay_with_max_events_zero_completes_with_no_events_delivered() {
    let (http, _ws) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let token = token_for("org1", "alice");

    let started: serde_json::Value = client
        .post(format!("{http}/api/v1/events/replay"))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "from": "2020-01-01T00:00:00Z",
            "to": "2030-01-01T00:00:00Z",
            "max_events": 0,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let replay_id = started.get("replayId").and_then(|v| v.as_str()).unwrap().to_owned();

    let status: serde_json::Value = client
        .get(format!("{http}/api/v1/events/replay/{replay_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.get("active").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(status.get("progress_pct").and_then(|v| v.as_f64()), Some(100.0));
}

#[tokio::test]
async fn endpoint_crud_round_trips_through_rest() {
    let (http, _ws) = spawn_gateway().await;
    let client = reqwest::Client::new();
    let token = token_for("org1", "alice");

    let created: serde_json::Value = client
        .post(format!("{http}/api/v1/endpoints"))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "url": "https://example.com/webhook",
            "method": "POST",
            "timeout_ms": 5000,
            "retry_policy": { "max_attempts": 3, "backoff": "EXPONENTIAL", "base_delay_ms": 100, "max_delay_ms": 5000, "jitter": 0.1 },
            "semantics": "AT_LEAST_ONCE",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let endpoint_id = created.get("endpointId").and_then(|v| v.as_str()).unwrap().to_owned();

    let updated = client
        .patch(format!("{http}/api/v1/endpoints/{endpoint_id}"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "active": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(updated.status(), reqwest::StatusCode::OK);

    let deleted = client.delete(format!("{http}/api/v1/endpoints/{endpoint_id}")).bearer_auth(&token).send().await.unwrap();
    assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);

    let not_found = client.get(format!("{http}/api/v1/endpoints/{endpoint_id}")).bearer_auth(&token).send().await.unwrap();
    assert_eq!(not_found.status(), reqwest::StatusCode::NOT_FOUND);
}
