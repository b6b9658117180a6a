mod common;

use common::{user, StaticProbe};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use field_report_sync::backend::{
    Backend, ChangeCallback, ChangeEvent, ChangeKind, EventMask, Query, Session, SupabaseBackend,
    User,
};
use field_report_sync::config::{BackendConfig, SyncOptions};
use field_report_sync::connectivity::{ConnectivityMonitor, HttpProbe, NetworkProbe};
use field_report_sync::sync::SyncEngine;

fn backend(uri: &str) -> SupabaseBackend {
    let config = BackendConfig::new(uri, "test_anon_key".to_string()).unwrap();
    SupabaseBackend::new(&config)
}

fn token_response() -> Value {
    json!({
        "access_token": "test_access_token",
        "token_type": "bearer",
        "expires_in": 3600,
        "refresh_token": "test_refresh_token",
        "user": {
            "id": "test_user_id",
            "email": "test@example.com",
            "role": "authenticated"
        }
    })
}

async fn signed_in(mock_server: &MockServer) -> SupabaseBackend {
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response()))
        .mount(mock_server)
        .await;

    let backend = backend(&mock_server.uri());
    backend
        .sign_in_with_password("test@example.com", "password123")
        .await
        .unwrap();
    backend
}

#[tokio::test]
async fn test_sign_in_stores_session() {
    let mock_server = MockServer::start().await;
    let backend = signed_in(&mock_server).await;

    let session = backend.get_session().await.unwrap().unwrap();
    assert_eq!(session.access_token, "test_access_token");
    assert!(session.expires_at.is_some());

    let user = backend.current_user().await.unwrap();
    assert_eq!(user.id, "test_user_id");
    assert_eq!(user.email.as_deref(), Some("test@example.com"));
}

#[tokio::test]
async fn test_query_orders_newest_first_with_user_token() {
    let mock_server = MockServer::start().await;
    let backend = signed_in(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/field_reports"))
        .and(query_param("select", "*"))
        .and(query_param("order", "submitted_at.desc"))
        .and(query_param("user_id", "eq.test_user_id"))
        .and(header("apikey", "test_anon_key"))
        .and(header("Authorization", "Bearer test_access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 2, "title": "Newer", "submitted_at": "2024-03-01T00:00:00Z" },
            { "id": 1, "title": "Older", "submitted_at": "2024-01-01T00:00:00Z" }
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let query = Query::new("field_reports")
        .eq("user_id", "test_user_id")
        .order("submitted_at", false);
    let rows = backend.query(&query).await.unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["title"], "Newer");
}

#[tokio::test]
async fn test_query_without_session_uses_anon_key() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/field_reports"))
        .and(header("Authorization", "Bearer test_anon_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let rows = backend(&mock_server.uri())
        .query(&Query::new("field_reports"))
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_query_error_body_is_parsed() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/field_reports"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "code": "42P01",
            "details": null,
            "hint": null,
            "message": "relation \"public.field_reports\" does not exist"
        })))
        .mount(&mock_server)
        .await;

    let err = backend(&mock_server.uri())
        .query(&Query::new("field_reports"))
        .await
        .unwrap_err();

    assert_eq!(err.status, Some(404));
    assert_eq!(err.code.as_deref(), Some("42P01"));
    assert!(err.message.contains("does not exist"));
}

#[tokio::test]
async fn test_insert_asks_for_minimal_return() {
    let mock_server = MockServer::start().await;
    let backend = signed_in(&mock_server).await;
    let record = json!({ "title": "Blight", "user_id": "test_user_id" });

    Mock::given(method("POST"))
        .and(path("/rest/v1/field_reports"))
        .and(header("Prefer", "return=minimal"))
        .and(header("Authorization", "Bearer test_access_token"))
        .and(body_json(record.clone()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    backend.insert("field_reports", record).await.unwrap();
}

#[tokio::test]
async fn test_refresh_session_replaces_tokens() {
    let mock_server = MockServer::start().await;
    let backend = signed_in(&mock_server).await;

    let mut refreshed = token_response();
    refreshed["access_token"] = json!("new_access_token");
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "refresh_token"))
        .and(body_json(json!({ "refresh_token": "test_refresh_token" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(refreshed))
        .expect(1)
        .mount(&mock_server)
        .await;

    let session = backend.refresh_session().await.unwrap();
    assert_eq!(session.access_token, "new_access_token");
    let stored = backend.get_session().await.unwrap().unwrap();
    assert_eq!(stored.access_token, "new_access_token");
}

#[tokio::test]
async fn test_refresh_without_session_fails() {
    let mock_server = MockServer::start().await;
    let err = backend(&mock_server.uri()).refresh_session().await.unwrap_err();
    assert_eq!(err.status, Some(401));
}

#[tokio::test]
async fn test_refresh_rejected_by_server() {
    let mock_server = MockServer::start().await;
    let backend = signed_in(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid Refresh Token: Already Used"
        })))
        .mount(&mock_server)
        .await;

    let err = backend.refresh_session().await.unwrap_err();
    assert_eq!(err.status, Some(400));
    assert_eq!(err.message, "Invalid Refresh Token: Already Used");
}

#[tokio::test]
async fn test_sign_out_revokes_and_forgets_session() {
    let mock_server = MockServer::start().await;
    let backend = signed_in(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/logout"))
        .and(header("apikey", "test_anon_key"))
        .and(header("Authorization", "Bearer test_access_token"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    backend.sign_out().await.unwrap();
    assert!(backend.get_session().await.unwrap().is_none());
    assert!(backend.current_user().await.is_none());

    // Nothing left to revoke, so no second request.
    backend.sign_out().await.unwrap();
}

#[tokio::test]
async fn test_set_session_is_used_for_queries() {
    let mock_server = MockServer::start().await;
    let backend = backend(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/rest/v1/field_reports"))
        .and(header("Authorization", "Bearer restored_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/field_reports"))
        .and(header("Authorization", "Bearer test_anon_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let restored = Session::new(
        "restored_token".to_string(),
        "restored_refresh".to_string(),
        User {
            id: "restored_user".to_string(),
            email: None,
        },
        3600,
    );
    backend.set_session(Some(restored)).await;

    let session = backend.get_session().await.unwrap().unwrap();
    assert_eq!(session.access_token, "restored_token");
    assert_eq!(backend.current_user().await.unwrap().id, "restored_user");
    backend.query(&Query::new("field_reports")).await.unwrap();

    backend.set_session(None).await;
    assert!(backend.get_session().await.unwrap().is_none());
    backend.query(&Query::new("field_reports")).await.unwrap();
}

#[tokio::test]
async fn test_http_probe() {
    let mock_server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/auth/v1/health"))
        .and(header("apikey", "test_anon_key"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = reqwest::Client::new();
    let probe = HttpProbe::new(client.clone(), &mock_server.uri(), "/auth/v1/health")
        .with_api_key("test_anon_key");
    assert!(probe.probe().await);

    let missing = HttpProbe::new(client, &mock_server.uri(), "/nowhere");
    assert!(!missing.probe().await);
}

// Accepts one realtime connection, acknowledges the join, pushes one change
// and forwards every frame the client sends.
async fn start_mock_realtime() -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws_stream) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        while let Some(Ok(msg)) = ws_stream.next().await {
            if !msg.is_text() {
                continue;
            }
            let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            let _ = frames_tx.send(frame.clone());
            if frame["event"] != "phx_join" {
                continue;
            }
            let topic = frame["topic"].clone();
            let reply = json!({
                "topic": topic,
                "event": "phx_reply",
                "payload": { "status": "ok", "response": {} },
                "ref": frame["ref"]
            });
            let change = json!({
                "topic": topic,
                "event": "postgres_changes",
                "payload": {
                    "ids": [1],
                    "data": {
                        "type": "INSERT",
                        "schema": "public",
                        "table": "field_reports",
                        "record": { "id": 42, "title": "Blight" },
                        "old_record": null,
                        "commit_timestamp": "2024-05-01T10:00:00Z"
                    }
                },
                "ref": null
            });
            for message in [reply, change] {
                if ws_stream.send(Message::Text(message.to_string())).await.is_err() {
                    return;
                }
            }
        }
    });

    (format!("http://{}", addr), frames_rx)
}

#[tokio::test]
async fn test_realtime_subscription_dispatches_changes() {
    let (url, mut frames) = start_mock_realtime().await;
    let backend = backend(&url);

    let (changes_tx, mut changes_rx) = mpsc::unbounded_channel::<ChangeEvent>();
    let callback: ChangeCallback = Arc::new(move |change: ChangeEvent| {
        let _ = changes_tx.send(change);
    });

    let handle = backend
        .subscribe("field_reports", EventMask::All, callback)
        .await
        .unwrap();
    assert_eq!(handle.topic, "realtime:public:field_reports");

    let join = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("join timed out")
        .unwrap();
    assert_eq!(join["event"], "phx_join");
    assert_eq!(join["topic"], "realtime:public:field_reports");
    assert_eq!(
        join["payload"]["config"]["postgres_changes"][0]["table"],
        "field_reports"
    );
    assert_eq!(join["payload"]["config"]["postgres_changes"][0]["event"], "*");

    let change = tokio::time::timeout(Duration::from_secs(2), changes_rx.recv())
        .await
        .expect("change timed out")
        .unwrap();
    assert_eq!(change.kind, ChangeKind::Insert);
    assert_eq!(change.table, "field_reports");
    assert_eq!(change.record.unwrap()["id"], 42);

    backend.unsubscribe(handle).await.unwrap();
    let leave = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("leave timed out")
        .unwrap();
    assert_eq!(leave["event"], "phx_leave");
}

#[tokio::test]
async fn test_realtime_connection_failure_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let callback: ChangeCallback = Arc::new(|_change: ChangeEvent| {});
    let err = backend(&format!("http://{}", addr))
        .subscribe("field_reports", EventMask::All, callback)
        .await
        .unwrap_err();
    assert!(err.message.starts_with("network error"));
}

async fn next_frame(frames: &mut mpsc::UnboundedReceiver<Value>, event: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let frame = frames.recv().await.expect("mock server stopped");
            if frame["event"] == event {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} frame", event))
}

// Accepts one connection and pushes a system frame every `every` while
// forwarding what the client sends.
async fn start_chatty_realtime(every: Duration) -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        let (mut write, mut read) = ws_stream.split();
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(Ok(msg)) = msg else {
                        return;
                    };
                    if msg.is_text() {
                        let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
                        let _ = frames_tx.send(frame);
                    }
                }
                _ = ticker.tick() => {
                    let system = json!({
                        "topic": "realtime:public:field_reports",
                        "event": "system",
                        "payload": { "status": "ok", "message": "still here" },
                        "ref": null
                    });
                    if write.send(Message::Text(system.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    (format!("http://{}", addr), frames_rx)
}

#[tokio::test]
async fn test_heartbeat_keeps_beating_on_busy_channel() {
    let (url, mut frames) = start_chatty_realtime(Duration::from_millis(50)).await;
    let config = BackendConfig::new(&url, "test_anon_key".to_string()).unwrap();
    let options = SyncOptions::default().with_heartbeat_interval(Duration::from_millis(200));
    let backend = SupabaseBackend::new_with_options(&config, &options);

    let callback: ChangeCallback = Arc::new(|_change: ChangeEvent| {});
    let handle = backend
        .subscribe("field_reports", EventMask::All, callback)
        .await
        .unwrap();
    next_frame(&mut frames, "phx_join").await;

    let first = next_frame(&mut frames, "heartbeat").await;
    assert_eq!(first["topic"], "phoenix");
    let second = next_frame(&mut frames, "heartbeat").await;
    assert_ne!(first["ref"], second["ref"]);
    assert!(!handle.is_closed());

    backend.unsubscribe(handle).await.unwrap();
}

// Closes the first connection right after acknowledging its join; later
// connections stay open. Joins are forwarded.
async fn start_flaky_realtime() -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut connections = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(mut ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            connections += 1;
            let close_after_join = connections == 1;
            let frames_tx = frames_tx.clone();
            tokio::spawn(async move {
                while let Some(Ok(msg)) = ws_stream.next().await {
                    if !msg.is_text() {
                        continue;
                    }
                    let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
                    let _ = frames_tx.send(frame.clone());
                    if frame["event"] != "phx_join" {
                        continue;
                    }
                    let reply = json!({
                        "topic": frame["topic"],
                        "event": "phx_reply",
                        "payload": { "status": "ok", "response": {} },
                        "ref": frame["ref"]
                    });
                    if ws_stream.send(Message::Text(reply.to_string())).await.is_err() {
                        return;
                    }
                    if close_after_join {
                        let _ = ws_stream.close(None).await;
                        return;
                    }
                }
            });
        }
    });

    (format!("http://{}", addr), frames_rx)
}

#[tokio::test]
async fn test_engine_reopens_channel_closed_by_server() {
    let (url, mut frames) = start_flaky_realtime().await;
    let config = BackendConfig::new(&url, "test_anon_key".to_string()).unwrap();
    let options = SyncOptions::default().with_resubscribe_interval(Duration::from_millis(50));
    let backend = Arc::new(SupabaseBackend::new_with_options(&config, &options));
    let engine = SyncEngine::builder(backend, ConnectivityMonitor::new(true, StaticProbe::new(true)))
        .options(options)
        .user(Some(user()))
        .build();

    engine.start().await;
    for _ in 0..2 {
        let join = next_frame(&mut frames, "phx_join").await;
        assert_eq!(join["topic"], "realtime:public:field_reports");
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        while !engine.is_subscribed().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel was not reopened");

    engine.shutdown().await;
}
