//! Concurrent admission: one transport, one warming injection, no matter
//! how many requests race for a previously-unseen session.

mod common;

use common::*;
use mcp_relay::config::Config;
use mcp_relay::upstream::UpstreamSessionManager;
use serde_json::{json, Value};

#[tokio::test]
async fn concurrent_admission_converges_on_one_transport() {
    let store = shared_store();
    let relay1 = spawn_relay(Config::default(), store.clone()).await;
    let relay2 = spawn_relay(Config::default(), store.clone()).await;
    let client = client();

    // Session established entirely on instance 1 and active.
    let session_id = establish_session(&client, &relay1.url()).await;

    // A burst of requests for the same session hits instance 2 at once.
    let mut handles = Vec::new();
    for n in 0..8u64 {
        let client = client.clone();
        let url = relay2.url();
        let session_id = session_id.clone();
        handles.push(tokio::spawn(async move {
            post_rpc(
                &client,
                &url,
                &session_id,
                &rpc(10 + n, "tools/list", json!({})),
            )
            .await
            .status()
            .as_u16()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 200);
    }

    // Give the fire-and-forget warming a beat to land.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(relay2.upstream.transport_count(), 1);
    assert_eq!(relay2.upstream.injected_messages(&session_id).len(), 1);
    assert!(relay2.upstream.is_active(&session_id));
}

#[tokio::test]
async fn initialized_but_not_active_sessions_are_not_warmed() {
    let store = shared_store();
    let relay1 = spawn_relay(Config::default(), store.clone()).await;
    let relay2 = spawn_relay(Config::default(), store.clone()).await;
    let client = client();

    // Initialize only; the client never sent notifications/initialized.
    let session_id = initialize_session(&client, &relay1.url()).await;

    let response = post_rpc(
        &client,
        &relay2.url(),
        &session_id,
        &rpc(2, "tools/list", json!({})),
    )
    .await;
    assert_eq!(response.status().as_u16(), 200);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(relay2.upstream.has_transport(&session_id));
    assert!(relay2.upstream.injected_messages(&session_id).is_empty());
}

#[tokio::test]
async fn admitted_session_keeps_serving_after_rehydration() {
    let store = shared_store();
    let relay1 = spawn_relay(Config::default(), store.clone()).await;
    let relay2 = spawn_relay(Config::default(), store.clone()).await;
    let client = client();

    let session_id = establish_session(&client, &relay1.url()).await;

    // First request rehydrates; subsequent requests skip admission.
    for n in 0..3u64 {
        let response = post_rpc(
            &client,
            &relay2.url(),
            &session_id,
            &rpc(20 + n, "echo/test", json!({"n": n})),
        )
        .await;
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["result"]["ok"], true);
    }
    assert_eq!(relay2.upstream.create_calls(), 1);
}
