//! Store outage behavior observed at the HTTP boundary: retries, 503s,
//! and the circuit breaker bounding how hard a dead backend is hit.

mod common;

use common::*;
use mcp_relay::config::Config;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn outage_config() -> Config {
    let mut config = Config::default();
    // One attempt per call so backend call counts map 1:1 to requests,
    // and a short cooldown so the probe is testable.
    config.store.retry.max_attempts = 1;
    config.store.retry.base_ms = 1;
    config.store.retry.cap_ms = 5;
    config.store.breaker.failure_threshold = 5;
    config.store.breaker.cooldown_ms = 300;
    config
}

#[tokio::test]
async fn outage_opens_breaker_then_probe_recovers() {
    let failing = Arc::new(FailingStore::new());
    let relay = spawn_relay(outage_config(), failing.clone()).await;
    let client = client();
    failing.set_failing(true);

    // Five consecutive failures surface as 503 and open the breaker.
    for n in 0..5u64 {
        let response = post_rpc(
            &client,
            &relay.url(),
            "s-x",
            &rpc(n, "tools/list", json!({})),
        )
        .await;
        assert_eq!(response.status().as_u16(), 503);
    }
    let backend_calls = failing.calls();
    assert_eq!(backend_calls, 5);

    // While open, requests are rejected without touching the backend,
    // and quickly.
    let started = Instant::now();
    let response = post_rpc(&client, &relay.url(), "s-x", &rpc(6, "tools/list", json!({}))).await;
    assert_eq!(response.status().as_u16(), 503);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(failing.calls(), backend_calls);

    // After the cooldown one probe goes through; the backend has
    // recovered, so the unknown id now answers 404 and the breaker
    // closes.
    failing.set_failing(false);
    tokio::time::sleep(Duration::from_millis(350)).await;

    let response = post_rpc(&client, &relay.url(), "s-x", &rpc(7, "tools/list", json!({}))).await;
    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(failing.calls(), backend_calls + 1);

    let response = post_rpc(&client, &relay.url(), "s-x", &rpc(8, "tools/list", json!({}))).await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn transient_blip_is_retried_away() {
    let failing = Arc::new(FailingStore::new());
    let mut config = Config::default();
    config.store.retry.max_attempts = 3;
    config.store.retry.base_ms = 1;
    config.store.retry.cap_ms = 5;
    let relay = spawn_relay(config, failing.clone()).await;
    let client = client();

    let session_id = establish_session(&client, &relay.url()).await;
    let calls_before = failing.calls();

    // The next store call fails once; the retry layer absorbs it and the
    // client sees a clean 200.
    failing.fail_times(1);
    let response = post_rpc(
        &client,
        &relay.url(),
        &session_id,
        &rpc(5, "tools/list", json!({})),
    )
    .await;
    assert_eq!(response.status().as_u16(), 200);
    assert!(failing.calls() > calls_before);
}

#[tokio::test]
async fn outage_during_delete_surfaces_503() {
    let failing = Arc::new(FailingStore::new());
    let relay = spawn_relay(outage_config(), failing.clone()).await;
    let client = client();

    let session_id = establish_session(&client, &relay.url()).await;

    failing.set_failing(true);
    let response = client
        .delete(relay.url())
        .header("mcp-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);
}
