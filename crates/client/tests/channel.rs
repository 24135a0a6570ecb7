//! Integration tests for the realtime channel: connection lifecycle,
//! listener fan-out, and subscription bookkeeping.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use common::{channel, job, settle, FakeConnector, Handshake};
use singwithme_client::messages::RawFrame;
use singwithme_client::{ChannelEvent, ConnectionState, EventCategory, ListenerHandle};

/// Listener that counts its calls.
fn counter() -> (Arc<AtomicU32>, impl Fn(&ChannelEvent) + Send + Sync + 'static) {
    let count = Arc::new(AtomicU32::new(0));
    let inner = Arc::clone(&count);
    (count, move |_: &ChannelEvent| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

// ---------------------------------------------------------------------------
// Test: connect reports the lifecycle and is a no-op while active
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn connect_emits_connect_event_once() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector.clone());
    let (connects, on_connect) = counter();
    channel.add_event_listener(EventCategory::Connect, on_connect);

    assert_eq!(channel.state(), ConnectionState::Disconnected);
    channel.connect();
    assert_eq!(channel.state(), ConnectionState::Connecting);
    channel.connect();

    let _server = servers.recv().await.unwrap();
    settle().await;

    assert!(channel.is_connected());
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Test: exhausted retries surface a connection error event
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn exhausted_retries_emit_connection_error() {
    let (connector, _servers) = FakeConnector::refusing();
    let channel = channel(connector.clone());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&errors);
    channel.add_event_listener(EventCategory::ConnectionError, move |event| {
        seen.lock().unwrap().push(event.payload.clone());
    });

    channel.connect();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["attempts"], 2);
}

#[tokio::test(start_paused = true)]
async fn hanging_handshake_is_retried_until_it_succeeds() {
    let (connector, mut servers) = FakeConnector::scripted([Handshake::Hang], Handshake::Accept);
    let channel = channel(connector.clone());

    channel.connect();
    let _server = servers.recv().await.unwrap();
    settle().await;

    // One timed-out attempt (5s), the retry delay (1s), then success.
    assert!(channel.is_connected());
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Test: records fan out to category listeners and the wildcard
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn records_fan_out_to_listeners_and_wildcard() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector);
    let (status_a, listener_a) = counter();
    let (status_b, listener_b) = counter();
    let (wildcard, on_any) = counter();
    channel.add_event_listener(EventCategory::StatusUpdate, listener_a);
    channel.add_event_listener(EventCategory::StatusUpdate, listener_b);
    channel.add_event_listener(EventCategory::Message, on_any);

    channel.connect();
    let server = servers.recv().await.unwrap();
    settle().await;

    server.push(json!({ "event": "status_update", "jobId": "abc123", "status": "processing" }));
    server.push(json!({ "event": "queue_position", "jobId": "abc123", "position": 3 }));
    settle().await;

    assert_eq!(status_a.load(Ordering::SeqCst), 1);
    assert_eq!(status_b.load(Ordering::SeqCst), 1);
    // Both server records, but not the connect lifecycle event.
    assert_eq!(wildcard.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn undecodable_frames_are_dropped() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector);
    let (wildcard, on_any) = counter();
    channel.add_event_listener(EventCategory::Message, on_any);

    channel.connect();
    let server = servers.recv().await.unwrap();
    settle().await;

    server.push_raw(RawFrame::Text("not json".into()));
    server.push_raw(RawFrame::Text("[1, 2]".into()));
    server.push(json!({ "jobId": "abc123" }));
    server.push_raw(RawFrame::Binary(
        br#"{"event":"processing_complete","jobId":"abc123"}"#.to_vec(),
    ));
    settle().await;

    assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    assert!(channel.is_connected());
}

// ---------------------------------------------------------------------------
// Test: a panicking listener does not stop delivery to the others
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn panicking_listener_is_isolated() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector);
    channel.add_event_listener(EventCategory::ProcessingComplete, |_| panic!("listener bug"));
    let (completions, on_complete) = counter();
    channel.add_event_listener(EventCategory::ProcessingComplete, on_complete);

    channel.connect();
    let server = servers.recv().await.unwrap();
    settle().await;

    server.push(json!({ "event": "processing_complete", "jobId": "abc123" }));
    server.push(json!({ "event": "processing_complete", "jobId": "def456" }));
    settle().await;

    assert_eq!(completions.load(Ordering::SeqCst), 2);
    assert!(channel.is_connected());
}

// ---------------------------------------------------------------------------
// Test: listeners may remove themselves and each other during dispatch
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn listener_can_remove_itself_during_dispatch() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector);
    let calls = Arc::new(AtomicU32::new(0));
    let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

    let handle = {
        let calls = Arc::clone(&calls);
        let slot = Arc::clone(&slot);
        channel.add_event_listener(EventCategory::StatusUpdate, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = slot.lock().unwrap().take() {
                handle.remove();
            }
        })
    };
    *slot.lock().unwrap() = Some(handle);

    channel.connect();
    let server = servers.recv().await.unwrap();
    settle().await;

    server.push(json!({ "event": "status_update", "jobId": "abc123" }));
    server.push(json!({ "event": "status_update", "jobId": "abc123" }));
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(channel.listener_count(&EventCategory::StatusUpdate), 0);
}

#[tokio::test(start_paused = true)]
async fn listener_removed_mid_dispatch_is_not_invoked() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector);
    let victim: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

    {
        let victim = Arc::clone(&victim);
        channel.add_event_listener(EventCategory::StatusUpdate, move |_| {
            if let Some(handle) = victim.lock().unwrap().take() {
                handle.remove();
            }
        });
    }
    let (victim_calls, on_status) = counter();
    *victim.lock().unwrap() = Some(channel.add_event_listener(EventCategory::StatusUpdate, on_status));

    channel.connect();
    let server = servers.recv().await.unwrap();
    settle().await;

    server.push(json!({ "event": "status_update", "jobId": "abc123" }));
    settle().await;

    assert_eq!(victim_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn removing_a_listener_twice_is_harmless() {
    let (connector, _servers) = FakeConnector::accepting();
    let channel = channel(connector);
    let handle = channel.add_event_listener(EventCategory::Message, |_| {});

    assert!(channel.remove_event_listener(&EventCategory::Message, handle.id()));
    assert!(!channel.remove_event_listener(&EventCategory::Message, handle.id()));
    handle.remove();
    assert_eq!(channel.listener_count(&EventCategory::Message), 0);
}

// ---------------------------------------------------------------------------
// Test: subscriptions require a connection and are replayed on connect
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn subscribe_requires_connection() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector);

    assert!(!channel.subscribe_to_job(&job("abc123")));

    channel.connect();
    let mut server = servers.recv().await.unwrap();
    settle().await;

    assert!(channel.subscribe_to_job(&job("abc123")));
    assert!(channel.unsubscribe_from_job(&job("abc123")));

    let received = server.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0]["type"], "subscribe");
    assert_eq!(received[0]["jobId"], "abc123");
    assert!(received[0]["timestamp"].is_string());
    assert_eq!(received[1]["type"], "unsubscribe");
}

#[tokio::test(start_paused = true)]
async fn queued_subscriptions_flush_on_connect() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector);

    channel.queue_subscription(&job("abc123"));
    channel.queue_subscription(&job("def456"));
    channel.queue_subscription(&job("abc123"));
    channel.connect();
    let mut server = servers.recv().await.unwrap();
    settle().await;

    assert_eq!(
        server.control_log(),
        vec![
            ("subscribe".to_string(), "abc123".to_string()),
            ("subscribe".to_string(), "def456".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn subscriptions_are_replayed_after_reconnect() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector);
    let (disconnects, on_disconnect) = counter();
    let (connects, on_connect) = counter();
    channel.add_event_listener(EventCategory::Disconnect, on_disconnect);
    channel.add_event_listener(EventCategory::Connect, on_connect);

    channel.connect();
    let first = servers.recv().await.unwrap();
    settle().await;
    assert!(channel.subscribe_to_job(&job("abc123")));

    first.hang_up();
    let mut second = servers.recv().await.unwrap();
    settle().await;

    assert!(channel.is_connected());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        second.control_log(),
        vec![("subscribe".to_string(), "abc123".to_string())]
    );
}

// ---------------------------------------------------------------------------
// Test: disconnect clears everything and is idempotent
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_clears_listeners_and_subscriptions() {
    let (connector, mut servers) = FakeConnector::accepting();
    let channel = channel(connector.clone());
    let (statuses, on_status) = counter();
    let (disconnects, on_disconnect) = counter();
    channel.add_event_listener(EventCategory::StatusUpdate, on_status);
    channel.add_event_listener(EventCategory::Disconnect, on_disconnect);

    channel.connect();
    let server = servers.recv().await.unwrap();
    settle().await;
    assert!(channel.subscribe_to_job(&job("abc123")));

    channel.disconnect();
    channel.disconnect();
    settle().await;

    // Listeners hear about the close once, before the table is cleared.
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(channel.listener_count(&EventCategory::Disconnect), 0);
    assert_eq!(channel.listener_count(&EventCategory::StatusUpdate), 0);
    server.push(json!({ "event": "status_update", "jobId": "abc123" }));
    settle().await;
    assert_eq!(statuses.load(Ordering::SeqCst), 0);

    // A fresh connect does not resubscribe forgotten jobs.
    channel.connect();
    let mut next = servers.recv().await.unwrap();
    settle().await;
    assert!(channel.is_connected());
    assert!(next.control_log().is_empty());
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disconnect_before_connect_is_a_no_op() {
    let (connector, _servers) = FakeConnector::accepting();
    let channel = channel(connector);
    let (disconnects, on_disconnect) = counter();
    channel.add_event_listener(EventCategory::Disconnect, on_disconnect);

    channel.disconnect();
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
}
