mod common;

use std::collections::BTreeMap;

use realtime_client::error::codes;
use realtime_client::protocol::{Action, ProtocolMessage};
use realtime_client::transport::mock::MockHub;
use realtime_client::{Channel, ChannelEvent, ChannelOptions, ChannelState, Message};
use serde_json::json;
use tokio::sync::broadcast;

async fn wait_for_state(events: &mut broadcast::Receiver<ChannelEvent>, state: ChannelState) {
    while let Ok(event) = events.recv().await {
        if let ChannelEvent::StateChanged(change) = event {
            if change.current == state {
                return;
            }
        }
    }
    panic!("channel events closed before {state}");
}

fn spawn_attach(channel: &Channel) -> tokio::task::JoinHandle<Result<Option<realtime_client::ChannelStateChange>, realtime_client::RealtimeError>> {
    let channel = channel.clone();
    tokio::spawn(async move { channel.attach().await })
}

fn message(channel: &str, id: &str, serial: &str, messages: Vec<Message>) -> ProtocolMessage {
    let mut envelope = ProtocolMessage::messages(channel, messages);
    envelope.id = Some(id.to_string());
    envelope.channel_serial = Some(serial.to_string());
    envelope
}

#[test_timeout::tokio_timeout_test(10)]
async fn attach_and_detach_round_trip() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("lobby");

    let attach = spawn_attach(&channel);
    common::accept_attach(&mut conn, "lobby").await;
    let change = attach
        .await
        .expect("join")
        .expect("attached")
        .expect("state changed");
    assert_eq!(change.previous, ChannelState::Attaching);
    assert_eq!(change.current, ChannelState::Attached);
    assert!(!change.resumed);

    // Already attached: nothing to wait for.
    assert_eq!(channel.attach().await.expect("attached"), None);

    let detach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.detach().await }
    });
    let sent = conn.next_sent_of(Action::Detach).await.expect("detach sent");
    assert_eq!(sent.channel.as_deref(), Some("lobby"));
    conn.deliver(ProtocolMessage::for_channel(Action::Detached, "lobby"));
    detach.await.expect("join").expect("detached");
    assert_eq!(channel.state(), ChannelState::Detached);
}

#[test_timeout::tokio_timeout_test(10)]
async fn attach_before_connecting_waits_for_the_transport() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let channel = client.channels().get("early");

    let attach = spawn_attach(&channel);
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert_eq!(channel.state(), ChannelState::Attaching);
    assert_eq!(hub.created(), 0);

    let mut conn = common::connect(&hub, &client, "conn-1").await;
    common::accept_attach(&mut conn, "early").await;
    attach.await.expect("join").expect("attached");
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn unanswered_attach_suspends_then_retries() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("slow");
    let mut events = channel.events();

    let attach = spawn_attach(&channel);
    conn.next_sent_of(Action::Attach).await.expect("attach sent");
    let err = attach.await.expect("join").expect_err("timed out");
    assert_eq!(
        err.error_info().and_then(|e| e.code),
        Some(codes::CHANNEL_TIMEOUT)
    );
    assert_eq!(channel.state(), ChannelState::Suspended);

    common::accept_attach(&mut conn, "slow").await;
    wait_for_state(&mut events, ChannelState::Attached).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn server_detach_while_attached_reattaches() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("flaky");
    let attach = spawn_attach(&channel);
    common::accept_attach(&mut conn, "flaky").await;
    attach.await.expect("join").expect("attached");
    let mut events = channel.events();

    let mut detached = ProtocolMessage::for_channel(Action::Detached, "flaky");
    detached.error = Some(realtime_client::ErrorInfo::new("server detached", 90198, 500));
    conn.deliver(detached);

    wait_for_state(&mut events, ChannelState::Attaching).await;
    common::accept_attach(&mut conn, "flaky").await;
    wait_for_state(&mut events, ChannelState::Attached).await;
    assert_eq!(
        channel.error_reason().and_then(|e| e.code),
        Some(90198)
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn subscribers_get_messages_with_envelope_fields() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("news");

    let subscribe = tokio::spawn({
        let channel = channel.clone();
        async move { channel.subscribe().await }
    });
    common::accept_attach(&mut conn, "news").await;
    let mut messages = subscribe.await.expect("join").expect("subscribed");

    let mut envelope = message(
        "news",
        "srv-1",
        "news:1",
        vec![Message::new("headline", "rust 2024"), Message::new("byline", json!({"by": "ed"}))],
    );
    envelope.connection_id = Some("publisher".into());
    envelope.timestamp = Some(1_700_000_000_000);
    conn.deliver(envelope);

    let first = messages.recv().await.expect("first");
    assert_eq!(first.name.as_deref(), Some("headline"));
    assert_eq!(first.id.as_deref(), Some("srv-1:0"));
    assert_eq!(first.connection_id.as_deref(), Some("publisher"));
    assert_eq!(first.timestamp, Some(1_700_000_000_000));
    let second = messages.recv().await.expect("second");
    assert_eq!(second.id.as_deref(), Some("srv-1:1"));
    assert_eq!(second.data, json!({"by": "ed"}));
}

#[test_timeout::tokio_timeout_test(10)]
async fn delta_from_an_unknown_message_recovers_from_the_last_serial() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("deltas");
    let attach = spawn_attach(&channel);
    common::accept_attach(&mut conn, "deltas").await;
    attach.await.expect("join").expect("attached");
    let mut events = channel.events();

    conn.deliver(message("deltas", "srv-1", "deltas:1", vec![Message::new("full", "v1")]));
    let mut delta = Message::new("full", "patch");
    delta.extras = Some(json!({"delta": {"from": "somewhere-else", "format": "vcdiff"}}));
    conn.deliver(message("deltas", "srv-2", "deltas:2", vec![delta]));

    let event = loop {
        if let ChannelEvent::StateChanged(change) = events.recv().await.expect("event") {
            break change;
        }
    };
    assert_eq!(event.current, ChannelState::Attaching);
    assert_eq!(
        event.reason.as_ref().and_then(|e| e.code),
        Some(codes::DELTA_DECODE_FAILED)
    );
    let reattach = conn.next_sent_of(Action::Attach).await.expect("reattach");
    assert_eq!(reattach.channel_serial.as_deref(), Some("deltas:1"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn closing_the_connection_detaches_channels() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("bye");
    let attach = spawn_attach(&channel);
    common::accept_attach(&mut conn, "bye").await;
    attach.await.expect("join").expect("attached");
    let mut events = channel.events();

    client.close();
    wait_for_state(&mut events, ChannelState::Detached).await;

    let err = channel.publish("late", "x").await.expect_err("connection closed");
    assert!(err.error_info().is_some());
}

#[test_timeout::tokio_timeout_test(10)]
async fn set_options_reattaches_with_new_params() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("tuned");
    let attach = spawn_attach(&channel);
    common::accept_attach(&mut conn, "tuned").await;
    attach.await.expect("join").expect("attached");

    let options = ChannelOptions {
        params: BTreeMap::from([("rewind".to_string(), "1".to_string())]),
        ..ChannelOptions::default()
    };
    assert!(client.channels().get_with_options("tuned", options.clone()).is_err());

    let update = tokio::spawn({
        let channel = channel.clone();
        async move { channel.set_options(options).await }
    });
    let attach = conn.next_sent_of(Action::Attach).await.expect("reattach");
    assert_eq!(
        attach.params.as_ref().and_then(|p| p.get("rewind")).map(String::as_str),
        Some("1")
    );
    let mut granted = common::attached("tuned");
    granted.params = attach.params.clone();
    conn.deliver(granted);
    update.await.expect("join").expect("options applied");
    assert_eq!(channel.params().get("rewind").map(String::as_str), Some("1"));
    assert_eq!(channel.state(), ChannelState::Attached);
}

#[test_timeout::tokio_timeout_test(10)]
async fn release_forgets_detached_channels_only() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("temp");
    let attach = spawn_attach(&channel);
    common::accept_attach(&mut conn, "temp").await;
    attach.await.expect("join").expect("attached");

    let err = client.channels().release("temp").await.expect_err("still attached");
    assert_eq!(
        err.error_info().and_then(|e| e.code),
        Some(codes::CHANNEL_OPERATION_FAILED)
    );
    assert!(client.channels().exists("temp"));

    let detach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.detach().await }
    });
    conn.next_sent_of(Action::Detach).await.expect("detach sent");
    conn.deliver(ProtocolMessage::for_channel(Action::Detached, "temp"));
    detach.await.expect("join").expect("detached");

    client.channels().release("temp").await.expect("released");
    assert!(!client.channels().exists("temp"));
    let err = channel.attach().await.expect_err("released");
    assert_eq!(
        err.error_info().and_then(|e| e.code),
        Some(codes::CHANNEL_OPERATION_FAILED)
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn replayed_connection_serials_are_dropped() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("dedupe");
    let subscribe = tokio::spawn({
        let channel = channel.clone();
        async move { channel.subscribe().await }
    });
    common::accept_attach(&mut conn, "dedupe").await;
    let mut messages = subscribe.await.expect("join").expect("subscribed");

    for (id, serial, name) in [("srv-1", 5, "first"), ("srv-1", 5, "replay"), ("srv-2", 6, "second")] {
        let mut envelope = message("dedupe", id, &format!("dedupe:{serial}"), vec![Message::new(name, "x")]);
        envelope.connection_serial = Some(serial);
        conn.deliver(envelope);
    }

    let first = messages.recv().await.expect("first");
    assert_eq!(first.name.as_deref(), Some("first"));
    let second = messages.recv().await.expect("second");
    assert_eq!(second.name.as_deref(), Some("second"));
    assert_eq!(client.connection().serial(), Some(6));
}
