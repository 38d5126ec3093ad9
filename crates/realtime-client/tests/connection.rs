mod common;

use async_trait::async_trait;
use common::{FALLBACK_HOSTS, PRIMARY_HOST, Reachable};
use realtime_client::error::codes;
use realtime_client::protocol::{Action, ProtocolMessage};
use realtime_client::transport::mock::MockHub;
use realtime_client::{
    AuthProvider, ClientOptions, ConnectionEvent, ConnectionState, ErrorInfo, Realtime,
    TokenDetails, TokenParams, TransportKind,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::{Duration, Instant};

#[test_timeout::tokio_timeout_test(10)]
async fn connect_then_close_walks_the_states() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut events = client.connection().subscribe();

    let mut conn = common::connect(&hub, &client, "conn-1").await;
    assert_eq!(conn.host(), PRIMARY_HOST);
    assert_eq!(conn.kind(), TransportKind::WebSocket);
    assert_eq!(client.connection().id().as_deref(), Some("conn-1"));
    assert_eq!(client.connection().key().as_deref(), Some("conn-1-key"));

    client.close();
    let close = conn.next_sent_of(Action::Close).await.expect("close sent");
    assert_eq!(close.action, Action::Close);

    let seen = common::states_until(&mut events, ConnectionState::Closed).await;
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ]
    );
    assert_eq!(client.connection().id(), None);
}

#[test_timeout::tokio_timeout_test(10)]
async fn messages_queued_before_connect_go_out_bundled_and_in_order() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let channel = client.channels().get("orders");

    let first = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("one", 1).await }
    });
    let second = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("two", 2).await }
    });
    // Both publishes have to reach the engine before the connection opens.
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert_eq!(hub.created(), 0);

    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let sent = conn.next_sent_of(Action::Message).await.expect("bundle sent");
    assert_eq!(sent.msg_serial, Some(0));
    let names: Vec<_> = sent
        .messages
        .iter()
        .flatten()
        .filter_map(|m| m.name.clone())
        .collect();
    assert_eq!(names, vec!["one".to_string(), "two".to_string()]);

    conn.ack(0, 1);
    first.await.expect("join").expect("first acked");
    second.await.expect("join").expect("second acked");
}

#[test_timeout::tokio_timeout_test(10)]
async fn acks_resolve_exactly_the_serials_they_cover() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("acks");

    let mut publishes = Vec::new();
    for n in 0..3 {
        let channel = channel.clone();
        publishes.push(tokio::spawn(async move { channel.publish("n", n).await }));
        let sent = conn.next_sent_of(Action::Message).await.expect("published");
        assert_eq!(sent.msg_serial, Some(n));
    }

    conn.ack(0, 2);
    let mut publishes = publishes.into_iter();
    publishes.next().expect("0").await.expect("join").expect("acked");
    publishes.next().expect("1").await.expect("join").expect("acked");
    let last = publishes.next().expect("2");
    tokio::task::yield_now().await;
    assert!(!last.is_finished());

    let mut nack = ProtocolMessage::new(Action::Nack);
    nack.msg_serial = Some(2);
    nack.count = Some(1);
    nack.error = Some(ErrorInfo::new("rejected", 40000, 400));
    conn.deliver(nack);
    let err = last.await.expect("join").expect_err("nacked");
    assert!(err.to_string().contains("rejected"), "{err}");
}

#[test_timeout::tokio_timeout_test(10)]
async fn dropped_connection_resumes_and_resends_with_the_same_serial() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("resume");

    let publish = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("keep", "me").await }
    });
    let sent = conn.next_sent_of(Action::Message).await.expect("published");
    assert_eq!(sent.msg_serial, Some(0));

    conn.drop_connection();
    let mut resumed = hub.next_connection().await.expect("reconnect attempt");
    assert_eq!(resumed.connect_param("resume").as_deref(), Some("conn-1-key"));
    resumed.connected("conn-1", "conn-1-key-2");

    let again = resumed.next_sent_of(Action::Message).await.expect("resent");
    assert_eq!(again.msg_serial, Some(0));
    resumed.ack(0, 1);
    publish.await.expect("join").expect("acked after resume");
    assert_eq!(client.connection().id().as_deref(), Some("conn-1"));
    assert_eq!(client.connection().key().as_deref(), Some("conn-1-key-2"));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn unreachable_service_suspends_after_the_state_ttl() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let refuser = tokio::spawn({
        let hub = hub.clone();
        async move {
            while let Some(conn) = hub.next_connection().await {
                conn.refuse(ErrorInfo::network("connection refused"));
            }
        }
    });

    client.connect();
    client
        .connection()
        .wait_for(ConnectionState::Suspended)
        .await
        .expect("suspended");
    let reason = client.connection().error_reason().expect("reason");
    assert_eq!(reason.code, Some(codes::CONNECTION_SUSPENDED));
    // The primary and both fallbacks were tried at least once.
    assert!(hub.created() >= 3);
    refuser.abort();
}

#[test_timeout::tokio_timeout_test(10)]
async fn failed_primary_moves_on_to_a_fallback_host() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    client.connect();

    let primary = hub.next_connection().await.expect("primary attempt");
    assert_eq!(primary.host(), PRIMARY_HOST);
    primary.refuse(ErrorInfo::network("connection refused"));

    let fallback = hub.next_connection().await.expect("fallback attempt");
    assert!(FALLBACK_HOSTS.contains(&fallback.host()), "{}", fallback.host());
    fallback.connected("conn-1", "conn-1-key");
    client
        .connection()
        .wait_for(ConnectionState::Connected)
        .await
        .expect("connected via fallback");
}

#[test_timeout::tokio_timeout_test(10)]
async fn offline_client_does_not_burn_fallback_hosts() {
    let hub = MockHub::new();
    let client = common::builder(&hub, common::options())
        .connectivity_check(Arc::new(Reachable(false)))
        .build()
        .expect("valid options");
    let mut events = client.connection().subscribe();
    client.connect();

    let primary = hub.next_connection().await.expect("primary attempt");
    primary.refuse(ErrorInfo::network("connection refused"));

    let seen = common::states_until(&mut events, ConnectionState::Disconnected).await;
    assert_eq!(seen.last(), Some(&ConnectionState::Disconnected));
    let reason = client.connection().error_reason().expect("reason");
    assert_eq!(reason.code, Some(codes::DISCONNECTED));
    assert_eq!(reason.status_code, Some(404));
    assert_eq!(hub.created(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn connection_error_from_the_service_fails_the_connection() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    client.connect();

    let primary = hub.next_connection().await.expect("primary attempt");
    let mut refusal = ProtocolMessage::new(Action::Error);
    refusal.error = Some(ErrorInfo::new("account disabled", 40300, 403));
    primary.deliver(refusal);
    client
        .connection()
        .wait_for(ConnectionState::Failed)
        .await
        .expect("failed");
    assert_eq!(client.connection().error_reason().and_then(|e| e.code), Some(40300));
    assert_eq!(hub.created(), 1);
}

fn upgrading_options() -> realtime_client::ClientOptions {
    realtime_client::ClientOptions {
        transports: vec![TransportKind::WebSocket, TransportKind::Comet],
        ..common::options()
    }
}

fn sync(connection_id: &str) -> ProtocolMessage {
    let mut message = ProtocolMessage::new(Action::Sync);
    message.connection_id = Some(connection_id.to_string());
    message
}

#[test_timeout::tokio_timeout_test(10)]
async fn upgrade_hands_over_to_websocket() {
    let hub = MockHub::new();
    let client = common::builder(&hub, upgrading_options())
        .build()
        .expect("valid options");

    let comet = common::connect(&hub, &client, "conn-1").await;
    assert_eq!(comet.kind(), TransportKind::Comet);

    let mut ws = hub.next_connection().await.expect("upgrade attempt");
    assert_eq!(ws.kind(), TransportKind::WebSocket);
    assert_eq!(ws.connect_param("upgrade").as_deref(), Some("conn-1-key"));
    ws.connected("conn-1", "conn-1-key");
    let handshake = ws.next_sent_of(Action::Sync).await.expect("sync sent");
    assert_eq!(handshake.connection_key.as_deref(), Some("conn-1-key"));
    ws.deliver(sync("conn-1"));

    let channel = client.channels().get("after-upgrade");
    let publish = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("via", "ws").await }
    });
    let sent = ws.next_sent_of(Action::Message).await.expect("published on ws");
    ws.ack(sent.msg_serial.expect("serial"), 1);
    publish.await.expect("join").expect("acked");

    while !comet.is_disposed() {
        tokio::task::yield_now().await;
    }
    assert_eq!(client.connection().state(), ConnectionState::Connected);
    assert_eq!(client.connection().id().as_deref(), Some("conn-1"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn upgrade_to_a_new_connection_reattaches_channels() {
    let hub = MockHub::new();
    let client = common::builder(&hub, upgrading_options())
        .build()
        .expect("valid options");

    let mut comet = common::connect(&hub, &client, "conn-1").await;
    let mut ws = hub.next_connection().await.expect("upgrade attempt");

    let channel = client.channels().get("room");
    let attach = tokio::spawn({
        let channel = channel.clone();
        async move { channel.attach().await }
    });
    common::accept_attach(&mut comet, "room").await;
    attach.await.expect("join").expect("attached");

    ws.connected("conn-2", "conn-2-key");
    ws.next_sent_of(Action::Sync).await.expect("sync sent");
    ws.deliver(sync("conn-2"));

    let reattach = ws.next_sent_of(Action::Attach).await.expect("reattach on ws");
    assert_eq!(reattach.channel.as_deref(), Some("room"));
    assert_eq!(client.connection().id().as_deref(), Some("conn-2"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn ping_measures_a_heartbeat_round_trip() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;

    let ping = tokio::spawn({
        let connection = client.connection().clone();
        async move { connection.ping().await }
    });
    let heartbeat = conn.next_sent_of(Action::Heartbeat).await.expect("heartbeat sent");
    conn.deliver(ProtocolMessage::heartbeat(heartbeat.id));
    ping.await.expect("join").expect("pong");
}

#[test_timeout::tokio_timeout_test(10)]
async fn handles_fail_once_the_client_shuts_down() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let channel = client.channels().get("late");
    client.shutdown();
    let err = channel.attach().await.expect_err("engine is gone");
    assert!(matches!(err, realtime_client::RealtimeError::Shutdown));
}

#[test_timeout::tokio_timeout_test(60, paused)]
async fn suspended_connection_starts_afresh() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let channel = client.channels().get("fresh");

    let publish = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("before", 1).await }
    });
    let sent = conn.next_sent_of(Action::Message).await.expect("published");
    assert_eq!(sent.msg_serial, Some(0));
    conn.ack(0, 1);
    publish.await.expect("join").expect("acked");

    conn.drop_connection();
    let suspended = client.connection().wait_for(ConnectionState::Suspended);
    tokio::pin!(suspended);
    loop {
        tokio::select! {
            reached = &mut suspended => {
                reached.expect("suspended");
                break;
            }
            attempt = hub.next_connection() => {
                attempt.expect("attempt").refuse(ErrorInfo::network("connection refused"));
            }
        }
    }
    assert_eq!(client.connection().id(), None);
    assert_eq!(client.connection().key(), None);
    assert_eq!(client.connection().serial(), None);
    assert_eq!(client.connection().recovery_key(), None);

    // Attempts abandoned by the suspension may still be queued on the hub.
    let mut fresh = loop {
        let attempt = hub.next_connection().await.expect("attempt after suspension");
        if !attempt.is_disposed() {
            break attempt;
        }
    };
    assert_eq!(fresh.connect_param("resume"), None);
    assert_eq!(fresh.connect_param("recover"), None);
    fresh.connected("conn-2", "conn-2-key");
    client
        .connection()
        .wait_for(ConnectionState::Connected)
        .await
        .expect("connected again");

    let publish = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("after", 2).await }
    });
    let sent = fresh.next_sent_of(Action::Message).await.expect("published");
    assert_eq!(sent.msg_serial, Some(0));
    fresh.ack(0, 1);
    publish.await.expect("join").expect("acked");
}

#[test_timeout::tokio_timeout_test(10)]
async fn upgrade_waits_for_in_flight_messages_on_the_old_transport() {
    let hub = MockHub::new();
    let client = common::builder(&hub, upgrading_options())
        .build()
        .expect("valid options");
    let mut comet = common::connect(&hub, &client, "conn-1").await;
    let mut ws = hub.next_connection().await.expect("upgrade attempt");
    let channel = client.channels().get("ordered");

    let early = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("early", 1).await }
    });
    let in_flight = comet.next_sent_of(Action::Message).await.expect("sent on comet");
    assert_eq!(in_flight.msg_serial, Some(0));

    ws.connected("conn-1", "conn-1-key");
    ws.next_sent_of(Action::Sync).await.expect("sync sent");
    ws.deliver(sync("conn-1"));

    let later = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("later", 2).await }
    });
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    while let Some(sent) = ws.try_next_sent() {
        assert_ne!(sent.action, Action::Message, "sent on ws before comet drained");
    }
    assert!(!comet.is_disposed());
    assert_eq!(client.connection().state(), ConnectionState::Connected);

    comet.ack(0, 1);
    early.await.expect("join").expect("early acked");
    let next = ws.next_sent_of(Action::Message).await.expect("sent on ws");
    assert_eq!(next.msg_serial, Some(1));
    let names: Vec<_> = next.messages.iter().flatten().filter_map(|m| m.name.clone()).collect();
    assert_eq!(names, vec!["later".to_string()]);
    ws.ack(1, 1);
    later.await.expect("join").expect("later acked");

    while !comet.is_disposed() {
        tokio::task::yield_now().await;
    }
}

/// Hands out `tok-1`, `tok-2`, ... one per request.
struct CountingTokens(AtomicUsize);

#[async_trait]
impl AuthProvider for CountingTokens {
    async fn request_token(&self, _params: TokenParams) -> Result<TokenDetails, ErrorInfo> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenDetails::new(format!("tok-{n}")))
    }
}

fn token_client(hub: &MockHub) -> Realtime {
    let options = ClientOptions {
        key: None,
        ..common::options()
    };
    common::builder(hub, options)
        .auth_provider(Arc::new(CountingTokens(AtomicUsize::new(0))))
        .build()
        .expect("valid options")
}

#[test_timeout::tokio_timeout_test(10)]
async fn reauthorization_keeps_the_live_connection() {
    let hub = MockHub::new();
    let client = token_client(&hub);
    let mut events = client.connection().subscribe();
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    assert_eq!(conn.connect_param("access_token").as_deref(), Some("tok-1"));

    // The service asks for a new token in-band.
    conn.deliver(ProtocolMessage::new(Action::Auth));
    let auth = conn.next_sent_of(Action::Auth).await.expect("auth sent");
    assert_eq!(auth.auth.expect("details").access_token, "tok-2");

    let authorize = tokio::spawn({
        let connection = client.connection().clone();
        async move { connection.authorize().await }
    });
    let auth = conn.next_sent_of(Action::Auth).await.expect("auth sent");
    assert_eq!(auth.auth.expect("details").access_token, "tok-3");
    conn.connected("conn-1", "conn-1-key");
    let token = authorize.await.expect("join").expect("authorized").expect("token");
    assert_eq!(token.token, "tok-3");

    loop {
        match events.recv().await.expect("event") {
            ConnectionEvent::Update(change) => {
                assert_eq!(change.current, ConnectionState::Connected);
                break;
            }
            ConnectionEvent::StateChanged(change) => {
                assert_ne!(change.current, ConnectionState::Disconnected);
            }
        }
    }
    assert_eq!(client.connection().state(), ConnectionState::Connected);
    assert_eq!(hub.created(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn reauthorizing_while_connecting_restarts_the_attempt() {
    let hub = MockHub::new();
    let client = token_client(&hub);
    client.connect();
    let first = hub.next_connection().await.expect("first attempt");
    assert_eq!(first.connect_param("access_token").as_deref(), Some("tok-1"));

    let authorize = tokio::spawn({
        let connection = client.connection().clone();
        async move { connection.authorize().await }
    });
    let second = hub.next_connection().await.expect("restarted attempt");
    assert!(first.is_disposed());
    assert_eq!(second.connect_param("access_token").as_deref(), Some("tok-2"));

    second.connected("conn-1", "conn-1-key");
    let token = authorize.await.expect("join").expect("authorized").expect("token");
    assert_eq!(token.token, "tok-2");
    assert_eq!(hub.created(), 2);
}

#[test_timeout::tokio_timeout_test(10)]
async fn server_error_disconnect_moves_to_a_fallback_host() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let conn = common::connect(&hub, &client, "conn-1").await;
    assert_eq!(conn.host(), PRIMARY_HOST);

    let mut disconnected = ProtocolMessage::new(Action::Disconnected);
    disconnected.error = Some(ErrorInfo::new("service unavailable", 50003, 503));
    conn.deliver(disconnected);

    let next = hub.next_connection().await.expect("reconnect attempt");
    assert!(FALLBACK_HOSTS.contains(&next.host()), "{}", next.host());
    assert_eq!(next.connect_param("resume").as_deref(), Some("conn-1-key"));
    next.connected("conn-1", "conn-1-key");
    client
        .connection()
        .wait_for(ConnectionState::Connected)
        .await
        .expect("connected via fallback");
    assert_eq!(hub.created(), 2);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn silent_preferred_transport_gives_way_to_the_base_transport() {
    let hub = MockHub::new();
    let client = common::builder(&hub, upgrading_options())
        .build()
        .expect("valid options");
    let comet = common::connect(&hub, &client, "conn-1").await;
    let mut ws = hub.next_connection().await.expect("upgrade attempt");
    ws.connected("conn-1", "conn-1-key");
    ws.next_sent_of(Action::Sync).await.expect("sync sent");
    ws.deliver(sync("conn-1"));
    while !comet.is_disposed() {
        tokio::task::yield_now().await;
    }

    ws.drop_connection();
    let started = Instant::now();
    let preferred = hub.next_connection().await.expect("preferred attempt");
    assert_eq!(preferred.kind(), TransportKind::WebSocket);
    assert_eq!(preferred.connect_param("resume").as_deref(), Some("conn-1-key"));

    let base = hub.next_connection().await.expect("base attempt");
    assert_eq!(base.kind(), TransportKind::Comet);
    assert_eq!(base.host(), PRIMARY_HOST);
    assert!(started.elapsed() >= Duration::from_secs(6));
    assert!(preferred.is_disposed());

    base.connected("conn-1", "conn-1-key");
    client
        .connection()
        .wait_for(ConnectionState::Connected)
        .await
        .expect("connected on the base transport");
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn immediate_reconnects_are_spaced_a_second_apart() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let conn = common::connect(&hub, &client, "conn-1").await;

    let dropped = Instant::now();
    conn.drop_connection();
    let second = hub.next_connection().await.expect("first reconnect");
    assert!(dropped.elapsed() < Duration::from_secs(1));
    second.connected("conn-1", "conn-1-key");
    client
        .connection()
        .wait_for(ConnectionState::Connected)
        .await
        .expect("reconnected");

    let dropped = Instant::now();
    second.drop_connection();
    let third = hub.next_connection().await.expect("second reconnect");
    assert!(dropped.elapsed() >= Duration::from_millis(900), "{:?}", dropped.elapsed());
    assert_eq!(third.connect_param("resume").as_deref(), Some("conn-1-key"));
}
