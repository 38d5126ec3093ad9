mod common;

use realtime_client::protocol::{Action, AttachFlags, ProtocolMessage};
use realtime_client::transport::mock::{MockConnection, MockHub};
use realtime_client::{ClientOptions, PresenceAction, PresenceMessage, PresenceQuery, Realtime};
use serde_json::json;

fn options() -> ClientOptions {
    ClientOptions {
        client_id: Some("me".into()),
        ..common::options()
    }
}

fn member(action: PresenceAction, client_id: &str, connection_id: &str, serial: u32) -> PresenceMessage {
    let mut item = PresenceMessage::new(action, Some(client_id.into()), json!(client_id));
    item.connection_id = Some(connection_id.into());
    item.id = Some(format!("{connection_id}:{serial}:0"));
    item
}

fn sync_page(channel: &str, serial: &str, members: Vec<PresenceMessage>) -> ProtocolMessage {
    let mut page = ProtocolMessage::presence(channel, members);
    page.action = Action::Sync;
    page.channel_serial = Some(serial.to_string());
    page
}

async fn attached_client(
    hub: &MockHub,
    channel: &str,
    flags: AttachFlags,
) -> (Realtime, MockConnection) {
    let client = common::builder(hub, options()).build().expect("valid options");
    let mut conn = common::connect(hub, &client, "conn-1").await;
    let handle = client.channels().get(channel);
    let attach = tokio::spawn(async move { handle.attach().await });
    conn.next_sent_of(Action::Attach).await.expect("attach sent");
    let mut reply = common::attached(channel);
    reply.flags.attach = flags;
    conn.deliver(reply);
    attach.await.expect("join").expect("attached");
    (client, conn)
}

#[test_timeout::tokio_timeout_test(10)]
async fn enter_attaches_and_resolves_on_ack() {
    let hub = MockHub::new();
    let client = common::builder(&hub, options()).build().expect("valid options");
    let mut conn = common::connect(&hub, &client, "conn-1").await;
    let presence = client.channels().get("room").presence();

    let enter = tokio::spawn({
        let presence = presence.clone();
        async move { presence.enter(json!({"status": "here"})).await }
    });
    common::accept_attach(&mut conn, "room").await;

    let sent = conn.next_sent_of(Action::Presence).await.expect("presence sent");
    assert_eq!(sent.channel.as_deref(), Some("room"));
    let items = sent.presence.expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].action, PresenceAction::Enter);
    assert_eq!(items[0].data, json!({"status": "here"}));

    conn.ack(sent.msg_serial.expect("serial"), 1);
    enter.await.expect("join").expect("entered");
}

#[test_timeout::tokio_timeout_test(10)]
async fn enter_without_a_client_id_is_refused() {
    let hub = MockHub::new();
    let client = common::client(&hub);
    let _conn = common::connect(&hub, &client, "conn-1").await;
    let presence = client.channels().get("room").presence();

    let err = presence.enter("anon").await.expect_err("no client id");
    assert_eq!(
        err.error_info().and_then(|e| e.code),
        Some(realtime_client::error::codes::INVALID_CLIENT_ID)
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn get_waits_for_a_multi_page_sync() {
    let hub = MockHub::new();
    let (client, conn) = attached_client(&hub, "crowd", AttachFlags::HAS_PRESENCE).await;
    let presence = client.channels().get("crowd").presence();
    assert!(!presence.sync_complete());

    let get = tokio::spawn({
        let presence = presence.clone();
        async move { presence.get(PresenceQuery::default()).await }
    });
    conn.deliver(sync_page(
        "crowd",
        "seq1:page2",
        vec![member(PresenceAction::Present, "alice", "conn-a", 0)],
    ));
    tokio::task::yield_now().await;
    assert!(!get.is_finished());

    conn.deliver(sync_page(
        "crowd",
        "seq1:",
        vec![member(PresenceAction::Present, "bob", "conn-b", 0)],
    ));
    let mut members: Vec<_> = get
        .await
        .expect("join")
        .expect("members")
        .into_iter()
        .filter_map(|m| m.client_id)
        .collect();
    members.sort();
    assert_eq!(members, vec!["alice".to_string(), "bob".to_string()]);
    assert!(presence.sync_complete());
}

#[test_timeout::tokio_timeout_test(10)]
async fn members_missing_from_a_sync_get_a_synthesized_leave() {
    let hub = MockHub::new();
    let (client, conn) = attached_client(&hub, "hall", AttachFlags::empty()).await;
    let presence = client.channels().get("hall").presence();
    let mut events = presence.subscribe().await.expect("subscribed");

    conn.deliver(ProtocolMessage::presence(
        "hall",
        vec![member(PresenceAction::Enter, "old", "conn-old", 0)],
    ));
    let entered = events.recv().await.expect("enter");
    assert_eq!(entered.action, PresenceAction::Enter);
    assert_eq!(entered.client_id.as_deref(), Some("old"));

    conn.deliver(sync_page(
        "hall",
        "seq2:",
        vec![member(PresenceAction::Present, "new", "conn-new", 0)],
    ));
    // The last page closes the sync before its own items are announced.
    let left = events.recv().await.expect("synthesized leave");
    assert_eq!(left.action, PresenceAction::Leave);
    assert_eq!(left.client_id.as_deref(), Some("old"));
    let present = events.recv().await.expect("present");
    assert_eq!(present.client_id.as_deref(), Some("new"));

    let members = presence
        .get(PresenceQuery::default())
        .await
        .expect("members");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].client_id.as_deref(), Some("new"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn own_member_is_re_entered_after_continuity_loss() {
    let hub = MockHub::new();
    let (client, mut conn) = attached_client(&hub, "desk", AttachFlags::empty()).await;
    let presence = client.channels().get("desk").presence();

    let enter = tokio::spawn({
        let presence = presence.clone();
        async move { presence.enter("working").await }
    });
    let sent = conn.next_sent_of(Action::Presence).await.expect("enter sent");
    conn.ack(sent.msg_serial.expect("serial"), 1);
    enter.await.expect("join").expect("entered");

    // The service echoes our own enter back.
    let mut echo = member(PresenceAction::Enter, "me", "conn-1", 0);
    echo.data = json!("working");
    conn.deliver(ProtocolMessage::presence("desk", vec![echo]));

    // ATTACHED without RESUMED on an attached channel: continuity lost.
    conn.deliver(common::attached("desk"));
    let reentry = conn.next_sent_of(Action::Presence).await.expect("re-enter sent");
    let items = reentry.presence.expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].action, PresenceAction::Enter);
    assert_eq!(items[0].client_id.as_deref(), Some("me"));
    assert_eq!(items[0].id.as_deref(), Some("conn-1:0:0"));
    assert_eq!(items[0].data, json!("working"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn leave_before_attaching_is_refused() {
    let hub = MockHub::new();
    let client = common::builder(&hub, options()).build().expect("valid options");
    let _conn = common::connect(&hub, &client, "conn-1").await;
    let presence = client.channels().get("never-attached").presence();

    let err = presence.leave("bye").await.expect_err("not attached");
    assert_eq!(
        err.error_info().and_then(|e| e.code),
        Some(realtime_client::error::codes::PRESENCE_STATE_MISMATCH)
    );
}
