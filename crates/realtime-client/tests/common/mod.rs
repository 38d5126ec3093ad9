#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use realtime_client::connection::ConnectionEvent;
use realtime_client::protocol::{Action, ProtocolMessage};
use realtime_client::transport::TransportRegistry;
use realtime_client::transport::mock::{MockConnection, MockHub};
use realtime_client::{
    ClientOptions, ConnectionState, ConnectivityCheck, Realtime, RealtimeBuilder, TransportKind,
};
use tokio::sync::broadcast;

pub const PRIMARY_HOST: &str = "realtime.test";
pub const FALLBACK_HOSTS: [&str; 2] = ["a.fallback.test", "b.fallback.test"];

/// Connectivity check with a fixed answer.
pub struct Reachable(pub bool);

#[async_trait]
impl ConnectivityCheck for Reachable {
    async fn check(&self) -> bool {
        self.0
    }
}

pub fn options() -> ClientOptions {
    ClientOptions {
        realtime_host: Some(PRIMARY_HOST.into()),
        fallback_hosts: Some(FALLBACK_HOSTS.iter().map(|h| h.to_string()).collect()),
        transports: vec![TransportKind::WebSocket],
        auto_connect: false,
        ..ClientOptions::with_key("app.key:secret")
    }
}

pub fn builder(hub: &MockHub, options: ClientOptions) -> RealtimeBuilder {
    let mut registry = TransportRegistry::new();
    for kind in &options.transports {
        registry.register(Arc::new(hub.factory(*kind)));
    }
    Realtime::builder(options)
        .transports(registry)
        .connectivity_check(Arc::new(Reachable(true)))
}

pub fn client(hub: &MockHub) -> Realtime {
    builder(hub, options()).build().expect("valid options")
}

/// Connects `client` over the next mock transport as `connection_id`.
pub async fn connect(hub: &MockHub, client: &Realtime, connection_id: &str) -> MockConnection {
    client.connect();
    let conn = hub.next_connection().await.expect("transport created");
    conn.connected(connection_id, &format!("{connection_id}-key"));
    client
        .connection()
        .wait_for(ConnectionState::Connected)
        .await
        .expect("connected");
    conn
}

/// States seen on `events` until `last` shows up.
pub async fn states_until(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    last: ConnectionState,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv().await {
        if let ConnectionEvent::StateChanged(change) = event {
            seen.push(change.current);
            if change.current == last {
                break;
            }
        }
    }
    seen
}

pub fn attached(channel: &str) -> ProtocolMessage {
    let mut message = ProtocolMessage::for_channel(Action::Attached, channel);
    message.channel_serial = Some(format!("{channel}-serial"));
    message
}

/// Answers the next ATTACH on `conn` with ATTACHED.
pub async fn accept_attach(conn: &mut MockConnection, channel: &str) {
    let attach = conn.next_sent_of(Action::Attach).await.expect("attach sent");
    assert_eq!(attach.channel.as_deref(), Some(channel));
    conn.deliver(attached(channel));
}
