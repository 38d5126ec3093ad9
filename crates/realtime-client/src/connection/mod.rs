//! Connection state, the public [`Connection`] handle and the manager that
//! drives transports on the engine task.

pub(crate) mod manager;
pub(crate) mod timers;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenDetails;
use crate::client::{Command, call};
use crate::error::{ErrorInfo, RealtimeError};
use crate::transport::{TransportId, TransportParams};

pub(crate) use manager::ConnectionManager;
pub(crate) use timers::{TimerKey, Timers};

/// Connection states as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Manager-internal states. `Synchronizing` is the upgrade handover and
/// shows as `connected` publicly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManagerState {
    Initialized,
    Connecting,
    Connected,
    Synchronizing,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ManagerState {
    pub fn public(self) -> ConnectionState {
        match self {
            ManagerState::Initialized => ConnectionState::Initialized,
            ManagerState::Connecting => ConnectionState::Connecting,
            ManagerState::Connected | ManagerState::Synchronizing => ConnectionState::Connected,
            ManagerState::Disconnected => ConnectionState::Disconnected,
            ManagerState::Suspended => ConnectionState::Suspended,
            ManagerState::Closing => ConnectionState::Closing,
            ManagerState::Closed => ConnectionState::Closed,
            ManagerState::Failed => ConnectionState::Failed,
        }
    }

    pub fn send_events(self) -> bool {
        self == ManagerState::Connected
    }

    /// Queues even when the caller asked not to.
    pub fn force_queue_events(self) -> bool {
        self == ManagerState::Synchronizing
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ManagerState::Closed | ManagerState::Failed)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Synchronizing => f.write_str("synchronizing"),
            other => f.write_str(other.public().name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// Set when entering a state that retries by itself.
    pub retry_in: Option<Duration>,
    pub reason: Option<ErrorInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionStateChange),
    /// Connection details changed (e.g. after a reauth) without a state change.
    Update(ConnectionStateChange),
}

impl ConnectionEvent {
    pub fn change(&self) -> &ConnectionStateChange {
        match self {
            ConnectionEvent::StateChanged(change) | ConnectionEvent::Update(change) => change,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub id: Option<String>,
    pub key: Option<String>,
    pub serial: Option<i64>,
    pub recovery_key: Option<String>,
    pub error_reason: Option<ErrorInfo>,
}

/// What the engine publishes and the handles read.
#[derive(Clone)]
pub(crate) struct ConnectionShared {
    pub snapshot: Arc<RwLock<ConnectionSnapshot>>,
    pub events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionShared {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            snapshot: Arc::new(RwLock::new(ConnectionSnapshot::default())),
            events,
        }
    }

    pub fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

pub(crate) type AuthReply = oneshot::Sender<Result<Option<TokenDetails>, ErrorInfo>>;

/// Results of suspension points, timer expiries and other work the engine
/// started and must pick up again.
pub(crate) enum Input {
    Timer {
        key: TimerKey,
        generation: u64,
    },
    Authorized {
        scope: CancellationToken,
        result: Result<Option<TokenDetails>, ErrorInfo>,
    },
    /// Forced token after a transport attempt hit a token error.
    TokenRenewed {
        scope: CancellationToken,
        result: Result<Option<TokenDetails>, ErrorInfo>,
        retry: manager::Attempt,
    },
    Reauthorized {
        result: Result<Option<TokenDetails>, ErrorInfo>,
        reply: Option<AuthReply>,
    },
    Connectivity {
        scope: CancellationToken,
        reachable: bool,
        params: TransportParams,
        candidates: Vec<String>,
    },
    /// The session being upgraded away from has nothing left in flight.
    Drained {
        transport: TransportId,
    },
}

/// `<connectionKey>:<connectionSerial>:<msgSerial>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecoveryKey {
    pub connection_key: String,
    pub connection_serial: i64,
    pub msg_serial: i64,
}

impl RecoveryKey {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.rsplitn(3, ':');
        let msg_serial = parts.next()?.parse().ok()?;
        let connection_serial = parts.next()?.parse().ok()?;
        let connection_key = parts.next()?.to_string();
        if connection_key.is_empty() {
            return None;
        }
        Some(Self {
            connection_key,
            connection_serial,
            msg_serial,
        })
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.connection_key, self.connection_serial, self.msg_serial
        )
    }
}

/// Handle on the client's connection.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    shared: ConnectionShared,
}

impl Connection {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, shared: ConnectionShared) -> Self {
        Self { commands, shared }
    }

    /// Starts connecting unless already connecting or connected.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.snapshot.read().state
    }

    pub fn id(&self) -> Option<String> {
        self.shared.snapshot.read().id.clone()
    }

    pub fn key(&self) -> Option<String> {
        self.shared.snapshot.read().key.clone()
    }

    pub fn serial(&self) -> Option<i64> {
        self.shared.snapshot.read().serial
    }

    /// Pass as `ClientOptions::recover` to resume this connection from a new client.
    pub fn recovery_key(&self) -> Option<String> {
        self.shared.snapshot.read().recovery_key.clone()
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.snapshot.read().error_reason.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Round trip of a HEARTBEAT on the active transport.
    pub async fn ping(&self) -> Result<Duration, RealtimeError> {
        call(&self.commands, Command::Ping).await
    }

    /// Fetches a fresh token and applies it to the live connection.
    pub async fn authorize(&self) -> Result<Option<TokenDetails>, RealtimeError> {
        call(&self.commands, Command::Authorize).await
    }

    /// Resolves once the connection is in `state`.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<(), RealtimeError> {
        let mut events = self.subscribe();
        if self.state() == state {
            return Ok(());
        }
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::StateChanged(change)) if change.current == state => {
                    return Ok(());
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.state() == state {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RealtimeError::Shutdown),
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.shared.snapshot.read();
        f.debug_struct("Connection")
            .field("state", &snapshot.state)
            .field("id", &snapshot.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_key_round_trips_keys_with_colons() {
        let parsed = RecoveryKey::parse("abc!def:x:17:4").unwrap();
        assert_eq!(parsed.connection_key, "abc!def:x");
        assert_eq!(parsed.connection_serial, 17);
        assert_eq!(parsed.msg_serial, 4);
        assert_eq!(parsed.to_string(), "abc!def:x:17:4");
    }

    #[test]
    fn malformed_recovery_keys_are_rejected() {
        assert!(RecoveryKey::parse("no-serials").is_none());
        assert!(RecoveryKey::parse("key:1").is_none());
        assert!(RecoveryKey::parse(":1:2").is_none());
        assert!(RecoveryKey::parse("key:one:2").is_none());
    }

    #[test]
    fn synchronizing_looks_connected() {
        assert_eq!(ManagerState::Synchronizing.public(), ConnectionState::Connected);
        assert!(!ManagerState::Synchronizing.send_events());
        assert!(ManagerState::Synchronizing.force_queue_events());
        assert_eq!(ManagerState::Synchronizing.to_string(), "synchronizing");
    }
}
