pub mod comet;
pub mod core;
pub mod mock;
pub mod websocket;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{LIBRARY_ID, PROTOCOL_VERSION, Timeouts, TransportKind};
use crate::error::ErrorInfo;
use crate::protocol::codec::WireCodec;
use crate::protocol::{ConnectionDetails, ProtocolMessage};

pub use self::core::TransportCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// Lifecycle and protocol events a transport reports to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The network handshake succeeded; the protocol handshake is still pending.
    Preconnect,
    Connected {
        error: Option<ErrorInfo>,
        connection_id: String,
        connection_key: Option<String>,
        connection_serial: Option<i64>,
        details: Option<ConnectionDetails>,
    },
    Heartbeat {
        id: Option<String>,
    },
    Ack {
        serial: i64,
        count: i64,
    },
    Nack {
        serial: i64,
        count: i64,
        error: Option<ErrorInfo>,
    },
    /// Reply to the SYNC sent during an upgrade.
    Sync {
        connection_serial: Option<i64>,
        connection_id: String,
    },
    Message(ProtocolMessage),
    Disconnected(ErrorInfo),
    Closed(ErrorInfo),
    Failed(ErrorInfo),
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::Preconnect => "preconnect",
            TransportEvent::Connected { .. } => "connected",
            TransportEvent::Heartbeat { .. } => "heartbeat",
            TransportEvent::Ack { .. } => "ack",
            TransportEvent::Nack { .. } => "nack",
            TransportEvent::Sync { .. } => "sync",
            TransportEvent::Message(_) => "protocol_message",
            TransportEvent::Disconnected(_) => "disconnected",
            TransportEvent::Closed(_) => "closed",
            TransportEvent::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub struct TransportSignal {
    pub id: TransportId,
    pub event: TransportEvent,
}

/// Where a transport posts its events; tagged with the transport's id.
#[derive(Clone)]
pub struct TransportSink {
    id: TransportId,
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportSink {
    pub fn new(id: TransportId, tx: mpsc::UnboundedSender<TransportSignal>) -> Self {
        Self { id, tx }
    }

    pub fn emit(&self, event: TransportEvent) {
        // The engine is gone once the client shuts down.
        let _ = self.tx.send(TransportSignal { id: self.id, event });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Clean,
    Resume,
    Recover,
    Upgrade,
}

impl fmt::Display for ConnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectMode::Clean => "clean",
            ConnectMode::Resume => "resume",
            ConnectMode::Recover => "recover",
            ConnectMode::Upgrade => "upgrade",
        })
    }
}

/// Everything a transport needs to reach one host.
#[derive(Clone)]
pub struct TransportParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub mode: ConnectMode,
    /// Key being resumed, recovered or upgraded.
    pub connection_key: Option<String>,
    pub connection_serial: Option<i64>,
    pub client_id: Option<String>,
    pub echo_messages: bool,
    pub heartbeats: Option<bool>,
    pub stream: Option<bool>,
    pub auth_params: Vec<(String, String)>,
    pub transport_params: BTreeMap<String, String>,
    pub timeouts: Timeouts,
    pub codec: Arc<dyn WireCodec>,
}

impl TransportParams {
    /// Query parameters for the connect request.
    pub fn connect_params(&self) -> Vec<(String, String)> {
        let mut params = self.auth_params.clone();
        let mut push = |k: &str, v: String| params.push((k.to_string(), v));
        match self.mode {
            ConnectMode::Upgrade => {
                if let Some(key) = &self.connection_key {
                    push("upgrade", key.clone());
                }
            }
            ConnectMode::Resume | ConnectMode::Recover => {
                if let Some(key) = &self.connection_key {
                    let name = if self.mode == ConnectMode::Resume {
                        "resume"
                    } else {
                        "recover"
                    };
                    push(name, key.clone());
                    if let Some(serial) = self.connection_serial {
                        push("connection_serial", serial.to_string());
                    }
                }
            }
            ConnectMode::Clean => {}
        }
        if let Some(client_id) = &self.client_id {
            push("clientId", client_id.clone());
        }
        if !self.echo_messages {
            push("echo", "false".into());
        }
        push("format", self.codec.format().param().into());
        if let Some(stream) = self.stream {
            push("stream", stream.to_string());
        }
        if let Some(heartbeats) = self.heartbeats {
            push("heartbeats", heartbeats.to_string());
        }
        push("v", PROTOCOL_VERSION.into());
        push("lib", LIBRARY_ID.into());
        for (key, value) in &self.transport_params {
            match params.iter_mut().find(|(k, _)| k == key) {
                Some(existing) => existing.1 = value.clone(),
                None => params.push((key.clone(), value.clone())),
            }
        }
        params
    }
}

impl fmt::Display for TransportParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[mode={},host={}", self.mode, self.host)?;
        if let Some(key) = &self.connection_key {
            write!(f, ",connectionKey={key}")?;
        }
        write!(f, ",format={}]", self.codec.format())
    }
}

impl fmt::Debug for TransportParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One network mechanism carrying protocol envelopes to one host.
///
/// Methods never block; progress and termination are reported through the
/// [`TransportSink`] given at construction.
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    fn kind(&self) -> TransportKind;

    fn params(&self) -> &TransportParams;

    /// Starts the network handshake in the background.
    fn connect(&self);

    fn send(&self, message: ProtocolMessage) -> Result<(), ErrorInfo>;

    fn is_connected(&self) -> bool;

    /// Drops the transport without telling the server; the connection may be resumed.
    fn disconnect(&self, error: Option<ErrorInfo>);

    /// Asks the server to drop the connection and reports `Failed`.
    fn fail(&self, error: ErrorInfo);

    /// Asks the server to close the connection and reports `Closed`.
    fn close(&self);

    /// Releases sockets and tasks without reporting anything.
    fn dispose(&self);

    fn ping(&self, id: &str) {
        let _ = self.send(ProtocolMessage::heartbeat(Some(id.to_string())));
    }

    fn on_auth_updated(&self, _token: &str) {}
}

pub trait TransportFactory: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn create(
        &self,
        id: TransportId,
        params: TransportParams,
        sink: TransportSink,
        cancel: CancellationToken,
    ) -> Arc<dyn Transport>;
}

/// The transport implementations available to a client.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<TransportKind, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// WebSocket and Comet over the network.
    pub fn network() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(websocket::WebSocketFactory));
        registry.register(Arc::new(comet::CometFactory::default()));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    pub fn get(&self, kind: TransportKind) -> Option<&Arc<dyn TransportFactory>> {
        self.factories.get(&kind)
    }

    pub fn supports(&self, kind: TransportKind) -> bool {
        self.factories.contains_key(&kind)
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("TransportRegistry").field("kinds", &kinds).finish()
    }
}
