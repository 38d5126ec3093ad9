//! In-memory transports for tests and demos.
//!
//! Each transport the client creates shows up on the [`MockHub`] as a
//! [`MockConnection`] once `connect()` is called; the holder plays the
//! server side.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{
    Transport, TransportCore, TransportEvent, TransportFactory, TransportId, TransportParams,
    TransportSink,
};
use crate::config::TransportKind;
use crate::error::ErrorInfo;
use crate::protocol::{Action, ConnectionDetails, ProtocolMessage};

#[derive(Clone)]
pub struct MockHub {
    tx: mpsc::UnboundedSender<MockConnection>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<MockConnection>>>,
    created: Arc<AtomicUsize>,
}

impl Default for MockHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn factory(&self, kind: TransportKind) -> MockTransportFactory {
        MockTransportFactory {
            kind,
            hub: self.clone(),
        }
    }

    /// Waits for the client to start connecting another transport.
    pub async fn next_connection(&self) -> Option<MockConnection> {
        self.rx.lock().await.recv().await
    }

    pub fn try_next_connection(&self) -> Option<MockConnection> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Transports created so far, connected or not.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

pub struct MockTransportFactory {
    kind: TransportKind,
    hub: MockHub,
}

impl TransportFactory for MockTransportFactory {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn create(
        &self,
        id: TransportId,
        params: TransportParams,
        sink: TransportSink,
        cancel: CancellationToken,
    ) -> Arc<dyn Transport> {
        self.hub.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockTransport {
            core: TransportCore::new(id, self.kind, params, sink, cancel),
            hub: self.hub.tx.clone(),
        })
    }
}

struct MockTransport {
    core: Arc<TransportCore>,
    hub: mpsc::UnboundedSender<MockConnection>,
}

impl Transport for MockTransport {
    fn id(&self) -> TransportId {
        self.core.id()
    }

    fn kind(&self) -> TransportKind {
        self.core.kind()
    }

    fn params(&self) -> &TransportParams {
        self.core.params()
    }

    fn connect(&self) {
        let sent = self.core.open_outbound();
        let _ = self.hub.send(MockConnection {
            core: Arc::clone(&self.core),
            sent,
        });
    }

    fn send(&self, message: ProtocolMessage) -> Result<(), ErrorInfo> {
        self.core.send(message)
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn disconnect(&self, error: Option<ErrorInfo>) {
        self.core.disconnect(error);
    }

    fn fail(&self, error: ErrorInfo) {
        self.core.fail(error);
    }

    fn close(&self) {
        self.core.close();
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}

/// The server end of one mock transport.
pub struct MockConnection {
    core: Arc<TransportCore>,
    sent: mpsc::UnboundedReceiver<ProtocolMessage>,
}

impl MockConnection {
    pub fn id(&self) -> TransportId {
        self.core.id()
    }

    pub fn kind(&self) -> TransportKind {
        self.core.kind()
    }

    pub fn host(&self) -> &str {
        &self.core.params().host
    }

    pub fn params(&self) -> &TransportParams {
        self.core.params()
    }

    /// Value of one connect query parameter.
    pub fn connect_param(&self, key: &str) -> Option<String> {
        self.core
            .params()
            .connect_params()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// Completes the network handshake.
    pub fn accept(&self) {
        self.core.emit(TransportEvent::Preconnect);
    }

    /// Completes both handshakes with the given identity.
    pub fn connected(&self, connection_id: &str, connection_key: &str) {
        self.connected_with(connection_id, connection_key, ConnectionDetails::default());
    }

    pub fn connected_with(
        &self,
        connection_id: &str,
        connection_key: &str,
        details: ConnectionDetails,
    ) {
        self.accept();
        let mut message = ProtocolMessage::new(Action::Connected);
        message.connection_id = Some(connection_id.to_string());
        message.connection_key = Some(connection_key.to_string());
        message.connection_serial = Some(-1);
        message.connection_details = Some(ConnectionDetails {
            connection_key: Some(connection_key.to_string()),
            ..details
        });
        self.deliver(message);
    }

    pub fn deliver(&self, message: ProtocolMessage) {
        self.core.on_protocol_message(message);
    }

    pub fn ack(&self, serial: i64, count: i64) {
        let mut message = ProtocolMessage::new(Action::Ack);
        message.msg_serial = Some(serial);
        message.count = Some(count);
        self.deliver(message);
    }

    /// Rejects the attempt before any protocol traffic.
    pub fn refuse(&self, error: ErrorInfo) {
        self.core.disconnect(Some(error));
    }

    /// Simulates the network dropping an established connection.
    pub fn drop_connection(&self) {
        self.core
            .disconnect(Some(ErrorInfo::network("connection reset by peer")));
    }

    pub async fn next_sent(&mut self) -> Option<ProtocolMessage> {
        self.sent.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<ProtocolMessage> {
        self.sent.try_recv().ok()
    }

    /// Waits for the next envelope with `action`, skipping others.
    pub async fn next_sent_of(&mut self, action: Action) -> Option<ProtocolMessage> {
        while let Some(message) = self.sent.recv().await {
            if message.action == action {
                return Some(message);
            }
        }
        None
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.core.id())
            .field("kind", &self.core.kind())
            .field("params", self.core.params())
            .finish()
    }
}
