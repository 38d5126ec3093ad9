//! State and behaviour shared by every transport variant.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TransportKind;
use crate::error::{ErrorInfo, codes};
use crate::protocol::{Action, ProtocolMessage};

use super::{TransportEvent, TransportId, TransportParams, TransportSink};

struct CoreState {
    connected: bool,
    finished: bool,
    disposed: bool,
    connection_key: Option<String>,
    max_idle: Option<Duration>,
    last_activity: Instant,
}

/// Composed into each transport: finish-once guard, idle watchdog, inbound
/// dispatch and the outbound queue feeding the variant's writer task.
pub struct TransportCore {
    id: TransportId,
    kind: TransportKind,
    params: TransportParams,
    sink: TransportSink,
    cancel: CancellationToken,
    state: Mutex<CoreState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ProtocolMessage>>>,
}

impl TransportCore {
    pub fn new(
        id: TransportId,
        kind: TransportKind,
        params: TransportParams,
        sink: TransportSink,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            params,
            sink,
            cancel,
            state: Mutex::new(CoreState {
                connected: false,
                finished: false,
                disposed: false,
                connection_key: None,
                max_idle: None,
                last_activity: Instant::now(),
            }),
            outbound: Mutex::new(None),
        })
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn params(&self) -> &TransportParams {
        &self.params
    }

    /// Cancelled on dispose; I/O tasks select on it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn connection_key(&self) -> Option<String> {
        self.state.lock().connection_key.clone()
    }

    pub fn emit(&self, event: TransportEvent) {
        trace!(target: "realtime::transport", transport = %self.id, event = event.name(), "emit");
        self.sink.emit(event);
    }

    /// Opens the outbound queue; the returned receiver belongs to the variant's writer.
    pub fn open_outbound(&self) -> mpsc::UnboundedReceiver<ProtocolMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_disposed() {
            *self.outbound.lock() = Some(tx);
        }
        rx
    }

    pub fn send(&self, message: ProtocolMessage) -> Result<(), ErrorInfo> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            debug!(target: "realtime::transport", transport = %self.id, action = %message.action, "no socket connection; dropping send");
            return Err(ErrorInfo::new(
                "No socket connection",
                codes::DISCONNECTED,
                400,
            ));
        };
        tx.send(message).map_err(|_| {
            ErrorInfo::new("Transport is no longer writable", codes::INTERNAL, 500)
        })
    }

    pub fn on_activity(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub fn disconnect(&self, error: Option<ErrorInfo>) {
        self.finish(TransportEvent::Disconnected(
            error.unwrap_or_else(ErrorInfo::disconnected),
        ));
    }

    pub fn fail(&self, error: ErrorInfo) {
        if self.is_connected() {
            let _ = self.send(ProtocolMessage::new(Action::Disconnect));
        }
        self.finish(TransportEvent::Failed(error));
    }

    pub fn close(&self) {
        if self.is_connected() {
            let _ = self.send(ProtocolMessage::new(Action::Close));
        }
        self.finish(TransportEvent::Closed(ErrorInfo::closed()));
    }

    /// Reports the terminal event once, then disposes.
    pub fn finish(&self, event: TransportEvent) {
        {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state.connected = false;
        }
        debug!(target: "realtime::transport", transport = %self.id, event = event.name(), "finished");
        self.emit(event);
        self.dispose();
    }

    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        trace!(target: "realtime::transport", transport = %self.id, "dispose");
        // Dropping the sender lets the writer flush what is already queued.
        self.outbound.lock().take();
        self.cancel.cancel();
    }

    /// Routes one inbound envelope. Every envelope counts as activity for the idle watchdog.
    pub fn on_protocol_message(self: &Arc<Self>, message: ProtocolMessage) {
        if self.is_disposed() {
            return;
        }
        self.on_activity();
        trace!(target: "realtime::transport", transport = %self.id, %message, "received");
        match message.action {
            Action::Heartbeat => self.emit(TransportEvent::Heartbeat { id: message.id }),
            Action::Connected => {
                self.on_connect(&message);
                let connection_key = message.connection_key.clone().or_else(|| {
                    message
                        .connection_details
                        .as_ref()
                        .and_then(|d| d.connection_key.clone())
                });
                self.emit(TransportEvent::Connected {
                    error: message.error,
                    connection_id: message.connection_id.unwrap_or_default(),
                    connection_key,
                    connection_serial: message.connection_serial,
                    details: message.connection_details,
                });
            }
            Action::Closed => self.finish(TransportEvent::Closed(
                message.error.unwrap_or_else(ErrorInfo::closed),
            )),
            Action::Disconnected => self.finish(TransportEvent::Disconnected(
                message.error.unwrap_or_else(ErrorInfo::disconnected),
            )),
            Action::Ack => self.emit(TransportEvent::Ack {
                serial: message.msg_serial.unwrap_or_default(),
                count: message.count.unwrap_or(1),
            }),
            Action::Nack => self.emit(TransportEvent::Nack {
                serial: message.msg_serial.unwrap_or_default(),
                count: message.count.unwrap_or(1),
                error: message.error,
            }),
            Action::Sync if message.connection_id.is_some() => {
                self.emit(TransportEvent::Sync {
                    connection_serial: message.connection_serial,
                    connection_id: message.connection_id.unwrap_or_default(),
                });
            }
            Action::Error if message.channel.is_none() => {
                let error = message.error.unwrap_or_else(ErrorInfo::failed);
                warn!(target: "realtime::transport", transport = %self.id, error = %error, "connection error from server");
                self.fail(error);
            }
            _ => self.emit(TransportEvent::Message(message)),
        }
    }

    fn on_connect(self: &Arc<Self>, message: &ProtocolMessage) {
        let details = message.connection_details.as_ref();
        let max_idle = details
            .and_then(|d| d.max_idle_interval)
            .map(Duration::from_millis);
        {
            let mut state = self.state.lock();
            state.connected = true;
            state.connection_key = details
                .and_then(|d| d.connection_key.clone())
                .or_else(|| message.connection_key.clone());
            state.max_idle = max_idle;
            state.last_activity = Instant::now();
        }
        if let Some(max_idle) = max_idle {
            self.start_idle_watchdog(max_idle + self.params.timeouts.realtime_request);
        }
    }

    fn start_idle_watchdog(self: &Arc<Self>, budget: Duration) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = core.state.lock().last_activity + budget;
                tokio::select! {
                    _ = core.cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                let since = core.state.lock().last_activity.elapsed();
                if since >= budget {
                    let error = ErrorInfo::new(
                        format!(
                            "No activity seen from realtime in {}ms; assuming connection has dropped",
                            since.as_millis()
                        ),
                        codes::DISCONNECTED,
                        408,
                    );
                    warn!(target: "realtime::transport", transport = %core.id, error = %error, "idle timeout");
                    core.disconnect(Some(error));
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::protocol::ConnectionDetails;
    use crate::protocol::codec::JsonCodec;
    use crate::transport::{ConnectMode, TransportSignal};
    use std::collections::BTreeMap;

    fn core() -> (Arc<TransportCore>, mpsc::UnboundedReceiver<TransportSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = TransportId(1);
        let params = TransportParams {
            host: "localhost".into(),
            port: 80,
            tls: false,
            mode: ConnectMode::Clean,
            connection_key: None,
            connection_serial: None,
            client_id: None,
            echo_messages: true,
            heartbeats: None,
            stream: None,
            auth_params: Vec::new(),
            transport_params: BTreeMap::new(),
            timeouts: Timeouts::default(),
            codec: Arc::new(JsonCodec),
        };
        let core = TransportCore::new(
            id,
            TransportKind::WebSocket,
            params,
            TransportSink::new(id, tx),
            CancellationToken::new(),
        );
        (core, rx)
    }

    fn connected(max_idle: u64) -> ProtocolMessage {
        let mut msg = ProtocolMessage::new(Action::Connected);
        msg.connection_id = Some("conn".into());
        msg.connection_details = Some(ConnectionDetails {
            connection_key: Some("conn!key".into()),
            max_idle_interval: Some(max_idle),
            ..ConnectionDetails::default()
        });
        msg
    }

    #[tokio::test]
    async fn finish_runs_once_and_disposes() {
        let (core, mut rx) = core();
        let _writer = core.open_outbound();
        core.disconnect(None);
        core.close();
        core.fail(ErrorInfo::failed());
        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, TransportEvent::Disconnected(_)));
        assert!(rx.try_recv().is_err());
        assert!(core.is_disposed());
        assert!(core.cancel_token().is_cancelled());
        assert!(core.send(ProtocolMessage::heartbeat(None)).is_err());
    }

    #[tokio::test]
    async fn close_when_connected_sends_close_first() {
        let (core, mut rx) = core();
        let mut writer = core.open_outbound();
        core.on_protocol_message(connected(15_000));
        core.close();
        assert_eq!(writer.recv().await.unwrap().action, Action::Close);
        assert!(writer.recv().await.is_none());
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(events[0].event, TransportEvent::Connected { .. }));
        assert!(matches!(events[1].event, TransportEvent::Closed(_)));
    }

    #[tokio::test]
    async fn dispatch_table() {
        let (core, mut rx) = core();
        let mut sync = ProtocolMessage::new(Action::Sync);
        sync.connection_id = Some("conn".into());
        sync.connection_serial = Some(4);
        core.on_protocol_message(sync);
        core.on_protocol_message(ProtocolMessage::for_channel(Action::Sync, "chan"));
        let mut ack = ProtocolMessage::new(Action::Ack);
        ack.msg_serial = Some(3);
        ack.count = Some(2);
        core.on_protocol_message(ack);
        core.on_protocol_message(ProtocolMessage::for_channel(Action::Error, "chan"));

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|s| s.event).collect();
        assert_eq!(
            events[0],
            TransportEvent::Sync {
                connection_serial: Some(4),
                connection_id: "conn".into()
            }
        );
        assert!(matches!(&events[1], TransportEvent::Message(m) if m.action == Action::Sync));
        assert_eq!(events[2], TransportEvent::Ack { serial: 3, count: 2 });
        assert!(matches!(&events[3], TransportEvent::Message(m) if m.action == Action::Error));
    }

    #[tokio::test]
    async fn connection_level_error_fails_transport() {
        let (core, mut rx) = core();
        let mut error = ProtocolMessage::new(Action::Error);
        error.error = Some(ErrorInfo::new("bad", 40000, 400));
        core.on_protocol_message(error);
        let signal = rx.recv().await.unwrap();
        assert!(matches!(signal.event, TransportEvent::Failed(ref e) if e.code == Some(40000)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_watchdog_disconnects_silent_transport() {
        let (core, mut rx) = core();
        core.on_protocol_message(connected(1_000));
        let _ = rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        core.on_activity();
        assert!(rx.try_recv().is_err());

        // budget = 1s idle + 10s request timeout
        let signal = rx.recv().await.unwrap();
        match signal.event {
            TransportEvent::Disconnected(err) => {
                assert_eq!(err.code, Some(80003));
                assert_eq!(err.status_code, Some(408));
                assert!(err.message.starts_with("No activity seen from realtime in 11000ms"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
