use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{ErrorInfo, codes};
use crate::queue::{MessageQueue, PendingMessage, QueueError};
use crate::transport::{Transport, TransportId};

/// One activated transport plus the messages sent on it and not yet acknowledged.
pub struct ProtocolSession {
    transport: Arc<dyn Transport>,
    in_flight: MessageQueue,
}

impl ProtocolSession {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            in_flight: MessageQueue::new(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn transport_id(&self) -> TransportId {
        self.transport.id()
    }

    /// Hands the message to the transport, tracking it until acknowledged if it needs an ACK.
    pub fn send(&mut self, mut pending: PendingMessage) {
        pending.send_attempted = true;
        let message = pending.message.clone();
        trace!(target: "realtime::transport", transport = %self.transport.id(), %message, "send");
        let result = self.transport.send(message);
        if let Err(err) = &result {
            warn!(target: "realtime::transport", transport = %self.transport.id(), error = %err, "send failed");
        }
        if pending.ack_required {
            self.in_flight.push(pending);
        } else {
            pending.complete(result);
        }
    }

    pub fn on_ack(&mut self, serial: i64, count: i64) {
        debug!(target: "realtime::transport", serial, count, "ack");
        self.complete(serial, count, None);
    }

    pub fn on_nack(&mut self, serial: i64, count: i64, error: Option<ErrorInfo>) {
        let error = error.unwrap_or_else(|| {
            ErrorInfo::new(
                "Unable to send message; channel not responding",
                codes::UNKNOWN_CHANNEL,
                500,
            )
        });
        warn!(target: "realtime::transport", serial, count, error = %error, "nack");
        self.complete(serial, count, Some(error));
    }

    fn complete(&mut self, serial: i64, count: i64, error: Option<ErrorInfo>) {
        if let Err(QueueError::Empty) = self.in_flight.complete_messages(serial, count, error) {
            warn!(
                target: "realtime::transport",
                transport = %self.transport.id(),
                serial,
                count,
                "ack or nack with nothing in flight"
            );
        }
    }

    pub fn pending_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn once_idle(&mut self) -> tokio::sync::oneshot::Receiver<()> {
        self.in_flight.once_idle()
    }

    /// Removes every unacknowledged message so it can be requeued elsewhere.
    pub fn take_pending(&mut self) -> Vec<PendingMessage> {
        self.in_flight.take_all()
    }

    /// Disconnects the transport once every in-flight message has been acknowledged.
    pub fn finish(&mut self) {
        let idle = self.in_flight.once_idle();
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let _ = idle.await;
            debug!(target: "realtime::transport", transport = %transport.id(), "session drained; disconnecting");
            transport.disconnect(None);
        });
    }
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("transport", &self.transport.id())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
