use std::collections::VecDeque;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::ErrorInfo;
use crate::protocol::{Action, ProtocolMessage};

/// Resolves the caller that published the message.
pub type Completion = oneshot::Sender<Result<(), ErrorInfo>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("completion requested on an empty message queue")]
    Empty,
}

/// One outbound envelope plus whoever is waiting on its outcome.
#[derive(Debug)]
pub struct PendingMessage {
    pub message: ProtocolMessage,
    pub ack_required: bool,
    /// Set on first send so a resend keeps its msgSerial.
    pub send_attempted: bool,
    completions: Vec<Completion>,
}

impl PendingMessage {
    pub fn new(message: ProtocolMessage, completion: Option<Completion>) -> Self {
        let ack_required = message.ack_required();
        Self {
            message,
            ack_required,
            send_attempted: false,
            completions: completion.into_iter().collect(),
        }
    }

    pub fn is_merged(&self) -> bool {
        self.completions.len() > 1
    }

    /// Resolves every caller folded into this envelope.
    pub fn complete(self, result: Result<(), ErrorInfo>) {
        for completion in self.completions {
            // The caller may have stopped waiting.
            let _ = completion.send(result.clone());
        }
    }

    /// Folds `other` into this envelope when the two can travel as one.
    ///
    /// Returns `other` back untouched when they cannot.
    pub fn bundle_with(
        &mut self,
        other: PendingMessage,
        max_size: usize,
    ) -> Result<(), PendingMessage> {
        if self.send_attempted || !can_bundle(&self.message, &other.message, max_size) {
            return Err(other);
        }
        let PendingMessage {
            message,
            completions,
            ..
        } = other;
        match self.message.action {
            Action::Presence => self
                .message
                .presence
                .get_or_insert_with(Vec::new)
                .extend(message.presence.unwrap_or_default()),
            _ => self
                .message
                .messages
                .get_or_insert_with(Vec::new)
                .extend(message.messages.unwrap_or_default()),
        }
        self.completions.extend(completions);
        Ok(())
    }
}

fn can_bundle(dest: &ProtocolMessage, src: &ProtocolMessage, max_size: usize) -> bool {
    if dest.channel != src.channel {
        return false;
    }
    if !matches!(dest.action, Action::Message | Action::Presence) || dest.action != src.action {
        return false;
    }
    if dest.payload_size() + src.payload_size() > max_size {
        return false;
    }
    let (client_ids, ids): (Vec<Option<&str>>, Vec<bool>) = if dest.action == Action::Presence {
        dest.presence
            .iter()
            .chain(src.presence.iter())
            .flatten()
            .map(|p| (p.client_id.as_deref(), p.id.is_some()))
            .unzip()
    } else {
        dest.messages
            .iter()
            .chain(src.messages.iter())
            .flatten()
            .map(|m| (m.client_id.as_deref(), m.id.is_some()))
            .unzip()
    };
    let same_client = client_ids.windows(2).all(|pair| pair[0] == pair[1]);
    same_client && !ids.into_iter().any(|has_id| has_id)
}

/// Ordered outbound buffer; position implies msgSerial once the head has one.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: VecDeque<PendingMessage>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: PendingMessage) {
        self.messages.push_back(message);
    }

    /// Appends, merging into the tail envelope when bundling rules allow.
    pub fn push_bundled(&mut self, message: PendingMessage, max_size: usize) {
        let message = match self.messages.back_mut() {
            Some(last) => match last.bundle_with(message, max_size) {
                Ok(()) => {
                    trace!(target: "realtime::connection", queued = self.messages.len(), "bundled into queued message");
                    return;
                }
                Err(message) => message,
            },
            None => message,
        };
        self.messages.push_back(message);
    }

    pub fn shift(&mut self) -> Option<PendingMessage> {
        let head = self.messages.pop_front();
        if head.is_some() && self.messages.is_empty() {
            self.notify_idle();
        }
        head
    }

    /// Re-inserts `messages` ahead of everything queued, keeping their order.
    pub fn prepend(&mut self, messages: Vec<PendingMessage>) {
        for message in messages.into_iter().rev() {
            self.messages.push_front(message);
        }
    }

    /// Completes every message whose implied serial lies in `[serial, serial + count)`.
    ///
    /// Serials are implied by position relative to the head's msgSerial.
    pub fn complete_messages(
        &mut self,
        serial: i64,
        count: i64,
        error: Option<ErrorInfo>,
    ) -> Result<usize, QueueError> {
        trace!(target: "realtime::connection", serial, count, "complete messages");
        let Some(first) = self.messages.front() else {
            return Err(QueueError::Empty);
        };
        let start_serial = first.message.msg_serial.unwrap_or(serial);
        let end_serial = serial.saturating_add(count.max(0));
        let skip = (serial - start_serial).max(0);
        let mut completed = 0;
        if end_serial > start_serial && (skip as usize) < self.messages.len() {
            let skip = skip as usize;
            let take = ((end_serial - start_serial) as usize - skip).min(self.messages.len() - skip);
            let done: Vec<PendingMessage> = self.messages.drain(skip..skip + take).collect();
            completed = done.len();
            let result = error.map_or(Ok(()), Err);
            for message in done {
                message.complete(result.clone());
            }
        } else {
            debug!(
                target: "realtime::connection",
                serial,
                count,
                start_serial,
                "acknowledgement matched no queued message"
            );
        }
        if self.messages.is_empty() {
            self.notify_idle();
        }
        Ok(completed)
    }

    pub fn complete_all_messages(&mut self, error: ErrorInfo) {
        let drained: Vec<PendingMessage> = self.messages.drain(..).collect();
        if !drained.is_empty() {
            warn!(
                target: "realtime::connection",
                count = drained.len(),
                error = %error,
                "failing pending messages"
            );
        }
        for message in drained {
            message.complete(Err(error.clone()));
        }
        self.notify_idle();
    }

    /// Takes every message out, leaving the queue empty.
    pub fn take_all(&mut self) -> Vec<PendingMessage> {
        let taken = self.messages.drain(..).collect();
        self.notify_idle();
        taken
    }

    pub fn reset_send_attempted(&mut self) {
        for message in &mut self.messages {
            message.send_attempted = false;
        }
    }

    /// Resolves once the queue is (or becomes) empty.
    pub fn once_idle(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.messages.is_empty() {
            let _ = tx.send(());
        } else {
            self.idle_waiters.push(tx);
        }
        rx
    }

    fn notify_idle(&mut self) {
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.messages.iter()
    }
}
