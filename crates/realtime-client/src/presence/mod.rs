//! Channel presence: the member set kept in sync with the service, and the
//! members this connection entered itself.

pub(crate) mod map;

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use crate::channel::{
    Channel, ChannelCommand, ChannelContext, ChannelEvent, ChannelShared, ChannelState,
    ChannelStateChange,
};
use crate::error::{ErrorInfo, RealtimeError, codes};
use crate::protocol::{PresenceAction, PresenceMessage, ProtocolMessage};
use crate::queue::Completion;

pub(crate) use map::{KeyBy, PresenceMap};

const PRESENCE_OUT_OF_SYNC: u32 = 91005;

/// Options for [`Presence::get`].
#[derive(Debug, Clone)]
pub struct PresenceQuery {
    /// Wait for an in-progress SYNC to finish before answering.
    pub wait_for_sync: bool,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
}

impl Default for PresenceQuery {
    fn default() -> Self {
        Self {
            wait_for_sync: true,
            client_id: None,
            connection_id: None,
        }
    }
}

pub(crate) type MembersReply = oneshot::Sender<Result<Vec<PresenceMessage>, ErrorInfo>>;

struct SyncWaiter {
    query: PresenceQuery,
    reply: MembersReply,
}

/// Presence bookkeeping for one channel; lives on the engine task inside the
/// channel's state machine.
pub(crate) struct PresenceState {
    channel: String,
    pub(crate) members: PresenceMap,
    my_members: PresenceMap,
    pending: Vec<(PresenceMessage, Completion)>,
    sync_waiters: Vec<SyncWaiter>,
    /// Cursor of a multi-page SYNC still being received.
    pub(crate) sync_channel_serial: Option<String>,
    shared: ChannelShared,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Ends at the last page: `<sequence id>:<cursor>` with an empty cursor, or no
/// serial at all.
fn sync_cursor(channel_serial: Option<&str>) -> Option<&str> {
    let (sequence, cursor) = channel_serial?.split_once(':')?;
    let valid = !sequence.is_empty()
        && sequence
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    (valid && !cursor.is_empty()).then_some(cursor)
}

/// Resolves every completion with the outcome of one shared send.
fn fan_out(completions: Vec<Completion>) -> Option<Completion> {
    if completions.is_empty() {
        return None;
    }
    let (tx, rx) = oneshot::channel::<Result<(), ErrorInfo>>();
    tokio::spawn(async move {
        if let Ok(result) = rx.await {
            for completion in completions {
                let _ = completion.send(result.clone());
            }
        }
    });
    Some(tx)
}

impl PresenceState {
    pub fn new(channel: String, shared: ChannelShared) -> Self {
        Self {
            channel,
            members: PresenceMap::new(KeyBy::Member),
            my_members: PresenceMap::new(KeyBy::ClientId),
            pending: Vec::new(),
            sync_waiters: Vec::new(),
            sync_channel_serial: None,
            shared,
        }
    }

    fn broadcast(&self, message: PresenceMessage) {
        let _ = self.shared.presence.send(message);
    }

    fn publish_sync_state(&self) {
        self.shared.snapshot.write().presence_synced = !self.members.sync_in_progress();
    }

    /// Holds a presence message until the channel is attached.
    pub fn queue(&mut self, message: PresenceMessage, completion: Completion) {
        trace!(target: "realtime::presence", channel = %self.channel, action = %message.action, "queueing presence until attached");
        self.pending.push((message, completion));
    }

    /// Applies inbound PRESENCE or SYNC items.
    pub fn set_presence(
        &mut self,
        presence: Vec<PresenceMessage>,
        is_sync: bool,
        sync_channel_serial: Option<&str>,
        own_connection_id: Option<&str>,
    ) {
        debug!(
            target: "realtime::presence",
            channel = %self.channel,
            count = presence.len(),
            sync = is_sync,
            serial = ?sync_channel_serial,
            "received presence"
        );
        let mut cursor = None;
        if is_sync {
            self.members.start_sync();
            cursor = sync_cursor(sync_channel_serial);
        }
        let mut announce = Vec::new();
        for item in presence {
            let own = own_connection_id.is_some() && item.connection_id.as_deref() == own_connection_id;
            match item.action {
                PresenceAction::Leave => {
                    if own && !item.is_synthesized() {
                        self.my_members.remove(&item);
                    }
                    if self.members.remove(&item) {
                        announce.push(item);
                    }
                }
                PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                    if own {
                        self.my_members.put(&item);
                    }
                    if self.members.put(&item) {
                        announce.push(item);
                    }
                }
                PresenceAction::Absent => {}
            }
        }
        if is_sync && cursor.is_none() {
            self.end_sync();
            self.sync_channel_serial = None;
        }
        self.publish_sync_state();
        for item in announce {
            self.broadcast(item);
        }
    }

    fn end_sync(&mut self) {
        let residual = self.members.end_sync();
        self.synthesize_leaves(residual);
        self.resolve_sync_waiters();
    }

    fn synthesize_leaves(&self, items: Vec<PresenceMessage>) {
        let timestamp = now_ms();
        for item in items {
            let leave = PresenceMessage {
                action: PresenceAction::Leave,
                id: None,
                client_id: item.client_id,
                connection_id: item.connection_id,
                timestamp: Some(timestamp),
                data: item.data,
                encoding: item.encoding,
                extras: None,
            };
            self.broadcast(leave);
        }
    }

    fn resolve_sync_waiters(&mut self) {
        for waiter in self.sync_waiters.drain(..) {
            let members = self.members.list(
                waiter.query.client_id.as_deref(),
                waiter.query.connection_id.as_deref(),
            );
            let _ = waiter.reply.send(Ok(members));
        }
    }

    fn fail_sync_waiters(&mut self, err: &ErrorInfo) {
        for waiter in self.sync_waiters.drain(..) {
            let _ = waiter.reply.send(Err(err.clone()));
        }
    }

    /// Answers a `get` once the channel is attached (or suspended).
    pub fn get(&mut self, state: ChannelState, query: PresenceQuery, reply: MembersReply) {
        if state == ChannelState::Suspended {
            let result = if query.wait_for_sync {
                Err(ErrorInfo::new(
                    "Presence state is out of sync due to channel being in the SUSPENDED state",
                    PRESENCE_OUT_OF_SYNC,
                    400,
                ))
            } else {
                Ok(self
                    .members
                    .list(query.client_id.as_deref(), query.connection_id.as_deref()))
            };
            let _ = reply.send(result);
            return;
        }
        if query.wait_for_sync && self.members.sync_in_progress() {
            self.sync_waiters.push(SyncWaiter { query, reply });
            return;
        }
        let members = self
            .members
            .list(query.client_id.as_deref(), query.connection_id.as_deref());
        let _ = reply.send(Ok(members));
    }

    /// Reacts to the owning channel changing state.
    pub fn act_on_channel_state(
        &mut self,
        ctx: &mut dyn ChannelContext,
        state: ChannelState,
        has_presence: bool,
        reason: Option<&ErrorInfo>,
    ) {
        match state {
            ChannelState::Attached => self.on_attached(ctx, has_presence),
            ChannelState::Detached | ChannelState::Failed => {
                self.my_members.clear();
                self.members.clear();
                let err = reason.cloned().unwrap_or_else(|| state_error(state));
                self.fail_sync_waiters(&err);
                self.fail_pending(err);
                self.publish_sync_state();
            }
            ChannelState::Suspended => {
                let err = reason.cloned().unwrap_or_else(|| state_error(state));
                self.fail_sync_waiters(&ErrorInfo::new(
                    "Presence state is out of sync due to channel being in the SUSPENDED state",
                    PRESENCE_OUT_OF_SYNC,
                    400,
                ));
                self.fail_pending(err);
            }
            _ => {}
        }
    }

    /// The channel (re)attached: resync the member set, re-enter our own
    /// members and flush everything queued while attaching as one envelope.
    pub fn on_attached(&mut self, ctx: &mut dyn ChannelContext, has_presence: bool) {
        debug!(target: "realtime::presence", channel = %self.channel, has_presence, "channel attached");
        if has_presence {
            self.members.start_sync();
        } else {
            let gone = self.members.values();
            self.synthesize_leaves(gone);
            self.members.clear();
            self.resolve_sync_waiters();
        }
        self.publish_sync_state();

        for member in self.my_members.values() {
            debug!(
                target: "realtime::presence",
                channel = %self.channel,
                client_id = ?member.client_id,
                "re-entering own member"
            );
            let mut enter = PresenceMessage::new(PresenceAction::Enter, member.client_id, member.data);
            enter.id = member.id;
            let (tx, rx) = oneshot::channel();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Ok(Err(err)) = rx.await {
                    let reason = ErrorInfo::new(
                        format!("Presence auto-re-enter failed: {err}"),
                        codes::PRESENCE_REENTER_FAILED,
                        400,
                    );
                    warn!(target: "realtime::presence", error = %reason, "re-enter failed");
                    let state = shared.snapshot.read().state;
                    shared.emit(ChannelEvent::Update(ChannelStateChange {
                        previous: state,
                        current: state,
                        resumed: true,
                        has_backlog: false,
                        reason: Some(reason),
                    }));
                }
            });
            self.pending.push((enter, tx));
        }

        if self.pending.is_empty() {
            return;
        }
        debug!(target: "realtime::presence", channel = %self.channel, count = self.pending.len(), "sending queued presence");
        let (items, completions): (Vec<_>, Vec<_>) = self.pending.drain(..).unzip();
        let message = ProtocolMessage::presence(self.channel.clone(), items);
        let queue = ctx.queue_messages();
        ctx.send(message, queue, fan_out(completions));
    }

    pub fn fail_pending(&mut self, err: ErrorInfo) {
        if self.pending.is_empty() {
            return;
        }
        debug!(target: "realtime::presence", channel = %self.channel, error = %err, "failing queued presence");
        for (_, completion) in self.pending.drain(..) {
            let _ = completion.send(Err(err.clone()));
        }
    }
}

fn state_error(state: ChannelState) -> ErrorInfo {
    ErrorInfo::new(
        format!("Channel operation failed as channel state is {state}"),
        codes::CHANNEL_OPERATION_FAILED,
        400,
    )
}

/// Presence on one channel.
#[derive(Clone)]
pub struct Presence {
    channel: Channel,
}

impl Presence {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Enters this client (the connection's client id) with `data`.
    pub async fn enter(&self, data: impl Into<Value>) -> Result<(), RealtimeError> {
        self.request(PresenceAction::Enter, None, data.into()).await
    }

    pub async fn update(&self, data: impl Into<Value>) -> Result<(), RealtimeError> {
        self.request(PresenceAction::Update, None, data.into()).await
    }

    pub async fn leave(&self, data: impl Into<Value>) -> Result<(), RealtimeError> {
        self.request(PresenceAction::Leave, None, data.into()).await
    }

    /// Enters on behalf of `client_id`; needs a wildcard-capable credential.
    pub async fn enter_client(
        &self,
        client_id: impl Into<String>,
        data: impl Into<Value>,
    ) -> Result<(), RealtimeError> {
        self.request(PresenceAction::Enter, Some(client_id.into()), data.into())
            .await
    }

    pub async fn update_client(
        &self,
        client_id: impl Into<String>,
        data: impl Into<Value>,
    ) -> Result<(), RealtimeError> {
        self.request(PresenceAction::Update, Some(client_id.into()), data.into())
            .await
    }

    pub async fn leave_client(
        &self,
        client_id: impl Into<String>,
        data: impl Into<Value>,
    ) -> Result<(), RealtimeError> {
        self.request(PresenceAction::Leave, Some(client_id.into()), data.into())
            .await
    }

    async fn request(
        &self,
        action: PresenceAction,
        client_id: Option<String>,
        data: Value,
    ) -> Result<(), RealtimeError> {
        self.channel
            .command(|reply| ChannelCommand::Presence {
                action,
                client_id,
                data,
                reply,
            })
            .await
    }

    /// Current members. Attaches first if needed and, unless
    /// `wait_for_sync` is off, waits for an in-progress SYNC to finish.
    pub async fn get(&self, query: PresenceQuery) -> Result<Vec<PresenceMessage>, RealtimeError> {
        match self.channel.state() {
            ChannelState::Attached | ChannelState::Suspended => {}
            ChannelState::Failed => return Err(self.channel.invalid_state_error().into()),
            _ => {
                self.channel.attach().await?;
            }
        }
        self.channel
            .command(|reply| ChannelCommand::PresenceGet { query, reply })
            .await
    }

    /// Presence events (enter, leave, update, present) on this channel.
    /// Attaches the channel.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<PresenceMessage>, RealtimeError> {
        if self.channel.state() == ChannelState::Failed {
            return Err(self.channel.invalid_state_error().into());
        }
        let events = self.channel.shared().presence.subscribe();
        self.channel.attach().await?;
        Ok(events)
    }

    /// Whether the member set is complete (no SYNC under way).
    pub fn sync_complete(&self) -> bool {
        self.channel.shared().snapshot.read().presence_synced
    }
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presence")
            .field("channel", &self.channel.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_cursor_detects_last_page() {
        assert_eq!(sync_cursor(Some("seq1:cursor2")), Some("cursor2"));
        assert_eq!(sync_cursor(Some("seq1:")), None);
        assert_eq!(sync_cursor(Some("noseparator")), None);
        assert_eq!(sync_cursor(None), None);
    }
}
