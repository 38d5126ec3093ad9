//! The per-channel attach state machine and the engine-side channel table.
//!
//! Like the connection manager, everything here runs on the engine task and
//! never blocks; the connection is reached through [`ChannelContext`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use super::decode::{self, DecodingContext, DeltaDecoder};
use super::{
    AttachReply, ChannelCommand, ChannelContext, ChannelEvent, ChannelOptions, ChannelShared,
    ChannelState, ChannelStateChange, DoneReply, invalid_state_error,
};
use crate::connection::{ConnectionState, TimerKey};
use crate::error::{ErrorInfo, codes};
use crate::presence::{PresenceQuery, PresenceState};
use crate::protocol::{
    Action, AttachFlags, Flags, Message, PresenceAction, PresenceMessage, ProtocolMessage,
};
use crate::queue::Completion;
use crate::retry::retry_time;

const BROWSER_NO_DELTAS: u32 = 40021;

/// Where the last delta base came from; a delta must build on it.
#[derive(Debug, Default)]
struct LastPayload {
    message_id: Option<String>,
    channel_serial: Option<String>,
}

pub(crate) struct ChannelMachine {
    name: String,
    state: ChannelState,
    error_reason: Option<ErrorInfo>,
    options: ChannelOptions,
    shared: ChannelShared,
    pub(crate) presence: PresenceState,
    decoding: DecodingContext,
    last_payload: LastPayload,
    decode_recovery: bool,
    /// Set once attached; asks the service to resume rather than start over.
    attach_resume: bool,
    channel_serial: Option<String>,
    retry_count: u32,
    attach_waiters: Vec<AttachReply>,
    detach_waiters: Vec<DoneReply>,
    options_waiters: Vec<DoneReply>,
}

impl ChannelMachine {
    pub fn new(
        name: String,
        options: ChannelOptions,
        shared: ChannelShared,
        delta_decoder: Option<Arc<dyn DeltaDecoder>>,
    ) -> Self {
        Self {
            presence: PresenceState::new(name.clone(), shared.clone()),
            name,
            state: ChannelState::Initialized,
            error_reason: None,
            options,
            shared,
            decoding: DecodingContext::new(delta_decoder),
            last_payload: LastPayload::default(),
            decode_recovery: false,
            attach_resume: false,
            channel_serial: None,
            retry_count: 0,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            options_waiters: Vec::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn state_timer(&self) -> TimerKey {
        TimerKey::ChannelState(self.name.clone())
    }

    fn retry_timer(&self) -> TimerKey {
        TimerKey::ChannelRetry(self.name.clone())
    }

    fn invalid_state_error(&self) -> ErrorInfo {
        invalid_state_error(self.state, self.error_reason.as_ref())
    }

    /// Released channels must not be able to hear from the service again.
    pub fn release_error(&self) -> Option<ErrorInfo> {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed => None,
            state => Some(ErrorInfo::new(
                format!(
                    "Can only release a channel in a state where there is no possibility of further updates from the server being received (initialized, detached, or failed); was {state}"
                ),
                codes::CHANNEL_OPERATION_FAILED,
                400,
            )),
        }
    }

    fn publish_snapshot(&self) {
        let mut snapshot = self.shared.snapshot.write();
        snapshot.state = self.state;
        snapshot.error_reason = self.error_reason.clone();
        snapshot.options = self.options.clone();
        snapshot.channel_serial = self.channel_serial.clone();
    }

    pub fn handle(&mut self, ctx: &mut dyn ChannelContext, command: ChannelCommand) {
        match command {
            ChannelCommand::Attach(reply) => self.attach(ctx, Some(reply)),
            ChannelCommand::Detach(reply) => self.detach(ctx, reply),
            ChannelCommand::Publish { messages, reply } => self.publish(ctx, messages, reply),
            ChannelCommand::SetOptions { options, reply } => self.set_options(ctx, options, reply),
            ChannelCommand::Presence {
                action,
                client_id,
                data,
                reply,
            } => self.presence_request(ctx, action, client_id, data, reply),
            ChannelCommand::PresenceGet { query, reply } => self.presence_get(query, reply),
        }
    }

    // ---- attach / detach ------------------------------------------------

    pub fn attach(&mut self, ctx: &mut dyn ChannelContext, reply: Option<AttachReply>) {
        if self.state == ChannelState::Attached {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(None));
            }
            return;
        }
        self.attach_with(ctx, false, None, reply);
    }

    fn attach_with(
        &mut self,
        ctx: &mut dyn ChannelContext,
        force: bool,
        reason: Option<ErrorInfo>,
        reply: Option<AttachReply>,
    ) {
        if !ctx.is_active() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(ctx.connection_error()));
            }
            return;
        }
        if self.state != ChannelState::Attaching || force {
            self.request_state(ctx, ChannelState::Attaching, reason);
        }
        if let Some(reply) = reply {
            self.attach_waiters.push(reply);
        }
    }

    fn detach(&mut self, ctx: &mut dyn ChannelContext, reply: DoneReply) {
        if !ctx.is_active() {
            let _ = reply.send(Err(ctx.connection_error()));
            return;
        }
        match self.state {
            ChannelState::Suspended => {
                self.notify_state(ctx, ChannelState::Detached, None, false, false, false);
                let _ = reply.send(Ok(()));
            }
            ChannelState::Detached => {
                let _ = reply.send(Ok(()));
            }
            ChannelState::Failed => {
                let _ = reply.send(Err(ErrorInfo::new(
                    "Unable to detach; channel state = failed",
                    codes::CHANNEL_OPERATION_FAILED,
                    400,
                )));
            }
            ChannelState::Detaching => self.detach_waiters.push(reply),
            _ => {
                self.request_state(ctx, ChannelState::Detaching, None);
                self.detach_waiters.push(reply);
            }
        }
    }

    fn attach_impl(&mut self, ctx: &mut dyn ChannelContext) {
        debug!(target: "realtime::channel", channel = %self.name, "sending ATTACH");
        let mut message = ProtocolMessage::for_channel(Action::Attach, self.name.clone());
        if !self.options.params.is_empty() {
            message.params = Some(self.options.params.clone());
        }
        message.channel_serial = self.channel_serial.clone();
        let mut flags = Flags::default();
        if let Some(modes) = self.options.modes {
            flags.modes = modes;
        }
        if self.attach_resume {
            flags.attach.insert(AttachFlags::ATTACH_RESUME);
        }
        message.flags = flags;
        if self.decode_recovery {
            message.channel_serial = self.last_payload.channel_serial.clone();
        }
        let queue = ctx.queue_messages();
        ctx.send(message, queue, None);
    }

    fn detach_impl(&mut self, ctx: &mut dyn ChannelContext) {
        debug!(target: "realtime::channel", channel = %self.name, "sending DETACH");
        let message = ProtocolMessage::for_channel(Action::Detach, self.name.clone());
        let queue = ctx.queue_messages();
        ctx.send(message, queue, None);
    }

    /// Resumes a presence SYNC that was cut short.
    fn sync(&mut self, ctx: &mut dyn ChannelContext) {
        let mut message = ProtocolMessage::for_channel(Action::Sync, self.name.clone());
        message.channel_serial = self.presence.sync_channel_serial.clone();
        ctx.send(message, false, None);
    }

    fn set_options(&mut self, ctx: &mut dyn ChannelContext, options: ChannelOptions, reply: DoneReply) {
        let previous = std::mem::replace(&mut self.options, options);
        self.publish_snapshot();
        if self.options.needs_reattach(&previous, self.state) {
            // Stay attached while the new options are negotiated; messages
            // keep flowing under the old ones until ATTACHED arrives.
            self.attach_impl(ctx);
            self.options_waiters.push(reply);
        } else {
            let _ = reply.send(Ok(()));
        }
    }

    // ---- state ----------------------------------------------------------

    pub fn request_state(
        &mut self,
        ctx: &mut dyn ChannelContext,
        state: ChannelState,
        reason: Option<ErrorInfo>,
    ) {
        self.notify_state(ctx, state, reason, false, false, false);
        self.check_pending_state(ctx);
    }

    pub fn check_pending_state(&mut self, ctx: &mut dyn ChannelContext) {
        if !ctx.can_transmit() {
            trace!(
                target: "realtime::channel",
                channel = %self.name,
                connection = %ctx.connection_state(),
                "connection can't carry channel requests yet"
            );
            return;
        }
        match self.state {
            ChannelState::Attaching => {
                let timeout = ctx.timeouts().realtime_request;
                ctx.timers().start_if_idle(self.state_timer(), timeout);
                self.attach_impl(ctx);
            }
            ChannelState::Detaching => {
                let timeout = ctx.timeouts().realtime_request;
                ctx.timers().start_if_idle(self.state_timer(), timeout);
                self.detach_impl(ctx);
            }
            ChannelState::Attached => self.sync(ctx),
            _ => {}
        }
    }

    fn timeout_pending_state(&mut self, ctx: &mut dyn ChannelContext) {
        match self.state {
            ChannelState::Attaching => {
                let err = ErrorInfo::new("Channel attach timed out", codes::CHANNEL_TIMEOUT, 408);
                self.notify_state(ctx, ChannelState::Suspended, Some(err), false, false, false);
            }
            ChannelState::Detaching => {
                let err = ErrorInfo::new("Channel detach timed out", codes::CHANNEL_TIMEOUT, 408);
                self.notify_state(ctx, ChannelState::Attached, Some(err), false, false, false);
            }
            _ => self.check_pending_state(ctx),
        }
    }

    fn start_retry_timer(&mut self, ctx: &mut dyn ChannelContext) {
        let key = self.retry_timer();
        if ctx.timers().is_running(&key) {
            return;
        }
        self.retry_count += 1;
        let delay = retry_time(ctx.timeouts().channel_retry, self.retry_count);
        debug!(
            target: "realtime::channel",
            channel = %self.name,
            retry = self.retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling reattach"
        );
        ctx.timers().start(key, delay);
    }

    pub fn on_timer(&mut self, ctx: &mut dyn ChannelContext, key: &TimerKey) {
        match key {
            TimerKey::ChannelState(_) => self.timeout_pending_state(ctx),
            TimerKey::ChannelRetry(_) => {
                // Left suspended otherwise; the next transport activation reattaches.
                if self.state == ChannelState::Suspended
                    && ctx.connection_state() == ConnectionState::Connected
                {
                    self.request_state(ctx, ChannelState::Attaching, None);
                }
            }
            _ => {}
        }
    }

    pub fn notify_state(
        &mut self,
        ctx: &mut dyn ChannelContext,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        resumed: bool,
        has_presence: bool,
        has_backlog: bool,
    ) {
        trace!(
            target: "realtime::channel",
            channel = %self.name,
            current = %self.state,
            to = %state,
            "notify state"
        );
        ctx.timers().cancel(&self.state_timer());
        if matches!(
            state,
            ChannelState::Detached | ChannelState::Suspended | ChannelState::Failed
        ) {
            self.channel_serial = None;
        }
        if state == self.state {
            self.publish_snapshot();
            return;
        }
        self.presence
            .act_on_channel_state(ctx, state, has_presence, reason.as_ref());
        if state == ChannelState::Suspended && ctx.connection_state() == ConnectionState::Connected {
            self.start_retry_timer(ctx);
        } else {
            ctx.timers().cancel(&self.retry_timer());
        }
        if let Some(reason) = &reason {
            self.error_reason = Some(reason.clone());
        }
        let change = ChannelStateChange {
            previous: self.state,
            current: state,
            resumed,
            has_backlog,
            reason,
        };
        match (&change.reason, state) {
            (Some(reason), ChannelState::Failed) => {
                error!(target: "realtime::channel", channel = %self.name, state = %state, error = %reason, "channel state")
            }
            (Some(reason), _) => {
                info!(target: "realtime::channel", channel = %self.name, state = %state, error = %reason, "channel state")
            }
            (None, _) => info!(target: "realtime::channel", channel = %self.name, state = %state, "channel state"),
        }
        if !matches!(state, ChannelState::Attaching | ChannelState::Suspended) {
            self.retry_count = 0;
        }
        match state {
            ChannelState::Attached => self.attach_resume = true,
            ChannelState::Detaching | ChannelState::Failed => self.attach_resume = false,
            _ => {}
        }
        if state != ChannelState::Attaching {
            self.decode_recovery = false;
        }
        self.state = state;
        self.publish_snapshot();
        self.resolve_waiters(ctx, &change);
        self.shared.emit(ChannelEvent::StateChanged(change));
    }

    fn resolve_waiters(&mut self, ctx: &dyn ChannelContext, change: &ChannelStateChange) {
        let failure = |state: ChannelState, what: &str| {
            change
                .reason
                .clone()
                .unwrap_or_else(|| match ctx.connection_state() {
                    ConnectionState::Connected => ErrorInfo::new(
                        format!("Unable to {what}; reason unknown; state = {state}"),
                        codes::INVALID_STATE,
                        500,
                    ),
                    _ => ctx.connection_error(),
                })
        };
        match change.current {
            ChannelState::Attached => {
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Ok(Some(change.clone())));
                }
                for waiter in self.detach_waiters.drain(..) {
                    let _ = waiter.send(Err(failure(change.current, "detach")));
                }
                for waiter in self.options_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ChannelState::Detached => {
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Err(failure(change.current, "attach")));
                }
                for waiter in self.detach_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                for waiter in self.options_waiters.drain(..) {
                    let _ = waiter.send(Err(failure(change.current, "attach")));
                }
            }
            ChannelState::Suspended | ChannelState::Failed => {
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Err(failure(change.current, "attach")));
                }
                for waiter in self.detach_waiters.drain(..) {
                    let _ = waiter.send(Err(failure(change.current, "detach")));
                }
                for waiter in self.options_waiters.drain(..) {
                    let _ = waiter.send(Err(failure(change.current, "attach")));
                }
            }
            ChannelState::Detaching => {
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Err(ErrorInfo::new(
                        "Attach request superseded by a subsequent detach request",
                        codes::INVALID_STATE,
                        409,
                    )));
                }
            }
            ChannelState::Attaching => {
                for waiter in self.detach_waiters.drain(..) {
                    let _ = waiter.send(Err(ErrorInfo::new(
                        "Detach request superseded by a subsequent attach request",
                        codes::INVALID_STATE,
                        409,
                    )));
                }
            }
            ChannelState::Initialized => {}
        }
    }

    // ---- connection fan-out ---------------------------------------------

    /// The connection stopped queueing; channels that could still hear from
    /// the service follow it down.
    pub fn on_interrupted(
        &mut self,
        ctx: &mut dyn ChannelContext,
        connection: ConnectionState,
        reason: &ErrorInfo,
    ) {
        let target = match connection {
            ConnectionState::Closing | ConnectionState::Closed => ChannelState::Detached,
            ConnectionState::Failed => ChannelState::Failed,
            ConnectionState::Suspended => ChannelState::Suspended,
            _ => return,
        };
        if matches!(
            self.state,
            ChannelState::Attaching
                | ChannelState::Attached
                | ChannelState::Detaching
                | ChannelState::Suspended
        ) {
            self.notify_state(ctx, target, Some(reason.clone()), false, false, false);
        }
    }

    pub fn on_transport_active(&mut self, ctx: &mut dyn ChannelContext) {
        match self.state {
            ChannelState::Attaching | ChannelState::Detaching => self.check_pending_state(ctx),
            ChannelState::Suspended => self.attach_with(ctx, false, None, None),
            _ => {}
        }
    }

    pub fn on_new_connection_id(&mut self, ctx: &mut dyn ChannelContext) {
        if self.state == ChannelState::Attached {
            debug!(target: "realtime::channel", channel = %self.name, "connection id changed; reattaching");
            self.request_state(ctx, ChannelState::Attaching, None);
        }
    }

    // ---- publishing -------------------------------------------------------

    fn publish(&mut self, ctx: &mut dyn ChannelContext, messages: Vec<Message>, reply: Completion) {
        if !ctx.is_active() {
            let _ = reply.send(Err(ctx.connection_error()));
            return;
        }
        if let Some(own) = ctx.client_id().filter(|id| *id != "*") {
            let foreign = messages
                .iter()
                .filter_map(|m| m.client_id.as_deref())
                .find(|id| *id != own);
            if let Some(foreign) = foreign {
                let _ = reply.send(Err(ErrorInfo::new(
                    format!(
                        "Unable to publish message containing a clientId ({foreign}) that is incompatible with the library clientId ({own})"
                    ),
                    codes::INVALID_CLIENT_ID,
                    400,
                )));
                return;
            }
        }
        let size: usize = messages.iter().map(Message::size).sum();
        let limit = ctx.max_message_size();
        if size > limit {
            let _ = reply.send(Err(ErrorInfo::new(
                format!(
                    "Maximum size of messages that can be published at once exceeded ( was {size} bytes; limit is {limit} bytes)"
                ),
                codes::MAX_MESSAGE_SIZE_EXCEEDED,
                400,
            )));
            return;
        }
        match self.state {
            ChannelState::Failed | ChannelState::Suspended => {
                let _ = reply.send(Err(self.invalid_state_error()));
            }
            _ => {
                trace!(target: "realtime::channel", channel = %self.name, count = messages.len(), "publishing");
                let message = ProtocolMessage::messages(self.name.clone(), messages);
                let queue = ctx.queue_messages();
                ctx.send(message, queue, Some(reply));
            }
        }
    }

    // ---- presence -------------------------------------------------------

    fn presence_request(
        &mut self,
        ctx: &mut dyn ChannelContext,
        action: PresenceAction,
        client_id: Option<String>,
        data: Value,
        reply: Completion,
    ) {
        if !ctx.is_active() {
            let _ = reply.send(Err(ctx.connection_error()));
            return;
        }
        if client_id.is_none() {
            let anonymous = ctx.client_id().is_none_or(|id| id == "*")
                && ctx.connection_state() == ConnectionState::Connected;
            if anonymous {
                let message = match action {
                    PresenceAction::Enter => "clientId must be specified to enter a presence channel",
                    PresenceAction::Update => "clientId must be specified to update presence data",
                    _ => "clientId must have been specified to enter or leave a presence channel",
                };
                let _ = reply.send(Err(ErrorInfo::new(message, codes::INVALID_CLIENT_ID, 400)));
                return;
            }
        }
        let message = PresenceMessage::new(action, client_id, data);
        debug!(
            target: "realtime::presence",
            channel = %self.name,
            action = %action,
            client_id = ?message.client_id.as_deref().or(ctx.client_id()),
            "presence request"
        );
        let incompatible = |verb: &str, state: ChannelState| {
            ErrorInfo::new(
                format!("Unable to {verb} presence channel while in {state} state"),
                codes::PRESENCE_STATE_MISMATCH,
                400,
            )
        };
        match (action, self.state) {
            (_, ChannelState::Attached) => {
                let envelope = ProtocolMessage::presence(self.name.clone(), vec![message]);
                let queue = ctx.queue_messages();
                ctx.send(envelope, queue, Some(reply));
            }
            (PresenceAction::Leave, ChannelState::Attaching) => self.presence.queue(message, reply),
            (PresenceAction::Leave, ChannelState::Initialized | ChannelState::Failed) => {
                let _ = reply.send(Err(ErrorInfo::new(
                    "Unable to leave presence channel (incompatible state)",
                    codes::PRESENCE_STATE_MISMATCH,
                    400,
                )));
            }
            (PresenceAction::Leave, _) => {
                let _ = reply.send(Err(self.invalid_state_error()));
            }
            (_, ChannelState::Initialized | ChannelState::Detached) => {
                self.attach(ctx, None);
                self.presence.queue(message, reply);
            }
            (_, ChannelState::Attaching) => self.presence.queue(message, reply),
            (action, state) => {
                let _ = reply.send(Err(incompatible(action.name(), state)));
            }
        }
    }

    fn presence_get(&mut self, query: PresenceQuery, reply: crate::presence::MembersReply) {
        match self.state {
            ChannelState::Attached | ChannelState::Suspended => {
                self.presence.get(self.state, query, reply)
            }
            _ => {
                let _ = reply.send(Err(self.invalid_state_error()));
            }
        }
    }

    // ---- inbound ----------------------------------------------------------

    pub fn on_message(&mut self, ctx: &mut dyn ChannelContext, message: ProtocolMessage) {
        if matches!(
            message.action,
            Action::Attached | Action::Message | Action::Presence
        ) && message.channel_serial.is_some()
        {
            self.channel_serial = message.channel_serial.clone();
        }
        match message.action {
            Action::Attached => self.on_attached(ctx, message),
            Action::Detached => {
                let err = message.error.unwrap_or_else(|| {
                    ErrorInfo::new("Channel detached", codes::CHANNEL_OPERATION_FAILED, 404)
                });
                match self.state {
                    ChannelState::Detaching => {
                        self.notify_state(ctx, ChannelState::Detached, Some(err), false, false, false)
                    }
                    // Attaching had no continuity to lose; back off before retrying.
                    ChannelState::Attaching => {
                        self.notify_state(ctx, ChannelState::Suspended, Some(err), false, false, false)
                    }
                    _ => self.request_state(ctx, ChannelState::Attaching, Some(err)),
                }
            }
            Action::Sync => {
                self.presence.sync_channel_serial = message.channel_serial.clone();
                if message.presence.is_some() {
                    self.on_presence(ctx, message, true);
                }
            }
            Action::Presence => self.on_presence(ctx, message, false),
            Action::Message => self.on_messages(ctx, message),
            Action::Error => {
                let err = message.error.unwrap_or_else(ErrorInfo::unknown_channel);
                if err.code == Some(codes::SUPERSEDED_TRANSPORT) {
                    self.check_pending_state(ctx);
                } else {
                    self.notify_state(ctx, ChannelState::Failed, Some(err), false, false, false);
                }
            }
            other => {
                warn!(target: "realtime::channel", channel = %self.name, action = %other, "unexpected action on channel; ignoring");
            }
        }
        self.publish_snapshot();
    }

    fn on_attached(&mut self, ctx: &mut dyn ChannelContext, message: ProtocolMessage) {
        let flags = message.flags.attach;
        let resumed = flags.contains(AttachFlags::RESUMED);
        let has_presence = flags.contains(AttachFlags::HAS_PRESENCE);
        let has_backlog = flags.contains(AttachFlags::HAS_BACKLOG);
        {
            let mut snapshot = self.shared.snapshot.write();
            snapshot.attach_serial = message.channel_serial.clone();
            snapshot.modes = (!message.flags.modes.is_empty()).then_some(message.flags.modes);
            snapshot.params = message.params.clone().unwrap_or_default();
        }
        match self.state {
            ChannelState::Attached => {
                if !resumed {
                    // Continuity was lost; the member set has to be rebuilt.
                    self.presence.on_attached(ctx, has_presence);
                }
                let change = ChannelStateChange {
                    previous: self.state,
                    current: self.state,
                    resumed,
                    has_backlog,
                    reason: message.error,
                };
                for waiter in self.options_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                if !resumed {
                    self.shared.emit(ChannelEvent::Update(change));
                }
            }
            // Keep detaching; the DETACH goes out again.
            ChannelState::Detaching => self.check_pending_state(ctx),
            _ => self.notify_state(
                ctx,
                ChannelState::Attached,
                message.error,
                resumed,
                has_presence,
                has_backlog,
            ),
        }
    }

    fn on_presence(&mut self, ctx: &mut dyn ChannelContext, message: ProtocolMessage, is_sync: bool) {
        let ProtocolMessage {
            id,
            connection_id,
            timestamp,
            channel_serial,
            presence,
            ..
        } = message;
        let mut presence = presence.unwrap_or_default();
        for (index, item) in presence.iter_mut().enumerate() {
            if let Err(err) = decode::decode(&mut item.data, &mut item.encoding, None) {
                error!(target: "realtime::presence", channel = %self.name, error = %err, "presence decode failed");
            }
            if item.connection_id.is_none() {
                item.connection_id = connection_id.clone();
            }
            if item.timestamp.is_none() {
                item.timestamp = timestamp;
            }
            if item.id.is_none() {
                if let Some(id) = &id {
                    item.id = Some(format!("{id}:{index}"));
                }
            }
        }
        self.presence.set_presence(
            presence,
            is_sync,
            channel_serial.as_deref(),
            ctx.connection_id(),
        );
    }

    fn on_messages(&mut self, ctx: &mut dyn ChannelContext, message: ProtocolMessage) {
        if self.state != ChannelState::Attached {
            debug!(
                target: "realtime::channel",
                channel = %self.name,
                state = %self.state,
                id = ?message.id,
                "message skipped; channel not attached"
            );
            return;
        }
        let ProtocolMessage {
            id,
            connection_id,
            timestamp,
            channel_serial,
            messages,
            ..
        } = message;
        let mut messages = messages.unwrap_or_default();
        let Some(first) = messages.first() else {
            return;
        };
        if let Some(from) = first.delta_from() {
            if Some(from) != self.last_payload.message_id.as_deref() {
                let reason = ErrorInfo::new(
                    format!(
                        "Delta message decode failure - previous message not available for message \"{}\" on this channel \"{}\".",
                        id.as_deref().unwrap_or_default(),
                        self.name
                    ),
                    codes::DELTA_DECODE_FAILED,
                    400,
                );
                self.start_decode_failure_recovery(ctx, reason);
                return;
            }
        }
        for (index, item) in messages.iter_mut().enumerate() {
            if let Err(err) = decode::decode(&mut item.data, &mut item.encoding, Some(&mut self.decoding)) {
                match err.code {
                    Some(codes::DELTA_DECODE_FAILED) => {
                        self.start_decode_failure_recovery(ctx, err);
                        return;
                    }
                    // No way to ever decode these; recovering would loop.
                    Some(codes::DELTA_DECODER_MISSING) | Some(BROWSER_NO_DELTAS) => {
                        self.notify_state(ctx, ChannelState::Failed, Some(err), false, false, false);
                        return;
                    }
                    _ => {
                        error!(target: "realtime::channel", channel = %self.name, error = %err, "message decode failed");
                    }
                }
            }
            if item.connection_id.is_none() {
                item.connection_id = connection_id.clone();
            }
            if item.timestamp.is_none() {
                item.timestamp = timestamp;
            }
            if item.id.is_none() {
                if let Some(id) = &id {
                    item.id = Some(format!("{id}:{index}"));
                }
            }
        }
        self.last_payload.message_id = messages.last().and_then(|m| m.id.clone());
        self.last_payload.channel_serial = channel_serial;
        for item in messages {
            let _ = self.shared.messages.send(item);
        }
    }

    fn start_decode_failure_recovery(&mut self, ctx: &mut dyn ChannelContext, reason: ErrorInfo) {
        if self.decode_recovery {
            return;
        }
        warn!(target: "realtime::channel", channel = %self.name, error = %reason, "starting decode failure recovery");
        self.decode_recovery = true;
        self.attach_with(ctx, true, Some(reason), None);
    }
}

/// The engine's channels by name.
pub(crate) struct ChannelRegistry {
    channels: HashMap<String, ChannelMachine>,
    delta_decoder: Option<Arc<dyn DeltaDecoder>>,
}

impl ChannelRegistry {
    pub fn new(delta_decoder: Option<Arc<dyn DeltaDecoder>>) -> Self {
        Self {
            channels: HashMap::new(),
            delta_decoder,
        }
    }

    pub fn create(&mut self, name: String, shared: ChannelShared, options: ChannelOptions) {
        if self.channels.contains_key(&name) {
            return;
        }
        debug!(target: "realtime::channel", channel = %name, "channel created");
        let machine = ChannelMachine::new(name.clone(), options, shared, self.delta_decoder.clone());
        self.channels.insert(name, machine);
    }

    pub fn get(&self, name: &str) -> Option<&ChannelMachine> {
        self.channels.get(name)
    }

    pub fn command(&mut self, ctx: &mut dyn ChannelContext, name: &str, command: ChannelCommand) {
        match self.channels.get_mut(name) {
            Some(channel) => channel.handle(ctx, command),
            // A handle kept past `Channels::release`.
            None => {
                warn!(target: "realtime::channel", channel = %name, "command for released channel");
                command.reject(ErrorInfo::new(
                    format!("Channel {name} has been released"),
                    codes::CHANNEL_OPERATION_FAILED,
                    400,
                ));
            }
        }
    }

    pub fn release(&mut self, name: &str) -> Result<(), ErrorInfo> {
        let Some(channel) = self.channels.get(name) else {
            return Ok(());
        };
        if let Some(err) = channel.release_error() {
            return Err(err);
        }
        debug!(target: "realtime::channel", channel = %name, "channel released");
        self.channels.remove(name);
        Ok(())
    }

    pub fn on_message(&mut self, ctx: &mut dyn ChannelContext, message: ProtocolMessage) {
        let Some(name) = message.channel.clone() else {
            error!(target: "realtime::channel", action = %message.action, "received event for unspecified channel");
            return;
        };
        match self.channels.get_mut(&name) {
            Some(channel) => channel.on_message(ctx, message),
            None => {
                error!(target: "realtime::channel", channel = %name, action = %message.action, "received event for non-existent channel");
            }
        }
    }

    pub fn on_timer(&mut self, ctx: &mut dyn ChannelContext, key: &TimerKey) {
        let name = match key {
            TimerKey::ChannelState(name) | TimerKey::ChannelRetry(name) => name,
            _ => return,
        };
        if let Some(channel) = self.channels.get_mut(name) {
            channel.on_timer(ctx, key);
        }
    }

    pub fn on_interrupted(
        &mut self,
        ctx: &mut dyn ChannelContext,
        connection: ConnectionState,
        reason: &ErrorInfo,
    ) {
        for channel in self.channels.values_mut() {
            channel.on_interrupted(ctx, connection, reason);
        }
    }

    pub fn on_transport_active(&mut self, ctx: &mut dyn ChannelContext) {
        for channel in self.channels.values_mut() {
            channel.on_transport_active(ctx);
        }
    }

    pub fn on_new_connection_id(&mut self, ctx: &mut dyn ChannelContext) {
        for channel in self.channels.values_mut() {
            channel.on_new_connection_id(ctx);
        }
    }
}
