//! Channels: the public handles plus the per-channel attach state machine
//! that runs on the engine task.

pub(crate) mod decode;
pub(crate) mod machine;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::client::{Command, call};
use crate::config::Timeouts;
use crate::connection::{ConnectionState, Timers};
use crate::error::{ErrorInfo, RealtimeError, codes};
use crate::presence::{MembersReply, Presence, PresenceQuery};
use crate::protocol::{ChannelModes, Message, PresenceAction, PresenceMessage, ProtocolMessage};
use crate::queue::Completion;

pub use decode::DeltaDecoder;
pub(crate) use machine::{ChannelMachine, ChannelRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl ChannelState {
    pub fn name(self) -> &'static str {
        match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    /// The attachment continued without a loss of message continuity.
    pub resumed: bool,
    pub has_backlog: bool,
    pub reason: Option<ErrorInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelStateChange),
    /// Something changed while the state stayed put, e.g. a non-resumed
    /// ATTACHED on an attached channel or a failed presence re-enter.
    Update(ChannelStateChange),
}

impl ChannelEvent {
    pub fn change(&self) -> &ChannelStateChange {
        match self {
            ChannelEvent::StateChanged(change) | ChannelEvent::Update(change) => change,
        }
    }
}

/// Per-channel options. An empty `params` means "none requested".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub modes: Option<ChannelModes>,
    pub params: BTreeMap<String, String>,
}

impl ChannelOptions {
    /// Whether moving from `previous` to these options needs a fresh ATTACH
    /// on a channel in `state`.
    pub(crate) fn needs_reattach(&self, previous: &ChannelOptions, state: ChannelState) -> bool {
        if !matches!(state, ChannelState::Attached | ChannelState::Attaching) {
            return false;
        }
        if !self.params.is_empty() {
            // The agent param is never echoed back in ATTACHED.
            let strip = |params: &BTreeMap<String, String>| {
                params
                    .iter()
                    .filter(|(k, _)| k.as_str() != "agent")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<BTreeMap<_, _>>()
            };
            if strip(&self.params) != strip(&previous.params) {
                return true;
            }
        }
        match (self.modes, previous.modes) {
            (Some(requested), Some(existing)) => requested != existing,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelSnapshot {
    pub state: ChannelState,
    pub error_reason: Option<ErrorInfo>,
    pub options: ChannelOptions,
    /// Modes and params the service granted in the last ATTACHED.
    pub modes: Option<ChannelModes>,
    pub params: BTreeMap<String, String>,
    pub attach_serial: Option<String>,
    pub channel_serial: Option<String>,
    pub presence_synced: bool,
}

/// What the engine publishes for one channel and the handles read.
#[derive(Clone)]
pub(crate) struct ChannelShared {
    pub snapshot: Arc<RwLock<ChannelSnapshot>>,
    pub events: broadcast::Sender<ChannelEvent>,
    pub messages: broadcast::Sender<Message>,
    pub presence: broadcast::Sender<PresenceMessage>,
}

impl ChannelShared {
    pub fn new(options: ChannelOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        let (messages, _) = broadcast::channel(1024);
        let (presence, _) = broadcast::channel(1024);
        Self {
            snapshot: Arc::new(RwLock::new(ChannelSnapshot {
                options,
                ..ChannelSnapshot::default()
            })),
            events,
            messages,
            presence,
        }
    }

    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

pub(crate) type AttachReply = oneshot::Sender<Result<Option<ChannelStateChange>, ErrorInfo>>;
pub(crate) type DoneReply = oneshot::Sender<Result<(), ErrorInfo>>;

/// Requests from channel and presence handles, executed on the engine task.
pub(crate) enum ChannelCommand {
    Attach(AttachReply),
    Detach(DoneReply),
    Publish {
        messages: Vec<Message>,
        reply: Completion,
    },
    SetOptions {
        options: ChannelOptions,
        reply: DoneReply,
    },
    Presence {
        action: PresenceAction,
        client_id: Option<String>,
        data: Value,
        reply: Completion,
    },
    PresenceGet {
        query: PresenceQuery,
        reply: MembersReply,
    },
}

impl ChannelCommand {
    /// Answers the command with `err` without running it.
    pub(crate) fn reject(self, err: ErrorInfo) {
        match self {
            ChannelCommand::Attach(reply) => {
                let _ = reply.send(Err(err));
            }
            ChannelCommand::Detach(reply) | ChannelCommand::SetOptions { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            ChannelCommand::Publish { reply, .. } | ChannelCommand::Presence { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            ChannelCommand::PresenceGet { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// What a channel needs from the connection it rides on.
pub(crate) trait ChannelContext {
    fn connection_state(&self) -> ConnectionState;
    /// The connection sends, or queues even without being asked to.
    fn can_transmit(&self) -> bool;
    /// The connection sends or queues; otherwise channel operations fail fast.
    fn is_active(&self) -> bool;
    fn connection_error(&self) -> ErrorInfo;
    fn connection_id(&self) -> Option<&str>;
    fn client_id(&self) -> Option<&str>;
    fn max_message_size(&self) -> usize;
    fn timeouts(&self) -> &Timeouts;
    fn queue_messages(&self) -> bool;
    fn send(&mut self, message: ProtocolMessage, queue_event: bool, completion: Option<Completion>);
    fn timers(&mut self) -> &mut Timers;
}

pub(crate) fn invalid_state_error(state: ChannelState, reason: Option<&ErrorInfo>) -> ErrorInfo {
    let err = ErrorInfo::new(
        format!("Channel operation failed as channel state is {state}"),
        codes::CHANNEL_OPERATION_FAILED,
        400,
    );
    match reason {
        Some(reason) => err.with_cause(reason.clone()),
        None => err,
    }
}

/// Handle on one named channel.
#[derive(Clone)]
pub struct Channel {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    shared: ChannelShared,
}

impl Channel {
    pub(crate) fn new(
        name: Arc<str>,
        commands: mpsc::UnboundedSender<Command>,
        shared: ChannelShared,
    ) -> Self {
        Self {
            name,
            commands,
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.snapshot.read().state
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.snapshot.read().error_reason.clone()
    }

    pub fn options(&self) -> ChannelOptions {
        self.shared.snapshot.read().options.clone()
    }

    /// Modes granted by the service on the last attach.
    pub fn modes(&self) -> Option<ChannelModes> {
        self.shared.snapshot.read().modes
    }

    pub fn params(&self) -> BTreeMap<String, String> {
        self.shared.snapshot.read().params.clone()
    }

    pub fn presence(&self) -> Presence {
        Presence::new(self.clone())
    }

    /// State changes and updates.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Attaches. Resolves with `None` when already attached.
    pub async fn attach(&self) -> Result<Option<ChannelStateChange>, RealtimeError> {
        self.command(ChannelCommand::Attach).await
    }

    pub async fn detach(&self) -> Result<(), RealtimeError> {
        self.command(ChannelCommand::Detach).await
    }

    /// Publishes one message and resolves when the service acknowledges it.
    pub async fn publish(
        &self,
        name: impl Into<String>,
        data: impl Into<Value>,
    ) -> Result<(), RealtimeError> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<(), RealtimeError> {
        self.command(|reply| ChannelCommand::Publish { messages, reply })
            .await
    }

    /// Messages on this channel. Attaches the channel.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<Message>, RealtimeError> {
        if self.state() == ChannelState::Failed {
            return Err(self.invalid_state_error().into());
        }
        let messages = self.shared.messages.subscribe();
        self.attach().await?;
        Ok(messages)
    }

    /// Replaces the options; an attached channel re-attaches when they
    /// change what the service would grant, and this resolves once it has.
    pub async fn set_options(&self, options: ChannelOptions) -> Result<(), RealtimeError> {
        self.command(|reply| ChannelCommand::SetOptions { options, reply })
            .await
    }

    pub(crate) fn invalid_state_error(&self) -> ErrorInfo {
        let snapshot = self.shared.snapshot.read();
        invalid_state_error(snapshot.state, snapshot.error_reason.as_ref())
    }

    pub(crate) fn shared(&self) -> &ChannelShared {
        &self.shared
    }

    pub(crate) async fn command<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, ErrorInfo>>) -> ChannelCommand,
    ) -> Result<T, RealtimeError> {
        let name = self.name.to_string();
        call(&self.commands, move |reply| Command::Channel {
            name,
            command: make(reply),
        })
        .await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// The client's channels, created on first use.
#[derive(Clone)]
pub struct Channels {
    commands: mpsc::UnboundedSender<Command>,
    all: Arc<Mutex<HashMap<String, Channel>>>,
}

impl Channels {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            commands,
            all: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, name: &str) -> Channel {
        let mut all = self.all.lock();
        if let Some(channel) = all.get(name) {
            return channel.clone();
        }
        self.create(&mut all, name, ChannelOptions::default())
    }

    /// Like [`Channels::get`], applying `options`. Refuses options that would
    /// make an attached channel re-attach; use [`Channel::set_options`] for those.
    pub fn get_with_options(
        &self,
        name: &str,
        options: ChannelOptions,
    ) -> Result<Channel, ErrorInfo> {
        let mut all = self.all.lock();
        let Some(channel) = all.get(name).cloned() else {
            return Ok(self.create(&mut all, name, options));
        };
        let (previous, state) = {
            let snapshot = channel.shared.snapshot.read();
            (snapshot.options.clone(), snapshot.state)
        };
        if options.needs_reattach(&previous, state) {
            return Err(ErrorInfo::new(
                "Channels::get_with_options() cannot be used to set channel options that would cause the channel to reattach. Please use Channel::set_options() instead.",
                codes::BAD_REQUEST,
                400,
            ));
        }
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Channel {
            name: name.to_string(),
            command: ChannelCommand::SetOptions { options, reply },
        });
        Ok(channel)
    }

    fn create(&self, all: &mut HashMap<String, Channel>, name: &str, options: ChannelOptions) -> Channel {
        let shared = ChannelShared::new(options.clone());
        let name: Arc<str> = Arc::from(name);
        let _ = self.commands.send(Command::NewChannel {
            name: name.to_string(),
            shared: shared.clone(),
            options,
        });
        let channel = Channel::new(Arc::clone(&name), self.commands.clone(), shared);
        all.insert(name.to_string(), channel.clone());
        channel
    }

    pub fn exists(&self, name: &str) -> bool {
        self.all.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.all.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Forgets a channel that can no longer receive anything (initialized,
    /// detached or failed).
    pub async fn release(&self, name: &str) -> Result<(), RealtimeError> {
        if !self.exists(name) {
            return Ok(());
        }
        let owned = name.to_string();
        call(&self.commands, move |reply| Command::ReleaseChannel {
            name: owned,
            reply,
        })
        .await?;
        self.all.lock().remove(name);
        Ok(())
    }
}

impl fmt::Debug for Channels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channels")
            .field("names", &self.names())
            .finish()
    }
}
