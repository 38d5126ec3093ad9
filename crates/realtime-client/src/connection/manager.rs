//! The connection state machine.
//!
//! Everything here runs on the engine task. Transports, timers and the
//! spawned auth/connectivity work report back through the engine's input
//! channels; the manager never blocks. Work that must happen "on the next
//! tick" (after the current state change is visible to channels) goes on
//! [`ConnectionManager::deferred`], and fan-out to channels goes on
//! [`ConnectionManager::notices`]. The engine drains both after every input.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    AuthReply, ConnectionEvent, ConnectionShared, ConnectionState, ConnectionStateChange, Input,
    ManagerState, RecoveryKey, TimerKey, Timers,
};
use crate::auth::{Auth, TokenDetails};
use crate::channel::ChannelContext;
use crate::client::ConnectivityCheck;
use crate::config::{ClientOptions, Timeouts, TransportKind};
use crate::error::{ErrorInfo, codes, is_retriable, is_token_error};
use crate::protocol::codec::WireCodec;
use crate::protocol::{Action, AuthDetails, ConnectionDetails, ProtocolMessage};
use crate::queue::{Completion, MessageQueue, PendingMessage};
use crate::retry::retry_time;
use crate::session::ProtocolSession;
use crate::transport::{
    ConnectMode, Transport, TransportEvent, TransportId, TransportParams, TransportRegistry,
    TransportSignal, TransportSink,
};

const AUTO_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Why a transport was proposed; decides what happens when it fails.
#[derive(Debug, Clone)]
pub(crate) enum Purpose {
    /// The cached preferred transport, raced against its own timeout.
    Preference,
    /// The base transport; `candidates` are the fallback hosts not yet tried.
    Base { candidates: Vec<String> },
    Upgrade,
}

#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub params: TransportParams,
    pub kind: TransportKind,
    pub purpose: Purpose,
}

/// Created, not yet viable.
struct Proposed {
    transport: Arc<dyn Transport>,
    attempt: Attempt,
}

/// Viable, waiting for (or holding) its CONNECTED.
struct Pending {
    transport: Arc<dyn Transport>,
    params: TransportParams,
    connected: bool,
}

/// An upgrade transport connected and the SYNC handover is under way.
struct UpgradeSync {
    transport: TransportId,
    error: Option<ErrorInfo>,
    connection_id: String,
    connection_key: Option<String>,
    details: Option<ConnectionDetails>,
    connection_reset: bool,
    /// Session to drain before swapping; `None` if nothing was active.
    old: Option<TransportId>,
    serial: Option<i64>,
    synced: bool,
}

struct PendingPing {
    reply: oneshot::Sender<Result<Duration, ErrorInfo>>,
    started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthWait {
    /// Resolved by the CONNECTED acknowledging an in-band AUTH.
    Details,
    /// Resolved when the connection next reaches `connected`.
    Connected,
}

struct AuthWaiter {
    reply: AuthReply,
    token: TokenDetails,
    wait: AuthWait,
}

/// Connection-level happenings channels react to.
#[derive(Debug, Clone)]
pub(crate) enum Notice {
    /// The connection entered a state that neither sends nor queues.
    Interrupted {
        state: ConnectionState,
        reason: ErrorInfo,
    },
    TransportActive,
    NewConnectionId,
    ChannelMessage(ProtocolMessage),
}

/// Next-tick work.
#[derive(Debug)]
pub(crate) enum Deferred {
    StartConnect,
    ConnectImpl(TransportParams),
    DisconnectAll,
    AutoReconnect,
    UpgradeIfNeeded(TransportParams),
    NewConnectionId,
}

/// What the engine hands the manager at construction.
pub(crate) struct ManagerParts {
    pub options: ClientOptions,
    pub auth: Auth,
    pub registry: TransportRegistry,
    pub codec: Arc<dyn WireCodec>,
    pub connectivity: Arc<dyn ConnectivityCheck>,
    pub shared: ConnectionShared,
    pub signals: mpsc::UnboundedSender<TransportSignal>,
    pub inputs: mpsc::UnboundedSender<Input>,
    pub root: CancellationToken,
}

pub(crate) struct ConnectionManager {
    options: ClientOptions,
    auth: Auth,
    registry: TransportRegistry,
    codec: Arc<dyn WireCodec>,
    connectivity: Arc<dyn ConnectivityCheck>,
    shared: ConnectionShared,
    signals: mpsc::UnboundedSender<TransportSignal>,
    inputs: mpsc::UnboundedSender<Input>,
    pub(crate) timers: Timers,
    root: CancellationToken,
    /// Replaced on every connect start and every disconnect-all; credential
    /// fetches and connectivity checks run under it.
    scope: CancellationToken,

    state: ManagerState,
    connecting_fail_state: ManagerState,
    connecting_queue_events: bool,
    transition_target: ManagerState,
    error_reason: Option<ErrorInfo>,
    client_id: Option<String>,

    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: Option<i64>,
    msg_serial: i64,
    recover: Option<String>,

    max_message_size: usize,
    connection_state_ttl: Duration,
    max_idle_interval: Option<Duration>,
    last_activity: Option<Instant>,
    hosts: Vec<String>,

    transport_preference: Option<TransportKind>,
    force_fallback_host: bool,
    preference_expired: bool,
    preference_params: Option<TransportParams>,

    next_transport_id: u64,
    proposed: Vec<Proposed>,
    pending: Vec<Pending>,
    active: Option<ProtocolSession>,
    /// Superseded sessions finishing their in-flight messages.
    retiring: Vec<ProtocolSession>,
    upgrade: Option<UpgradeSync>,

    queue: MessageQueue,
    pings: HashMap<String, PendingPing>,
    auth_waiters: Vec<AuthWaiter>,
    disconnected_retry_count: u32,
    last_auto_reconnect: Option<Instant>,

    pub(crate) notices: VecDeque<Notice>,
    pub(crate) deferred: VecDeque<Deferred>,
}

fn default_error(state: ManagerState) -> Option<ErrorInfo> {
    match state {
        ManagerState::Disconnected => Some(ErrorInfo::disconnected()),
        ManagerState::Suspended => Some(ErrorInfo::suspended()),
        ManagerState::Failed => Some(ErrorInfo::failed()),
        ManagerState::Closing => Some(ErrorInfo::closing()),
        ManagerState::Closed => Some(ErrorInfo::closed()),
        _ => None,
    }
}

fn is_token_reason(reason: &Option<ErrorInfo>) -> bool {
    reason.as_ref().is_some_and(is_token_error)
}

impl ConnectionManager {
    pub fn new(parts: ManagerParts) -> Self {
        let ManagerParts {
            mut options,
            auth,
            registry,
            codec,
            connectivity,
            shared,
            signals,
            inputs,
            root,
        } = parts;
        options.transports.retain(|kind| registry.supports(*kind));
        if options.transports.is_empty() {
            warn!(target: "realtime::connection", ?registry, "none of the requested transports is available");
        }
        let hosts = std::iter::once(options.primary_host())
            .chain(options.fallback_hosts())
            .collect();
        let scope = root.child_token();
        Self {
            auth,
            registry,
            codec,
            connectivity,
            shared,
            signals,
            timers: Timers::new(inputs.clone()),
            inputs,
            scope,
            root,

            state: ManagerState::Initialized,
            connecting_fail_state: ManagerState::Disconnected,
            connecting_queue_events: true,
            transition_target: ManagerState::Connecting,
            error_reason: None,
            client_id: options.client_id.clone(),

            connection_id: None,
            connection_key: None,
            connection_serial: None,
            msg_serial: 0,
            recover: options.recover.clone(),

            max_message_size: options.max_message_size,
            connection_state_ttl: options.timeouts.connection_state_ttl,
            max_idle_interval: None,
            last_activity: None,
            hosts,

            transport_preference: None,
            force_fallback_host: false,
            preference_expired: false,
            preference_params: None,

            next_transport_id: 1,
            proposed: Vec::new(),
            pending: Vec::new(),
            active: None,
            retiring: Vec::new(),
            upgrade: None,

            queue: MessageQueue::new(),
            pings: HashMap::new(),
            auth_waiters: Vec::new(),
            disconnected_retry_count: 0,
            last_auto_reconnect: None,

            notices: VecDeque::new(),
            deferred: VecDeque::new(),
            options,
        }
    }

    /// Transport currently carrying the connection, if any.
    pub fn active_transport(&self) -> Option<TransportId> {
        self.active.as_ref().map(ProtocolSession::transport_id)
    }

    fn queue_events(&self) -> bool {
        match self.state {
            ManagerState::Initialized
            | ManagerState::Disconnected
            | ManagerState::Synchronizing => true,
            ManagerState::Connecting => self.connecting_queue_events,
            _ => false,
        }
    }

    fn fail_state(&self) -> ManagerState {
        match self.state {
            ManagerState::Connecting => self.connecting_fail_state,
            ManagerState::Closing => ManagerState::Closed,
            _ => ManagerState::Disconnected,
        }
    }

    // ---- public requests ------------------------------------------------

    pub fn connect(&mut self) {
        self.request_state(ManagerState::Connecting, None);
    }

    pub fn close(&mut self) {
        self.request_state(ManagerState::Closing, None);
    }

    /// Engine shutdown: stop everything and fail whoever is still waiting.
    pub fn shutdown(&mut self) {
        debug!(target: "realtime::connection", state = %self.state, "shutting down");
        self.root.cancel();
        self.timers.cancel_all();
        for proposed in self.proposed.drain(..) {
            proposed.transport.dispose();
        }
        for pending in self.pending.drain(..) {
            pending.transport.dispose();
        }
        if let Some(active) = self.active.take() {
            active.transport().close();
        }
        for mut session in self.retiring.drain(..) {
            session.transport().dispose();
            for message in session.take_pending() {
                message.complete(Err(ErrorInfo::closed()));
            }
        }
        self.queue.complete_all_messages(ErrorInfo::closed());
        for (_, ping) in self.pings.drain() {
            let _ = ping.reply.send(Err(ErrorInfo::closed()));
        }
        for waiter in self.auth_waiters.drain(..) {
            let _ = waiter.reply.send(Err(ErrorInfo::closed()));
        }
    }

    // ---- state machine --------------------------------------------------

    fn request_state(&mut self, state: ManagerState, error: Option<ErrorInfo>) {
        if state.public() == self.state.public() {
            return;
        }
        self.timers.cancel(&TimerKey::Transition);
        self.timers.cancel(&TimerKey::Retry);
        self.check_suspend_timer(state);
        if state == ManagerState::Connecting && self.state.public() == ConnectionState::Connected {
            return;
        }
        if state == ManagerState::Closing && self.state == ManagerState::Closed {
            return;
        }
        let reason = error.or_else(|| default_error(state));
        self.enact_state_change(state, reason, None);
        match state {
            ManagerState::Connecting => self.deferred.push_back(Deferred::StartConnect),
            ManagerState::Closing => self.close_impl(),
            _ => {}
        }
    }

    fn notify_state(&mut self, state: ManagerState, error: Option<ErrorInfo>, retry_hint: bool) {
        let retry_immediately = state == ManagerState::Disconnected
            && (matches!(
                self.state,
                ManagerState::Connected | ManagerState::Synchronizing
            ) || retry_hint
                || (self.state == ManagerState::Connecting
                    && is_token_reason(&error)
                    && !is_token_reason(&self.error_reason)));

        if state.public() == self.state.public() {
            return;
        }
        self.timers.cancel(&TimerKey::Transition);
        self.timers.cancel(&TimerKey::Retry);
        self.check_suspend_timer(state);
        if matches!(state, ManagerState::Suspended | ManagerState::Connected) {
            self.disconnected_retry_count = 0;
        }
        if self.state.is_terminal() {
            return;
        }

        let retry_in = match state {
            ManagerState::Disconnected => {
                self.disconnected_retry_count += 1;
                Some(retry_time(
                    self.options.timeouts.disconnected_retry,
                    self.disconnected_retry_count,
                ))
            }
            ManagerState::Suspended => Some(self.options.timeouts.suspended_retry),
            _ => None,
        };
        let reason = error.or_else(|| default_error(state));

        if retry_immediately {
            self.schedule_auto_reconnect();
        } else if let Some(delay) = retry_in {
            self.timers.start(TimerKey::Retry, delay);
        }
        if (state == ManagerState::Disconnected && !retry_immediately)
            || state == ManagerState::Suspended
            || state.is_terminal()
        {
            self.deferred.push_back(Deferred::DisconnectAll);
        }
        if state == ManagerState::Connected && self.active.is_none() {
            warn!(target: "realtime::connection", "connected with no active transport");
        }

        self.enact_state_change(state, reason.clone(), retry_in);

        if self.state.send_events() {
            self.send_queued();
        } else if !self.queue_events() {
            let reason = reason.unwrap_or_else(ErrorInfo::unknown_connection);
            self.notices.push_back(Notice::Interrupted {
                state: state.public(),
                reason: reason.clone(),
            });
            self.queue.complete_all_messages(reason);
        }
    }

    fn enact_state_change(
        &mut self,
        state: ManagerState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) {
        let previous = self.state.public();
        match &reason {
            Some(reason) if state == ManagerState::Failed => {
                error!(target: "realtime::connection", state = %state, error = %reason, "connection state");
            }
            Some(reason) => {
                info!(target: "realtime::connection", state = %state, error = %reason, "connection state");
            }
            None => info!(target: "realtime::connection", state = %state, "connection state"),
        }
        self.state = state;
        if let Some(reason) = &reason {
            self.error_reason = Some(reason.clone());
        }
        if state.is_terminal() || state == ManagerState::Suspended {
            // The service has discarded our connection by now.
            self.clear_connection();
        }
        self.publish_snapshot();
        self.shared
            .emit(ConnectionEvent::StateChanged(ConnectionStateChange {
                previous,
                current: state.public(),
                retry_in,
                reason: reason.clone(),
            }));
        self.resolve_auth_waiters_on_state(state, reason);
    }

    fn schedule_auto_reconnect(&mut self) {
        match self.last_auto_reconnect.map(|at| at.elapsed()) {
            Some(since) if since < AUTO_RECONNECT_INTERVAL => {
                self.timers
                    .start(TimerKey::AutoReconnect, AUTO_RECONNECT_INTERVAL - since);
            }
            _ => self.deferred.push_back(Deferred::AutoReconnect),
        }
    }

    fn auto_reconnect(&mut self) {
        if self.state == ManagerState::Disconnected {
            self.last_auto_reconnect = Some(Instant::now());
            self.request_state(ManagerState::Connecting, None);
        }
    }

    fn start_transition_timer(&mut self, target: ManagerState) {
        self.transition_target = target;
        let delay = match target {
            ManagerState::Closing => self.options.timeouts.realtime_request,
            _ => self.options.timeouts.connecting(),
        };
        self.timers.start(TimerKey::Transition, delay);
    }

    fn start_suspend_timer(&mut self) {
        self.timers
            .start_if_idle(TimerKey::Suspend, self.connection_state_ttl);
    }

    fn check_suspend_timer(&mut self, state: ManagerState) {
        if !matches!(
            state,
            ManagerState::Disconnected | ManagerState::Suspended | ManagerState::Connecting
        ) {
            self.cancel_suspend_timer();
        }
    }

    fn cancel_suspend_timer(&mut self) {
        self.connecting_fail_state = ManagerState::Disconnected;
        self.connecting_queue_events = true;
        self.timers.cancel(&TimerKey::Suspend);
    }

    fn replace_scope(&mut self) {
        self.scope.cancel();
        self.scope = self.root.child_token();
    }

    // ---- connecting -----------------------------------------------------

    fn start_connect(&mut self) {
        if self.state != ManagerState::Connecting {
            return;
        }
        self.replace_scope();
        self.start_suspend_timer();
        self.start_transition_timer(ManagerState::Connecting);
        if self.auth.is_basic() {
            self.connect_with_params();
            return;
        }
        let force = is_token_reason(&self.error_reason);
        let auth = self.auth.clone();
        let scope = self.scope.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = scope.cancelled() => return,
                result = auth.authorize(force) => result,
            };
            let _ = inputs.send(Input::Authorized { scope, result });
        });
    }

    fn on_authorized(
        &mut self,
        scope: CancellationToken,
        result: Result<Option<TokenDetails>, ErrorInfo>,
    ) {
        if scope.is_cancelled() {
            return;
        }
        match result {
            Ok(_) => self.connect_with_params(),
            Err(err) => self.act_on_error_from_authorize(err),
        }
    }

    fn connect_with_params(&mut self) {
        self.check_connection_state_freshness();
        let params = self.get_transport_params();
        self.connect_impl(params);
    }

    fn act_on_error_from_authorize(&mut self, err: ErrorInfo) {
        warn!(target: "realtime::connection", error = %err, "authorization failed");
        if matches!(
            err.code,
            Some(codes::NO_MEANS_TO_RENEW) | Some(codes::INCOMPATIBLE_CLIENT_ID)
        ) {
            self.notify_state(ManagerState::Failed, Some(err), false);
        } else if err.status_code == Some(403) {
            let wrapped = ErrorInfo::new(
                "Client configured authentication provider returned 403; failing the connection",
                codes::AUTH_PROVIDER_FAILED,
                403,
            )
            .with_cause(err);
            self.notify_state(ManagerState::Failed, Some(wrapped), false);
        } else {
            let wrapped = ErrorInfo::new(
                "Client configured authentication provider request failed",
                codes::AUTH_PROVIDER_FAILED,
                401,
            )
            .with_cause(err);
            let fail_state = self.fail_state();
            self.notify_state(fail_state, Some(wrapped), false);
        }
    }

    fn check_connection_state_freshness(&mut self) {
        let (Some(last_activity), Some(_)) = (self.last_activity, &self.connection_id) else {
            return;
        };
        let since = last_activity.elapsed();
        if since > self.connection_state_ttl + self.max_idle_interval.unwrap_or_default() {
            debug!(target: "realtime::connection", since_ms = since.as_millis() as u64, "connection state is stale; starting afresh");
            self.clear_connection();
            self.connecting_fail_state = ManagerState::Suspended;
        }
    }

    fn primary_host(&self) -> String {
        self.hosts
            .first()
            .cloned()
            .unwrap_or_else(|| self.options.primary_host())
    }

    fn get_transport_params(&mut self) -> TransportParams {
        let host = self.primary_host();
        if self.connection_key.is_some() {
            return self.create_transport_params(host, ConnectMode::Resume);
        }
        if let Some(raw) = &self.recover {
            match RecoveryKey::parse(raw) {
                Some(recovered) => {
                    self.msg_serial = recovered.msg_serial;
                    return self.create_transport_params(host, ConnectMode::Recover);
                }
                None => {
                    warn!(target: "realtime::connection", recover = %raw, "ignoring malformed recovery key");
                }
            }
        }
        self.create_transport_params(host, ConnectMode::Clean)
    }

    fn create_transport_params(&self, host: String, mode: ConnectMode) -> TransportParams {
        let (connection_key, connection_serial) = match mode {
            ConnectMode::Resume => (self.connection_key.clone(), self.connection_serial),
            ConnectMode::Upgrade => (self.connection_key.clone(), None),
            ConnectMode::Recover => match self.recover.as_deref().and_then(RecoveryKey::parse) {
                Some(recovered) => (
                    Some(recovered.connection_key),
                    Some(recovered.connection_serial),
                ),
                None => (None, None),
            },
            ConnectMode::Clean => (None, None),
        };
        TransportParams {
            host,
            port: self.options.effective_port(),
            tls: self.options.tls,
            mode,
            connection_key,
            connection_serial,
            client_id: self.auth.client_id().map(str::to_string),
            echo_messages: self.options.echo_messages,
            heartbeats: None,
            stream: None,
            auth_params: self.auth.auth_params(),
            transport_params: self.options.transport_params.clone(),
            timeouts: self.options.timeouts.clone(),
            codec: Arc::clone(&self.codec),
        }
    }

    fn connect_impl(&mut self, params: TransportParams) {
        if !matches!(
            self.state,
            ManagerState::Connecting | ManagerState::Connected | ManagerState::Synchronizing
        ) {
            debug!(target: "realtime::connection", state = %self.state, "state changed before the attempt started; not connecting");
            return;
        }
        if !self.pending.is_empty() {
            debug!(target: "realtime::connection", pending = self.pending.len(), "transports pending; waiting for them");
            return;
        }
        if self.state.public() == ConnectionState::Connected {
            self.upgrade_if_needed(params);
        } else if self.options.transports.len() > 1 && self.transport_preference.is_some() {
            self.connect_preference(params);
        } else {
            self.connect_base(params);
        }
    }

    fn connect_preference(&mut self, mut params: TransportParams) {
        let Some(kind) = self.transport_preference else {
            self.connect_base(params);
            return;
        };
        if !self.options.transports.contains(&kind) {
            self.transport_preference = None;
            self.connect_impl(params);
            return;
        }
        debug!(target: "realtime::connection", transport = %kind, "trying preferred transport");
        self.preference_expired = false;
        self.preference_params = Some(params.clone());
        self.timers
            .start(TimerKey::Preference, self.options.timeouts.preference_connect);
        params.host = self.primary_host();
        self.try_a_transport(Attempt {
            params,
            kind,
            purpose: Purpose::Preference,
        });
    }

    fn on_preference_timeout(&mut self) {
        debug!(target: "realtime::connection", "preferred transport timed out");
        self.preference_expired = true;
        if self.state.public() != ConnectionState::Connected {
            self.disconnect_all_transports(false);
            self.transport_preference = None;
        }
        if let Some(params) = self.preference_params.take() {
            self.connect_impl(params);
        }
    }

    fn connect_base(&mut self, mut params: TransportParams) {
        let Some(kind) = self.options.base_transport() else {
            self.give_up(ErrorInfo::new(
                "No transports available",
                codes::CONNECTION_FAILED,
                400,
            ));
            return;
        };
        let mut candidates = self.hosts.clone();
        if candidates.is_empty() {
            self.give_up(ErrorInfo::new(
                "Unable to connect (no available host)",
                codes::DISCONNECTED,
                404,
            ));
            return;
        }
        let host = candidates.remove(0);
        if self.force_fallback_host && !candidates.is_empty() {
            self.force_fallback_host = false;
            self.try_fallback_hosts(params, candidates);
            return;
        }
        params.host = host;
        self.try_a_transport(Attempt {
            params,
            kind,
            purpose: Purpose::Base { candidates },
        });
    }

    fn give_up(&mut self, err: ErrorInfo) {
        let fail_state = self.connecting_fail_state;
        self.notify_state(fail_state, Some(err), false);
    }

    fn try_fallback_hosts(&mut self, params: TransportParams, candidates: Vec<String>) {
        if candidates.is_empty() {
            self.give_up(ErrorInfo::new(
                "Unable to connect (and no more fallback hosts to try)",
                codes::DISCONNECTED,
                404,
            ));
            return;
        }
        let check = Arc::clone(&self.connectivity);
        let scope = self.scope.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let reachable = tokio::select! {
                _ = scope.cancelled() => return,
                reachable = check.check() => reachable,
            };
            let _ = inputs.send(Input::Connectivity {
                scope,
                reachable,
                params,
                candidates,
            });
        });
    }

    fn on_connectivity(
        &mut self,
        scope: CancellationToken,
        reachable: bool,
        mut params: TransportParams,
        mut candidates: Vec<String>,
    ) {
        if scope.is_cancelled() || self.state != ManagerState::Connecting {
            return;
        }
        if !reachable {
            self.give_up(ErrorInfo::new(
                "Unable to connect (network unreachable)",
                codes::DISCONNECTED,
                404,
            ));
            return;
        }
        let Some(kind) = self.options.base_transport() else {
            return;
        };
        let index = rand::thread_rng().gen_range(0..candidates.len());
        params.host = candidates.remove(index);
        debug!(target: "realtime::connection", host = %params.host, "trying fallback host");
        self.try_a_transport(Attempt {
            params,
            kind,
            purpose: Purpose::Base { candidates },
        });
    }

    fn upgrade_if_needed(&mut self, params: TransportParams) {
        let Some(current) = self.active.as_ref().map(|s| s.transport().kind()) else {
            return;
        };
        let upgrades = self.options.upgrade_transports();
        let start = upgrades
            .iter()
            .position(|kind| *kind == current)
            .map_or(0, |index| index + 1);
        for kind in upgrades.into_iter().skip(start) {
            debug!(target: "realtime::connection", from = %current, to = %kind, "trying upgrade");
            let params = self.create_transport_params(params.host.clone(), ConnectMode::Upgrade);
            self.try_a_transport(Attempt {
                params,
                kind,
                purpose: Purpose::Upgrade,
            });
        }
    }

    fn try_a_transport(&mut self, attempt: Attempt) {
        let Attempt {
            mut params,
            kind,
            purpose,
        } = attempt;
        params.auth_params = self.auth.auth_params();
        if kind == TransportKind::WebSocket {
            params.heartbeats = Some(true);
        }
        let Some(factory) = self.registry.get(kind).cloned() else {
            let err = ErrorInfo::new(
                format!("No {kind} transport registered"),
                codes::INTERNAL,
                500,
            );
            self.on_attempt_failed(
                Attempt {
                    params,
                    kind,
                    purpose,
                },
                err,
                false,
            );
            return;
        };
        let id = TransportId(self.next_transport_id);
        self.next_transport_id += 1;
        debug!(target: "realtime::connection", transport = %id, kind = %kind, params = %params, "trying transport");
        let transport = factory.create(
            id,
            params.clone(),
            TransportSink::new(id, self.signals.clone()),
            self.root.child_token(),
        );
        self.timers.start(
            TimerKey::Viability(id),
            self.options.timeouts.realtime_request,
        );
        self.proposed.push(Proposed {
            transport: Arc::clone(&transport),
            attempt: Attempt {
                params,
                kind,
                purpose,
            },
        });
        transport.connect();
    }

    fn on_viability_timeout(&mut self, id: TransportId) {
        let Some(index) = self.proposed.iter().position(|p| p.transport.id() == id) else {
            return;
        };
        let proposed = self.proposed.remove(index);
        proposed.transport.dispose();
        self.on_attempt_failed(
            proposed.attempt,
            ErrorInfo::new(
                "Timeout waiting for transport to indicate itself viable",
                codes::INTERNAL,
                500,
            ),
            false,
        );
    }

    fn on_proposed_event(&mut self, index: usize, event: TransportEvent) {
        match event {
            TransportEvent::Preconnect => {
                let proposed = self.proposed.remove(index);
                self.timers
                    .cancel(&TimerKey::Viability(proposed.transport.id()));
                self.on_viable(proposed);
            }
            TransportEvent::Connected { .. } => {
                let proposed = self.proposed.remove(index);
                let id = proposed.transport.id();
                self.timers.cancel(&TimerKey::Viability(id));
                if self.on_viable(proposed) {
                    self.on_transport_event(id, event);
                }
            }
            TransportEvent::Disconnected(err) | TransportEvent::Closed(err) => {
                let proposed = self.proposed.remove(index);
                self.timers
                    .cancel(&TimerKey::Viability(proposed.transport.id()));
                debug!(target: "realtime::connection", transport = %proposed.transport.id(), error = %err, "transport attempt failed");
                self.on_attempt_failed(proposed.attempt, err, false);
            }
            TransportEvent::Failed(err) => {
                let proposed = self.proposed.remove(index);
                self.timers
                    .cancel(&TimerKey::Viability(proposed.transport.id()));
                debug!(target: "realtime::connection", transport = %proposed.transport.id(), error = %err, "transport attempt failed fatally");
                self.on_attempt_failed(proposed.attempt, err, true);
            }
            other => {
                trace!(target: "realtime::connection", event = other.name(), "ignoring event from proposed transport");
            }
        }
    }

    /// Returns whether the transport became pending.
    fn on_viable(&mut self, proposed: Proposed) -> bool {
        let Proposed { transport, attempt } = proposed;
        if matches!(
            self.state,
            ManagerState::Closing | ManagerState::Closed | ManagerState::Failed
        ) {
            debug!(target: "realtime::connection", state = %self.state, transport = %transport.id(), "connection went away during the attempt; closing transport");
            transport.close();
            self.settle(attempt, true);
            return false;
        }
        if let Purpose::Preference = attempt.purpose {
            self.timers.cancel(&TimerKey::Preference);
            if self.preference_expired {
                debug!(target: "realtime::connection", transport = %transport.id(), "preferred transport arrived too late");
                transport.dispose();
                return false;
            }
        }
        debug!(target: "realtime::connection", transport = %transport.id(), mode = %attempt.params.mode, "viable transport; setting pending");
        self.pending.push(Pending {
            transport,
            params: attempt.params,
            connected: false,
        });
        true
    }

    fn on_attempt_failed(&mut self, attempt: Attempt, err: ErrorInfo, failed: bool) {
        if matches!(
            self.state,
            ManagerState::Closing | ManagerState::Closed | ManagerState::Failed
        ) {
            self.settle(attempt, true);
            return;
        }
        if err.is_token_error() && !is_token_reason(&self.error_reason) {
            self.error_reason = Some(err);
            self.auth.invalidate();
            let auth = self.auth.clone();
            let scope = self.scope.clone();
            let inputs = self.inputs.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = scope.cancelled() => return,
                    result = auth.authorize(true) => result,
                };
                let _ = inputs.send(Input::TokenRenewed {
                    scope,
                    result,
                    retry: attempt,
                });
            });
            return;
        }
        if failed {
            self.notify_state(ManagerState::Failed, Some(err), false);
            self.settle(attempt, true);
        } else if !is_retriable(&err) {
            let fail_state = self.connecting_fail_state;
            self.notify_state(fail_state, Some(err), false);
            self.settle(attempt, true);
        } else {
            self.settle(attempt, false);
        }
    }

    fn on_token_renewed(
        &mut self,
        scope: CancellationToken,
        result: Result<Option<TokenDetails>, ErrorInfo>,
        attempt: Attempt,
    ) {
        if scope.is_cancelled() {
            return;
        }
        match result {
            Ok(_) => self.try_a_transport(attempt),
            Err(err) => self.act_on_error_from_authorize(err),
        }
    }

    /// What a failed attempt leads to, by purpose.
    fn settle(&mut self, attempt: Attempt, fatal: bool) {
        match attempt.purpose {
            Purpose::Preference => {
                self.timers.cancel(&TimerKey::Preference);
                if !fatal {
                    self.transport_preference = None;
                    self.connect_impl(attempt.params);
                }
            }
            Purpose::Base { candidates } => {
                if !fatal {
                    self.try_fallback_hosts(attempt.params, candidates);
                }
            }
            Purpose::Upgrade => {}
        }
    }

    // ---- transport events -----------------------------------------------

    pub fn on_transport_signal(&mut self, signal: TransportSignal) {
        let TransportSignal { id, event } = signal;
        if let Some(index) = self.proposed.iter().position(|p| p.transport.id() == id) {
            self.on_proposed_event(index, event);
            return;
        }
        self.on_transport_event(id, event);
    }

    fn on_transport_event(&mut self, id: TransportId, event: TransportEvent) {
        if self.active_transport() == Some(id) {
            self.last_activity = Some(Instant::now());
        }
        match event {
            TransportEvent::Preconnect => {}
            TransportEvent::Connected {
                error,
                connection_id,
                connection_key,
                connection_serial,
                details,
            } => self.on_transport_connected(
                id,
                error,
                connection_id,
                connection_key,
                connection_serial,
                details,
            ),
            TransportEvent::Heartbeat { id: ping_id } => self.on_heartbeat(ping_id),
            TransportEvent::Ack { serial, count } => {
                if let Some(session) = self.session_mut(id) {
                    session.on_ack(serial, count);
                }
            }
            TransportEvent::Nack {
                serial,
                count,
                error,
            } => {
                if let Some(session) = self.session_mut(id) {
                    session.on_nack(serial, count, error);
                }
            }
            TransportEvent::Sync {
                connection_serial,
                connection_id,
            } => self.on_sync(id, connection_serial, connection_id),
            TransportEvent::Message(message) => self.on_channel_message(id, message),
            TransportEvent::Disconnected(err) => {
                self.deactivate_transport(id, ManagerState::Disconnected, err)
            }
            TransportEvent::Closed(err) => self.deactivate_transport(id, ManagerState::Closed, err),
            TransportEvent::Failed(err) => self.deactivate_transport(id, ManagerState::Failed, err),
        }
    }

    fn session_mut(&mut self, id: TransportId) -> Option<&mut ProtocolSession> {
        if self.active_transport() == Some(id) {
            return self.active.as_mut();
        }
        self.retiring.iter_mut().find(|s| s.transport_id() == id)
    }

    fn on_transport_connected(
        &mut self,
        id: TransportId,
        error: Option<ErrorInfo>,
        connection_id: String,
        connection_key: Option<String>,
        connection_serial: Option<i64>,
        details: Option<ConnectionDetails>,
    ) {
        if let Some(pending) = self.pending.iter_mut().find(|p| p.transport.id() == id) {
            if pending.connected {
                return;
            }
            pending.connected = true;
            let params = pending.params.clone();
            if params.mode == ConnectMode::Upgrade && self.active.is_some() {
                self.schedule_transport_activation(
                    id,
                    error,
                    connection_id,
                    connection_key,
                    details,
                );
            } else {
                self.activate_transport(
                    id,
                    error,
                    connection_id,
                    connection_key,
                    connection_serial,
                    details,
                );
                self.deferred.push_back(Deferred::ConnectImpl(params.clone()));
            }
            if params.mode == ConnectMode::Recover && self.recover.take().is_some() {
                debug!(target: "realtime::connection", "recovery key used; discarding it");
            }
            return;
        }

        let Some(transport) = self.active.as_ref().map(|s| Arc::clone(s.transport())) else {
            return;
        };
        if transport.id() != id {
            return;
        }
        // A repeat CONNECTED on the live transport, e.g. acknowledging a reauth.
        self.on_connection_details_update(details, &transport);
        if let Some(error) = &error {
            self.error_reason = Some(error.clone());
            self.publish_snapshot();
        }
        let current = self.state.public();
        self.shared.emit(ConnectionEvent::Update(ConnectionStateChange {
            previous: current,
            current,
            retry_in: None,
            reason: error,
        }));
    }

    fn schedule_transport_activation(
        &mut self,
        id: TransportId,
        error: Option<ErrorInfo>,
        connection_id: String,
        connection_key: Option<String>,
        details: Option<ConnectionDetails>,
    ) {
        let Some(index) = self.pending.iter().position(|p| p.transport.id() == id) else {
            return;
        };
        let transport = Arc::clone(&self.pending[index].transport);
        let abandon = |manager: &mut Self, why: &str| {
            debug!(target: "realtime::connection", transport = %id, state = %manager.state, "abandoning upgrade: {why}");
            if let Some(index) = manager.pending.iter().position(|p| p.transport.id() == id) {
                manager.pending.remove(index).transport.disconnect(None);
            }
        };
        if !matches!(
            self.state,
            ManagerState::Connected | ManagerState::Connecting
        ) {
            abandon(self, "connection is not up");
            return;
        }
        let current_rank = self
            .active
            .as_ref()
            .map_or(0, |s| s.transport().kind().preference_rank());
        if transport.kind().preference_rank() <= current_rank {
            abandon(self, "active transport is at least as good");
            return;
        }
        if !transport.is_connected() {
            abandon(self, "transport is no longer connected");
            return;
        }
        let old = if self.state == ManagerState::Connected {
            // Hold outbound traffic until the handover completes.
            self.state = ManagerState::Synchronizing;
            self.active_transport()
        } else {
            None
        };
        let connection_reset = self.connection_id.as_deref() != Some(connection_id.as_str());
        if connection_reset {
            warn!(
                target: "realtime::connection",
                transport = %id,
                old = ?self.connection_id,
                new = %connection_id,
                "upgrade produced a new connection id"
            );
        }
        info!(target: "realtime::connection", transport = %id, kind = %transport.kind(), "syncing upgrade transport");
        self.upgrade = Some(UpgradeSync {
            transport: id,
            error,
            connection_id,
            connection_key,
            details,
            connection_reset,
            old,
            serial: None,
            synced: false,
        });
        self.timers.start(
            TimerKey::UpgradeSync,
            self.options.timeouts.realtime_request,
        );
        let mut sync = ProtocolMessage::new(Action::Sync);
        sync.connection_key = self.connection_key.clone();
        sync.connection_serial = self.connection_serial;
        if let Err(err) = transport.send(sync) {
            self.on_upgrade_sync_failed(err);
        }
    }

    fn on_sync(&mut self, id: TransportId, connection_serial: Option<i64>, connection_id: String) {
        let own_serial = self.connection_serial;
        let Some(upgrade) = self.upgrade.as_mut() else {
            trace!(target: "realtime::connection", transport = %id, "sync with no upgrade in progress");
            return;
        };
        if upgrade.transport != id || upgrade.synced {
            return;
        }
        self.timers.cancel(&TimerKey::UpgradeSync);
        if connection_id != upgrade.connection_id {
            debug!(target: "realtime::connection", sync = %connection_id, connected = %upgrade.connection_id, "sync names a different connection id");
        }
        upgrade.serial = if upgrade.connection_reset {
            connection_serial
        } else {
            own_serial
        };
        upgrade.synced = true;
        let old = upgrade.old;

        let draining = match (old, self.active.as_mut()) {
            (Some(old), Some(session)) if session.transport_id() == old => Some(session.once_idle()),
            _ => None,
        };
        match draining {
            Some(idle) => {
                debug!(target: "realtime::connection", transport = %id, "sync done; waiting for old transport to drain");
                let inputs = self.inputs.clone();
                let cancel = self.root.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = idle => {
                            let _ = inputs.send(Input::Drained { transport: id });
                        }
                    }
                });
            }
            None => self.finish_upgrade(),
        }
    }

    fn on_drained(&mut self, id: TransportId) {
        if self
            .upgrade
            .as_ref()
            .is_some_and(|u| u.transport == id && u.synced)
        {
            self.finish_upgrade();
        }
    }

    fn finish_upgrade(&mut self) {
        let Some(upgrade) = self.upgrade.take() else {
            return;
        };
        info!(target: "realtime::connection", transport = %upgrade.transport, "activating upgrade transport");
        let serial = upgrade.serial;
        self.activate_transport(
            upgrade.transport,
            upgrade.error,
            upgrade.connection_id,
            upgrade.connection_key,
            serial,
            upgrade.details,
        );
        if upgrade.connection_reset {
            self.connection_serial = serial;
        }
        if self.state == ManagerState::Synchronizing {
            self.state = ManagerState::Connected;
        }
        if self.state.send_events() {
            self.send_queued();
        }
    }

    fn on_upgrade_sync_failed(&mut self, err: ErrorInfo) {
        self.timers.cancel(&TimerKey::UpgradeSync);
        let upgrade = self.upgrade.take();
        warn!(
            target: "realtime::connection",
            transport = ?upgrade.as_ref().map(|u| u.transport),
            error = %err,
            "upgrade sync failed"
        );
        self.disconnect_all_transports(false);
    }

    fn activate_transport(
        &mut self,
        id: TransportId,
        error: Option<ErrorInfo>,
        connection_id: String,
        connection_key: Option<String>,
        connection_serial: Option<i64>,
        details: Option<ConnectionDetails>,
    ) -> bool {
        let Some(index) = self.pending.iter().position(|p| p.transport.id() == id) else {
            warn!(target: "realtime::connection", transport = %id, "asked to activate a transport that is not pending");
            return false;
        };
        let kind = self.pending[index].transport.kind();
        if self.options.upgrade_transports().contains(&kind) {
            self.transport_preference = Some(kind);
        }
        if let Some(error) = &error {
            error!(target: "realtime::connection", transport = %id, error = %error, "activating transport with error");
        }
        if matches!(
            self.state,
            ManagerState::Closing | ManagerState::Closed | ManagerState::Failed
        ) {
            debug!(target: "realtime::connection", state = %self.state, transport = %id, "disconnecting transport and abandoning");
            self.pending.remove(index).transport.disconnect(None);
            return false;
        }
        let transport = self.pending.remove(index).transport;
        if !transport.is_connected() {
            debug!(target: "realtime::connection", transport = %id, "transport no longer connected; abandoning");
            return false;
        }
        debug!(target: "realtime::connection", transport = %id, kind = %kind, connection_id = %connection_id, "activating transport");

        let previous = self.active.replace(ProtocolSession::new(Arc::clone(&transport)));
        self.last_activity = Some(Instant::now());

        if connection_key.is_some() && connection_key != self.connection_key {
            self.set_connection(
                connection_id,
                connection_key,
                connection_serial.unwrap_or(-1),
                error.is_some(),
            );
        }
        self.on_connection_details_update(details, &transport);

        if self.state.public() == ConnectionState::Connected {
            if let Some(error) = error {
                self.error_reason = Some(error.clone());
                self.publish_snapshot();
                self.shared.emit(ConnectionEvent::Update(ConnectionStateChange {
                    previous: ConnectionState::Connected,
                    current: ConnectionState::Connected,
                    retry_in: None,
                    reason: Some(error),
                }));
            }
        } else {
            self.notify_state(ManagerState::Connected, error.clone(), false);
            self.error_reason = error;
            self.publish_snapshot();
        }

        self.notices.push_back(Notice::TransportActive);
        for ping_id in self.pings.keys() {
            transport.ping(ping_id);
        }

        if let Some(mut previous) = previous {
            if previous.pending_count() > 0 {
                warn!(
                    target: "realtime::connection",
                    transport = %previous.transport_id(),
                    pending = previous.pending_count(),
                    "previous transport still has messages in flight"
                );
            }
            previous.finish();
            self.retiring.push(previous);
        }

        let dropped: Vec<TransportId> = self.pending.iter().map(|p| p.transport.id()).collect();
        for pending in self.pending.drain(..) {
            pending.transport.disconnect(None);
        }
        for proposed in self.proposed.drain(..) {
            self.timers
                .cancel(&TimerKey::Viability(proposed.transport.id()));
            proposed.transport.dispose();
        }
        if self
            .upgrade
            .as_ref()
            .is_some_and(|u| dropped.contains(&u.transport))
        {
            self.timers.cancel(&TimerKey::UpgradeSync);
            self.upgrade = None;
        }
        true
    }

    fn deactivate_transport(&mut self, id: TransportId, end: ManagerState, error: ErrorInfo) {
        let was_active = self.active_transport() == Some(id);
        let was_pending = match self.pending.iter().position(|p| p.transport.id() == id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        };
        let was_retiring = match self.retiring.iter().position(|s| s.transport_id() == id) {
            Some(index) => {
                let mut session = self.retiring.remove(index);
                let leftovers = session.take_pending();
                if !leftovers.is_empty() {
                    debug!(target: "realtime::connection", transport = %id, count = leftovers.len(), "requeueing messages from retired transport");
                    self.queue.prepend(leftovers);
                }
                true
            }
            None => false,
        };
        if !was_active && !was_pending {
            if !was_retiring {
                trace!(target: "realtime::connection", transport = %id, "event from defunct transport");
            }
            self.fail_stranded_messages();
            return;
        }
        let no_scheduled = self.pending.iter().all(|p| !p.transport.is_connected());
        debug!(
            target: "realtime::connection",
            transport = %id,
            end = %end,
            was_active,
            was_pending,
            error = %error,
            "deactivating transport"
        );

        if was_active {
            if let Some(mut session) = self.active.take() {
                let leftovers = session.take_pending();
                if !leftovers.is_empty() {
                    debug!(target: "realtime::connection", count = leftovers.len(), "requeueing in-flight messages");
                    self.queue.prepend(leftovers);
                }
            }
        }

        if self.upgrade.as_ref().is_some_and(|u| u.transport == id) {
            // The upgrade candidate died mid-handover; carry on with the old transport.
            self.timers.cancel(&TimerKey::UpgradeSync);
            self.upgrade = None;
            if self.state == ManagerState::Synchronizing && self.active.is_some() {
                self.state = ManagerState::Connected;
                self.send_queued();
            }
        }

        let is_state_change = (was_active && no_scheduled)
            || (was_active && end == ManagerState::Failed)
            || end == ManagerState::Closed
            || (self.active.is_none() && was_pending && self.pending.is_empty());

        if is_state_change {
            if end == ManagerState::Disconnected
                && error.status_code.is_some_and(|status| status >= 500)
                && self.hosts.len() > 1
            {
                // Retry at once, on a fallback host.
                self.transport_preference = None;
                self.force_fallback_host = true;
                self.notify_state(end, Some(error), true);
            } else {
                let end = if end == ManagerState::Failed && error.is_token_error() {
                    ManagerState::Disconnected
                } else {
                    end
                };
                self.notify_state(end, Some(error), false);
            }
        } else if was_active
            && end == ManagerState::Disconnected
            && self.state != ManagerState::Synchronizing
        {
            // Another transport is connected and about to take over.
            self.start_suspend_timer();
            self.start_transition_timer(ManagerState::Connecting);
            self.notify_state(ManagerState::Connecting, Some(error), false);
        }
        self.fail_stranded_messages();
    }

    /// Requeued messages must not sit in a queue nothing will drain.
    fn fail_stranded_messages(&mut self) {
        if !self.queue.is_empty() && !self.queue_events() && !self.state.send_events() {
            let reason = self
                .error_reason
                .clone()
                .or_else(|| default_error(self.state))
                .unwrap_or_else(ErrorInfo::unknown_connection);
            self.queue.complete_all_messages(reason);
        }
    }

    fn disconnect_all_transports(&mut self, except_active: bool) {
        debug!(target: "realtime::connection", except_active, "disconnecting all transports");
        self.replace_scope();
        for pending in self.pending.drain(..) {
            pending.transport.disconnect(None);
        }
        for proposed in self.proposed.drain(..) {
            self.timers
                .cancel(&TimerKey::Viability(proposed.transport.id()));
            proposed.transport.dispose();
        }
        if self.upgrade.take().is_some() {
            self.timers.cancel(&TimerKey::UpgradeSync);
        }
        if !except_active {
            if let Some(session) = &self.active {
                session.transport().disconnect(None);
            }
        }
    }

    fn close_impl(&mut self) {
        debug!(target: "realtime::connection", "closing connection");
        self.cancel_suspend_timer();
        self.start_transition_timer(ManagerState::Closing);
        for pending in &self.pending {
            pending.transport.close();
        }
        for proposed in self.proposed.drain(..) {
            self.timers
                .cancel(&TimerKey::Viability(proposed.transport.id()));
            proposed.transport.dispose();
        }
        if let Some(session) = &self.active {
            session.transport().close();
        }
        self.notify_state(ManagerState::Closed, None, false);
    }

    // ---- connection identity ------------------------------------------

    fn set_connection(
        &mut self,
        connection_id: String,
        connection_key: Option<String>,
        connection_serial: i64,
        has_error: bool,
    ) {
        let changed = self.connection_id.as_deref() != Some(connection_id.as_str());
        let lost = match &self.connection_id {
            Some(_) => changed,
            None => has_error,
        };
        if lost {
            // Failed resume or recover: serials restart with the new connection.
            debug!(target: "realtime::connection", "connection resume or recover failed; resetting msgSerial");
            self.msg_serial = 0;
            self.queue.reset_send_attempted();
        }
        if changed {
            self.deferred.push_back(Deferred::NewConnectionId);
        }
        debug!(target: "realtime::connection", connection_id = %connection_id, "new connection");
        self.connection_id = Some(connection_id);
        self.connection_key = connection_key;
        self.connection_serial = Some(connection_serial);
        self.publish_snapshot();
    }

    fn clear_connection(&mut self) {
        self.connection_id = None;
        self.connection_key = None;
        self.connection_serial = None;
        self.msg_serial = 0;
        self.publish_snapshot();
    }

    fn on_connection_details_update(
        &mut self,
        details: Option<ConnectionDetails>,
        transport: &Arc<dyn Transport>,
    ) {
        let Some(details) = details else {
            return;
        };
        if let Some(size) = details.max_message_size {
            self.max_message_size = size;
        }
        if let Some(client_id) = &details.client_id {
            if let Some(configured) = self.auth.client_id() {
                if configured != "*" && client_id != "*" && configured != client_id {
                    let err = ErrorInfo::new(
                        format!("Unexpected clientId mismatch: client has {configured}, requested {client_id}"),
                        codes::INCOMPATIBLE_CLIENT_ID,
                        401,
                    );
                    error!(target: "realtime::connection", error = %err, "client id mismatch");
                    transport.fail(err);
                    return;
                }
            }
            self.client_id = Some(client_id.clone());
        }
        if let Some(ttl) = details.connection_state_ttl {
            self.connection_state_ttl = Duration::from_millis(ttl);
        }
        self.max_idle_interval = details.max_idle_interval.map(Duration::from_millis);
        self.resolve_auth_waiters(AuthWait::Details, Ok(()));
    }

    fn publish_snapshot(&self) {
        let mut snapshot = self.shared.snapshot.write();
        snapshot.state = self.state.public();
        snapshot.id = self.connection_id.clone();
        snapshot.key = self.connection_key.clone();
        snapshot.serial = self.connection_serial;
        snapshot.recovery_key = self.connection_key.as_ref().map(|key| {
            RecoveryKey {
                connection_key: key.clone(),
                connection_serial: self.connection_serial.unwrap_or(-1),
                msg_serial: self.msg_serial,
            }
            .to_string()
        });
        snapshot.error_reason = self.error_reason.clone();
    }

    // ---- outbound -------------------------------------------------------

    pub fn send(
        &mut self,
        message: ProtocolMessage,
        queue_event: bool,
        completion: Option<Completion>,
    ) {
        if self.state.send_events() {
            self.send_impl(PendingMessage::new(message, completion));
            return;
        }
        if (queue_event && self.queue_events()) || self.state.force_queue_events() {
            trace!(target: "realtime::connection", %message, "queueing message");
            self.queue
                .push_bundled(PendingMessage::new(message, completion), self.max_message_size);
            return;
        }
        let err = self.error_reason.clone().unwrap_or_else(|| {
            ErrorInfo::new(
                format!(
                    "rejecting event, queueEvent was {queue_event}, state was {}",
                    self.state.public()
                ),
                codes::INVALID_STATE,
                400,
            )
        });
        debug!(target: "realtime::connection", %message, error = %err, "rejecting message");
        if let Some(completion) = completion {
            let _ = completion.send(Err(err));
        }
    }

    fn send_impl(&mut self, mut pending: PendingMessage) {
        let Some(session) = self.active.as_mut() else {
            self.queue.push(pending);
            return;
        };
        if pending.ack_required && !pending.send_attempted {
            pending.message.msg_serial = Some(self.msg_serial);
            self.msg_serial += 1;
        }
        session.send(pending);
        self.publish_snapshot();
    }

    fn send_queued(&mut self) {
        if self.active.is_none() {
            return;
        }
        trace!(target: "realtime::connection", queued = self.queue.len(), "sending queued messages");
        while let Some(pending) = self.queue.shift() {
            self.send_impl(pending);
        }
    }

    // ---- inbound --------------------------------------------------------

    fn on_channel_message(&mut self, id: TransportId, message: ProtocolMessage) {
        let on_active = self.active_transport() == Some(id);
        let on_upgrade = self.state == ManagerState::Synchronizing
            && self.pending.iter().any(|p| p.transport.id() == id);
        if !(on_active || on_upgrade) {
            if message.action == Action::Error {
                self.notices.push_back(Notice::ChannelMessage(message));
            } else {
                debug!(target: "realtime::connection", transport = %id, %message, "message on defunct transport; discarding");
            }
            return;
        }
        if let Some(serial) = message.connection_serial {
            if self.connection_serial.is_some_and(|current| serial <= current) {
                debug!(
                    target: "realtime::connection",
                    serial,
                    current = ?self.connection_serial,
                    "duplicate message; discarding"
                );
                return;
            }
            self.connection_serial = Some(serial);
            self.publish_snapshot();
        }
        if message.action == Action::Auth && message.channel.is_none() {
            info!(target: "realtime::connection", "service requested reauthorization");
            self.authorize(None);
            return;
        }
        self.notices.push_back(Notice::ChannelMessage(message));
    }

    // ---- ping -----------------------------------------------------------

    pub fn ping(&mut self, reply: oneshot::Sender<Result<Duration, ErrorInfo>>) {
        let transport = match (&self.active, self.state.public()) {
            (Some(session), ConnectionState::Connected) => Arc::clone(session.transport()),
            _ => {
                let _ = reply.send(Err(ErrorInfo::new(
                    "Unable to ping service; not connected",
                    codes::BAD_REQUEST,
                    400,
                )));
                return;
            }
        };
        let id = uuid::Uuid::new_v4().simple().to_string();
        trace!(target: "realtime::connection", ping = %id, transport = %transport.id(), "ping");
        self.timers.start(
            TimerKey::Ping(id.clone()),
            self.options.timeouts.realtime_request,
        );
        self.pings.insert(
            id.clone(),
            PendingPing {
                reply,
                started: Instant::now(),
            },
        );
        transport.ping(&id);
    }

    fn on_heartbeat(&mut self, id: Option<String>) {
        let Some(id) = id else {
            return;
        };
        if let Some(ping) = self.pings.remove(&id) {
            self.timers.cancel(&TimerKey::Ping(id));
            let _ = ping.reply.send(Ok(ping.started.elapsed()));
        }
    }

    // ---- reauthorization ----------------------------------------------

    /// Forces a new token and applies it to the connection.
    pub fn authorize(&mut self, reply: Option<AuthReply>) {
        let auth = self.auth.clone();
        let cancel = self.root.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = auth.authorize(true) => result,
            };
            let _ = inputs.send(Input::Reauthorized { result, reply });
        });
    }

    fn on_reauthorized(
        &mut self,
        result: Result<Option<TokenDetails>, ErrorInfo>,
        reply: Option<AuthReply>,
    ) {
        match result {
            Ok(Some(token)) => self.on_auth_updated(token, reply),
            Ok(None) => {
                // Basic auth has nothing to renew.
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(None));
                }
            }
            Err(err) => {
                if err.status_code == Some(403) {
                    self.act_on_error_from_authorize(err.clone());
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }

    fn on_auth_updated(&mut self, token: TokenDetails, reply: Option<AuthReply>) {
        match self.state {
            ManagerState::Connected | ManagerState::Synchronizing => {
                debug!(target: "realtime::connection", "sending AUTH on active transport");
                if (!self.pending.is_empty() || !self.proposed.is_empty())
                    && self.state != ManagerState::Synchronizing
                {
                    // Restart any unscheduled upgrade with the new token.
                    self.disconnect_all_transports(true);
                    if let Some(session) = &self.active {
                        let params = session.transport().params().clone();
                        self.deferred.push_back(Deferred::UpgradeIfNeeded(params));
                    }
                }
                if let Some(session) = &self.active {
                    session.transport().on_auth_updated(&token.token);
                }
                let mut message = ProtocolMessage::new(Action::Auth);
                message.auth = Some(AuthDetails {
                    access_token: token.token.clone(),
                });
                self.send(message, false, None);
                self.push_auth_waiter(reply, token, AuthWait::Details);
            }
            ManagerState::Connecting => {
                debug!(target: "realtime::connection", "restarting connection attempts with new token");
                self.disconnect_all_transports(false);
                self.push_auth_waiter(reply, token, AuthWait::Connected);
                self.start_connect();
            }
            _ => {
                self.push_auth_waiter(reply, token, AuthWait::Connected);
                self.request_state(ManagerState::Connecting, None);
            }
        }
    }

    fn push_auth_waiter(&mut self, reply: Option<AuthReply>, token: TokenDetails, wait: AuthWait) {
        let Some(reply) = reply else {
            return;
        };
        self.auth_waiters.push(AuthWaiter { reply, token, wait });
        self.timers
            .start(TimerKey::Reauth, self.options.timeouts.realtime_request);
    }

    fn resolve_auth_waiters(&mut self, wait: AuthWait, outcome: Result<(), ErrorInfo>) {
        let (ready, rest): (Vec<_>, Vec<_>) = self
            .auth_waiters
            .drain(..)
            .partition(|waiter| waiter.wait == wait);
        self.auth_waiters = rest;
        for waiter in ready {
            let result = outcome.clone().map(|()| Some(waiter.token));
            let _ = waiter.reply.send(result);
        }
        if self.auth_waiters.is_empty() {
            self.timers.cancel(&TimerKey::Reauth);
        }
    }

    fn resolve_auth_waiters_on_state(&mut self, state: ManagerState, reason: Option<ErrorInfo>) {
        if self.auth_waiters.is_empty() {
            return;
        }
        let reason = reason
            .or_else(|| default_error(state))
            .unwrap_or_else(ErrorInfo::unknown_connection);
        match state {
            ManagerState::Connected => self.resolve_auth_waiters(AuthWait::Connected, Ok(())),
            ManagerState::Failed => {
                self.resolve_auth_waiters(AuthWait::Connected, Err(reason.clone()));
                self.resolve_auth_waiters(AuthWait::Details, Err(reason));
            }
            ManagerState::Closed | ManagerState::Suspended => {
                self.resolve_auth_waiters(AuthWait::Connected, Err(reason));
            }
            _ => {}
        }
    }

    // ---- engine plumbing --------------------------------------------------

    pub fn on_input(&mut self, input: Input) {
        match input {
            Input::Timer { key, generation } => {
                if self.timers.fire(&key, generation) {
                    self.on_timer(key);
                }
            }
            Input::Authorized { scope, result } => self.on_authorized(scope, result),
            Input::TokenRenewed {
                scope,
                result,
                retry,
            } => self.on_token_renewed(scope, result, retry),
            Input::Reauthorized { result, reply } => self.on_reauthorized(result, reply),
            Input::Connectivity {
                scope,
                reachable,
                params,
                candidates,
            } => self.on_connectivity(scope, reachable, params, candidates),
            Input::Drained { transport } => self.on_drained(transport),
        }
    }

    /// Handles an expiry already claimed with [`Timers::fire`].
    pub fn on_timer(&mut self, key: TimerKey) {
        trace!(target: "realtime::connection", ?key, "timer expired");
        match key {
            TimerKey::Transition => {
                let fail_state = match self.transition_target {
                    ManagerState::Closing => ManagerState::Closed,
                    _ => self.connecting_fail_state,
                };
                debug!(target: "realtime::connection", state = %self.state, to = %fail_state, "transition timed out");
                self.notify_state(fail_state, None, false);
            }
            TimerKey::Suspend => {
                self.connecting_fail_state = ManagerState::Suspended;
                self.connecting_queue_events = false;
                self.notify_state(ManagerState::Suspended, None, false);
            }
            TimerKey::Retry => self.request_state(ManagerState::Connecting, None),
            TimerKey::Preference => self.on_preference_timeout(),
            TimerKey::UpgradeSync => self.on_upgrade_sync_failed(ErrorInfo::new(
                "Timeout waiting for sync response",
                codes::INTERNAL,
                500,
            )),
            TimerKey::AutoReconnect => self.auto_reconnect(),
            TimerKey::Reauth => {
                let err = ErrorInfo::new(
                    "Timeout waiting for reauthorization",
                    codes::INTERNAL,
                    500,
                );
                for waiter in self.auth_waiters.drain(..) {
                    let _ = waiter.reply.send(Err(err.clone()));
                }
            }
            TimerKey::Viability(id) => self.on_viability_timeout(id),
            TimerKey::Ping(id) => {
                if let Some(ping) = self.pings.remove(&id) {
                    let _ = ping.reply.send(Err(ErrorInfo::new(
                        "Timeout waiting for heartbeat response",
                        codes::INTERNAL,
                        500,
                    )));
                }
            }
            TimerKey::ChannelState(_) | TimerKey::ChannelRetry(_) => {}
        }
    }

    pub fn run_deferred(&mut self, work: Deferred) {
        match work {
            Deferred::StartConnect => self.start_connect(),
            Deferred::ConnectImpl(params) => self.connect_impl(params),
            Deferred::DisconnectAll => self.disconnect_all_transports(false),
            Deferred::AutoReconnect => self.auto_reconnect(),
            Deferred::UpgradeIfNeeded(params) => {
                if self.state.public() == ConnectionState::Connected {
                    self.upgrade_if_needed(params);
                }
            }
            Deferred::NewConnectionId => self.notices.push_back(Notice::NewConnectionId),
        }
    }
}

impl ChannelContext for ConnectionManager {
    fn connection_state(&self) -> ConnectionState {
        self.state.public()
    }

    fn can_transmit(&self) -> bool {
        self.state.send_events() || self.state.force_queue_events()
    }

    fn is_active(&self) -> bool {
        self.queue_events() || self.state.send_events()
    }

    fn connection_error(&self) -> ErrorInfo {
        self.error_reason
            .clone()
            .or_else(|| default_error(self.state))
            .unwrap_or_else(ErrorInfo::unknown_connection)
    }

    fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref().or(self.auth.client_id())
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn timeouts(&self) -> &Timeouts {
        &self.options.timeouts
    }

    fn queue_messages(&self) -> bool {
        self.options.queue_messages
    }

    fn send(&mut self, message: ProtocolMessage, queue_event: bool, completion: Option<Completion>) {
        ConnectionManager::send(self, message, queue_event, completion);
    }

    fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }
}
