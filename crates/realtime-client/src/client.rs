//! The client and the single task that runs it.
//!
//! [`Realtime`] and the handles it gives out never touch connection or
//! channel state directly. They send [`Command`]s to the engine task, which
//! owns the connection manager and every channel, and read what the engine
//! publishes into shared snapshots.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::auth::{Auth, AuthProvider, StaticToken};
use crate::channel::{
    ChannelCommand, ChannelOptions, ChannelRegistry, ChannelShared, Channels,
    DeltaDecoder, DoneReply,
};
use crate::config::{ClientOptions, ConfigError};
use crate::connection::manager::{ManagerParts, Notice};
use crate::connection::{
    AuthReply, Connection, ConnectionManager, ConnectionShared, Input, TimerKey,
};
use crate::error::{ErrorInfo, RealtimeError};
use crate::protocol::codec::{Format, JsonCodec, WireCodec};
use crate::transport::{TransportRegistry, TransportSignal};

/// Requests from handles to the engine.
pub(crate) enum Command {
    Connect,
    Close,
    Ping(oneshot::Sender<Result<Duration, ErrorInfo>>),
    Authorize(AuthReply),
    NewChannel {
        name: String,
        shared: ChannelShared,
        options: ChannelOptions,
    },
    Channel {
        name: String,
        command: ChannelCommand,
    },
    ReleaseChannel {
        name: String,
        reply: DoneReply,
    },
}

/// Sends a command carrying a reply slot and waits for the answer.
pub(crate) async fn call<T>(
    commands: &mpsc::UnboundedSender<Command>,
    make: impl FnOnce(oneshot::Sender<Result<T, ErrorInfo>>) -> Command,
) -> Result<T, RealtimeError> {
    let (tx, rx) = oneshot::channel();
    commands.send(make(tx)).map_err(|_| RealtimeError::Shutdown)?;
    match rx.await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RealtimeError::Shutdown),
    }
}

/// Answers "is the internet up?" before the client burns through fallback hosts.
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn check(&self) -> bool;
}

/// GETs a well-known URL; reachable when the body says `yes`.
pub struct HttpConnectivityCheck {
    client: reqwest::Client,
    url: String,
}

impl HttpConnectivityCheck {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ConnectivityCheck for HttpConnectivityCheck {
    async fn check(&self) -> bool {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(target: "realtime::engine", url = %self.url, error = %err, "connectivity check failed");
                return false;
            }
        };
        if !response.status().is_success() {
            debug!(target: "realtime::engine", url = %self.url, status = %response.status(), "connectivity check failed");
            return false;
        }
        match response.text().await {
            Ok(body) => body.contains("yes"),
            Err(err) => {
                debug!(target: "realtime::engine", url = %self.url, error = %err, "connectivity check body unreadable");
                false
            }
        }
    }
}

impl fmt::Debug for HttpConnectivityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnectivityCheck")
            .field("url", &self.url)
            .finish()
    }
}

/// Owns all connection and channel state; see the module docs.
struct Engine {
    manager: ConnectionManager,
    channels: ChannelRegistry,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<TransportSignal>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        root: CancellationToken,
    ) {
        debug!(target: "realtime::engine", "engine started");
        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    // Every handle is gone.
                    None => break,
                },
                Some(signal) = signals.recv() => self.manager.on_transport_signal(signal),
                Some(input) = inputs.recv() => self.on_input(input),
            }
            self.drain();
        }
        self.manager.shutdown();
        self.drain();
        debug!(target: "realtime::engine", "engine stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.manager.connect(),
            Command::Close => self.manager.close(),
            Command::Ping(reply) => self.manager.ping(reply),
            Command::Authorize(reply) => self.manager.authorize(Some(reply)),
            Command::NewChannel {
                name,
                shared,
                options,
            } => self.channels.create(name, shared, options),
            Command::Channel { name, command } => {
                self.channels.command(&mut self.manager, &name, command)
            }
            Command::ReleaseChannel { name, reply } => {
                let _ = reply.send(self.channels.release(&name));
            }
        }
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Timer {
                key: key @ (TimerKey::ChannelState(_) | TimerKey::ChannelRetry(_)),
                generation,
            } => {
                if self.manager.timers.fire(&key, generation) {
                    self.channels.on_timer(&mut self.manager, &key);
                }
            }
            other => self.manager.on_input(other),
        }
    }

    /// Runs channel fan-out and next-tick work until neither has anything left.
    fn drain(&mut self) {
        loop {
            if let Some(notice) = self.manager.notices.pop_front() {
                self.on_notice(notice);
                continue;
            }
            if let Some(work) = self.manager.deferred.pop_front() {
                trace!(target: "realtime::engine", ?work, "deferred");
                self.manager.run_deferred(work);
                continue;
            }
            break;
        }
    }

    fn on_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Interrupted { state, reason } => {
                self.channels
                    .on_interrupted(&mut self.manager, state, &reason)
            }
            Notice::TransportActive => self.channels.on_transport_active(&mut self.manager),
            Notice::NewConnectionId => self.channels.on_new_connection_id(&mut self.manager),
            Notice::ChannelMessage(message) => self.channels.on_message(&mut self.manager, message),
        }
    }
}

/// Builds a [`Realtime`] with replaceable parts.
pub struct RealtimeBuilder {
    options: ClientOptions,
    registry: Option<TransportRegistry>,
    auth_provider: Option<Arc<dyn AuthProvider>>,
    connectivity: Option<Arc<dyn ConnectivityCheck>>,
    codec: Option<Arc<dyn WireCodec>>,
    delta_decoder: Option<Arc<dyn DeltaDecoder>>,
}

impl RealtimeBuilder {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            registry: None,
            auth_provider: None,
            connectivity: None,
            codec: None,
            delta_decoder: None,
        }
    }

    /// Transports to connect with; WebSocket and Comet by default.
    pub fn transports(mut self, registry: TransportRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    pub fn connectivity_check(mut self, check: Arc<dyn ConnectivityCheck>) -> Self {
        self.connectivity = Some(check);
        self
    }

    /// Needed for `Format::Binary`; JSON is built in.
    pub fn codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn delta_decoder(mut self, decoder: Arc<dyn DeltaDecoder>) -> Self {
        self.delta_decoder = Some(decoder);
        self
    }

    /// Spawns the engine on the current tokio runtime.
    pub fn build(self) -> Result<Realtime, ConfigError> {
        let Self {
            options,
            registry,
            auth_provider,
            connectivity,
            codec,
            delta_decoder,
        } = self;
        match options.validate() {
            Err(ConfigError::MissingCredentials) if auth_provider.is_some() => {}
            other => other?,
        }
        let client_id = options.client_id.clone();
        let auth = match (auth_provider, &options.key, &options.token) {
            (Some(provider), _, _) => Auth::token(provider, client_id.clone()),
            (None, Some(key), _) => Auth::basic(key.clone(), client_id.clone()),
            (None, None, Some(token)) => {
                Auth::token(Arc::new(StaticToken(token.clone())), client_id.clone())
            }
            (None, None, None) => return Err(ConfigError::MissingCredentials),
        };
        let codec: Arc<dyn WireCodec> = match codec {
            Some(codec) => codec,
            None => {
                if options.format != Format::Json {
                    warn!(target: "realtime::engine", format = %options.format, "no codec supplied for format; using json");
                }
                Arc::new(JsonCodec)
            }
        };
        let connectivity = connectivity.unwrap_or_else(|| {
            Arc::new(HttpConnectivityCheck::new(
                options.connectivity_check_url.clone(),
                options.timeouts.http_request,
            ))
        });
        let registry = registry.unwrap_or_else(TransportRegistry::network);
        let auto_connect = options.auto_connect;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let shared = ConnectionShared::new();

        let manager = ConnectionManager::new(ManagerParts {
            options,
            auth,
            registry,
            codec,
            connectivity,
            shared: shared.clone(),
            signals: signals_tx,
            inputs: inputs_tx,
            root: root.clone(),
        });
        let engine = Engine {
            manager,
            channels: ChannelRegistry::new(delta_decoder),
        };
        tokio::spawn(engine.run(commands_rx, signals_rx, inputs_rx, root.clone()));

        let realtime = Realtime {
            connection: Connection::new(commands_tx.clone(), shared),
            channels: Channels::new(commands_tx),
            client_id,
            root,
        };
        if auto_connect {
            realtime.connection.connect();
        }
        Ok(realtime)
    }
}

/// A realtime client: one connection and the channels riding on it.
pub struct Realtime {
    connection: Connection,
    channels: Channels,
    client_id: Option<String>,
    root: CancellationToken,
}

impl Realtime {
    /// Builds a client with the default transports; connects unless
    /// `auto_connect` is off.
    pub fn new(options: ClientOptions) -> Result<Self, ConfigError> {
        RealtimeBuilder::new(options).build()
    }

    pub fn builder(options: ClientOptions) -> RealtimeBuilder {
        RealtimeBuilder::new(options)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// The configured client id; the effective one can also come from a token.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Stops the engine without closing the connection politely. Handles
    /// fail with [`RealtimeError::Shutdown`] afterwards.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

impl Drop for Realtime {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

impl fmt::Debug for Realtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realtime")
            .field("client_id", &self.client_id)
            .field("connection", &self.connection)
            .field("channels", &self.channels)
            .finish()
    }
}
