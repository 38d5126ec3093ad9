use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::codec::Format;

pub const DEFAULT_HOST: &str = "realtime.ably.io";
pub const PROTOCOL_VERSION: &str = "1.2";
pub const LIBRARY_ID: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));
pub const CONNECTIVITY_CHECK_URL: &str =
    "https://internet-up.ably-realtime.com/is-the-internet-up.txt";
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_536;

const FALLBACK_SUFFIXES: [char; 5] = ['a', 'b', 'c', 'd', 'e'];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no means to authenticate: set a key or a token")]
    MissingCredentials,
    #[error("invalid key {0:?}: expected <name>:<secret>")]
    InvalidKey(String),
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),
    #[error("unknown channel mode {0:?}")]
    UnknownMode(String),
    #[error("no transports requested")]
    NoTransports,
}

/// Network mechanisms the client can carry protocol envelopes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Comet,
    WebSocket,
}

impl TransportKind {
    /// Lowest to highest preference.
    pub const PREFERENCE_ORDER: [TransportKind; 2] = [TransportKind::Comet, TransportKind::WebSocket];
    const BASE_ORDER: [TransportKind; 2] = [TransportKind::Comet, TransportKind::WebSocket];
    const UPGRADE_ORDER: [TransportKind; 1] = [TransportKind::WebSocket];

    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Comet => "comet",
            TransportKind::WebSocket => "web_socket",
        }
    }

    pub fn preference_rank(self) -> usize {
        Self::PREFERENCE_ORDER
            .iter()
            .position(|kind| *kind == self)
            .unwrap_or(0)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "web_socket" | "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "comet" | "xhr" | "xhr_streaming" | "xhr_polling" => Ok(TransportKind::Comet),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

/// Timeout knobs, all overridable from the environment as `REALTIME_<NAME>_MS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub disconnected_retry: Duration,
    pub suspended_retry: Duration,
    pub channel_retry: Duration,
    pub connection_state_ttl: Duration,
    pub realtime_request: Duration,
    pub preference_connect: Duration,
    pub http_request: Duration,
    pub recv: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            disconnected_retry: Duration::from_millis(15_000),
            suspended_retry: Duration::from_millis(30_000),
            channel_retry: Duration::from_millis(15_000),
            connection_state_ttl: Duration::from_millis(120_000),
            realtime_request: Duration::from_millis(10_000),
            preference_connect: Duration::from_millis(6_000),
            http_request: Duration::from_millis(15_000),
            recv: Duration::from_millis(90_000),
        }
    }
}

impl Timeouts {
    pub fn connecting(&self) -> Duration {
        self.preference_connect + self.realtime_request
    }

    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            disconnected_retry: env_ms("REALTIME_DISCONNECTED_RETRY_MS", defaults.disconnected_retry),
            suspended_retry: env_ms("REALTIME_SUSPENDED_RETRY_MS", defaults.suspended_retry),
            channel_retry: env_ms("REALTIME_CHANNEL_RETRY_MS", defaults.channel_retry),
            connection_state_ttl: env_ms(
                "REALTIME_CONNECTION_STATE_TTL_MS",
                defaults.connection_state_ttl,
            ),
            realtime_request: env_ms("REALTIME_REALTIME_REQUEST_MS", defaults.realtime_request),
            preference_connect: env_ms("REALTIME_PREFERENCE_CONNECT_MS", defaults.preference_connect),
            http_request: env_ms("REALTIME_HTTP_REQUEST_MS", defaults.http_request),
            recv: env_ms("REALTIME_RECV_MS", defaults.recv),
        }
    }
}

fn env_ms(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub key: Option<String>,
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub environment: Option<String>,
    pub realtime_host: Option<String>,
    pub fallback_hosts: Option<Vec<String>>,
    pub port: u16,
    pub tls_port: u16,
    pub tls: bool,
    pub transports: Vec<TransportKind>,
    pub format: Format,
    pub echo_messages: bool,
    pub queue_messages: bool,
    pub auto_connect: bool,
    pub recover: Option<String>,
    pub transport_params: BTreeMap<String, String>,
    pub max_message_size: usize,
    pub connectivity_check_url: String,
    pub timeouts: Timeouts,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            client_id: None,
            environment: None,
            realtime_host: None,
            fallback_hosts: None,
            port: 80,
            tls_port: 443,
            tls: true,
            transports: vec![TransportKind::WebSocket, TransportKind::Comet],
            format: Format::Json,
            echo_messages: true,
            queue_messages: true,
            auto_connect: true,
            recover: None,
            transport_params: BTreeMap::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connectivity_check_url: CONNECTIVITY_CHECK_URL.to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ClientOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Reads `REALTIME_*` variables. Unparseable values keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let options = Self::read_env()?;
        options.validate()?;
        Ok(options)
    }

    /// [`ClientOptions::from_env`] without validation, for callers that
    /// layer more settings on top before building a client.
    pub fn read_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let transports = match std::env::var("REALTIME_TRANSPORTS") {
            Ok(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(TransportKind::from_str)
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => defaults.transports.clone(),
        };
        let options = Self {
            key: std::env::var("REALTIME_KEY").ok(),
            token: std::env::var("REALTIME_TOKEN").ok(),
            client_id: std::env::var("REALTIME_CLIENT_ID").ok(),
            environment: std::env::var("REALTIME_ENVIRONMENT").ok(),
            realtime_host: std::env::var("REALTIME_HOST").ok(),
            port: std::env::var("REALTIME_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            tls_port: std::env::var("REALTIME_TLS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.tls_port),
            tls: env_flag("REALTIME_TLS").unwrap_or(defaults.tls),
            echo_messages: env_flag("REALTIME_ECHO").unwrap_or(defaults.echo_messages),
            recover: std::env::var("REALTIME_RECOVER").ok(),
            transports,
            timeouts: Timeouts::from_env(),
            ..defaults
        };
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(key) = &self.key {
            if key.split_once(':').is_none() {
                return Err(ConfigError::InvalidKey(key.clone()));
            }
        } else if self.token.is_none() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.transports.is_empty() {
            return Err(ConfigError::NoTransports);
        }
        Ok(())
    }

    pub fn primary_host(&self) -> String {
        if let Some(host) = &self.realtime_host {
            return host.clone();
        }
        match self.environment.as_deref() {
            Some(env) if env != "production" => format!("{env}-{DEFAULT_HOST}"),
            _ => DEFAULT_HOST.to_string(),
        }
    }

    /// Explicit fallbacks win; a custom host without them gets none.
    pub fn fallback_hosts(&self) -> Vec<String> {
        if let Some(hosts) = &self.fallback_hosts {
            return hosts.clone();
        }
        if self.realtime_host.is_some() {
            return Vec::new();
        }
        match self.environment.as_deref() {
            Some(env) if env != "production" => FALLBACK_SUFFIXES
                .iter()
                .map(|c| format!("{env}-{c}-fallback.ably-realtime.com"))
                .collect(),
            _ => FALLBACK_SUFFIXES
                .iter()
                .map(|c| format!("{c}.ably-realtime.com"))
                .collect(),
        }
    }

    pub fn effective_port(&self) -> u16 {
        if self.tls { self.tls_port } else { self.port }
    }

    /// The transport tried first when nothing better is known.
    pub fn base_transport(&self) -> Option<TransportKind> {
        TransportKind::BASE_ORDER
            .into_iter()
            .find(|kind| self.transports.contains(kind))
    }

    pub fn upgrade_transports(&self) -> Vec<TransportKind> {
        TransportKind::UPGRADE_ORDER
            .into_iter()
            .filter(|kind| self.transports.contains(kind))
            .collect()
    }
}
