//! Client library for a realtime pub/sub service.
//!
//! A [`Realtime`] client keeps one connection to the service alive across
//! network changes, multiplexes named [`Channel`]s over it and tracks who is
//! present on each channel.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use realtime_client::{ClientOptions, Realtime};
//!
//! let client = Realtime::new(ClientOptions::with_key("app.key:secret"))?;
//! let channel = client.channels().get("updates");
//! let mut messages = channel.subscribe().await?;
//! channel.publish("greeting", "hello").await?;
//! while let Ok(message) = messages.recv().await {
//!     println!("{:?}: {}", message.name, message.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod session;
pub mod transport;

pub use auth::{AuthProvider, StaticToken, TokenDetails, TokenParams};
pub use channel::{
    Channel, ChannelEvent, ChannelOptions, ChannelState, ChannelStateChange, Channels,
    DeltaDecoder,
};
pub use client::{ConnectivityCheck, HttpConnectivityCheck, Realtime, RealtimeBuilder};
pub use config::{ClientOptions, ConfigError, Timeouts, TransportKind};
pub use connection::{Connection, ConnectionEvent, ConnectionState, ConnectionStateChange};
pub use error::{ErrorInfo, RealtimeError};
pub use presence::{Presence, PresenceQuery};
pub use protocol::{ChannelModes, Message, PresenceAction, PresenceMessage};
