use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use realtime_client::{
    ChannelEvent, ClientOptions, ConnectionEvent, ConnectionState, PresenceQuery, Realtime,
    TransportKind,
};
use serde_json::Value;
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "beach-realtime")]
#[command(about = "Connect to the realtime service, publish, and watch channels")]
pub struct Cli {
    /// API key (`app.key:secret`)
    #[arg(long, env = "REALTIME_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Bearer token, used when no key is given
    #[arg(long, env = "REALTIME_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[arg(long, env = "REALTIME_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Realtime host, overriding the environment's default
    #[arg(long, env = "REALTIME_HOST")]
    pub host: Option<String>,

    /// Allowed transports, in any order (web_socket, comet)
    #[arg(long, value_delimiter = ',')]
    pub transports: Vec<TransportKind>,

    /// Tracing filter when RUST_LOG is unset
    #[arg(long, default_value = "warn,realtime=info")]
    pub log_filter: String,

    /// Seconds to wait for the connection before giving up
    #[arg(long, default_value_t = 15)]
    pub connect_timeout: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Attach and print messages, presence and state changes until Ctrl-C
    Listen {
        channel: String,

        /// Also enter presence with this data
        #[arg(long)]
        enter: Option<String>,
    },

    /// Publish one message and wait for the acknowledgement
    Publish {
        channel: String,
        name: String,

        /// JSON, or taken as a plain string when it doesn't parse
        data: String,
    },

    /// List the members present on a channel
    Presence { channel: String },

    /// Measure a heartbeat round trip
    Ping,
}

impl Cli {
    /// Environment settings with the flags layered on top.
    pub fn client_options(&self) -> Result<ClientOptions> {
        let mut options = ClientOptions::read_env().context("reading REALTIME_* settings")?;
        if let Some(key) = &self.key {
            options.key = Some(key.clone());
        }
        if let Some(token) = &self.token {
            options.token = Some(token.clone());
        }
        if let Some(client_id) = &self.client_id {
            options.client_id = Some(client_id.clone());
        }
        if let Some(host) = &self.host {
            options.realtime_host = Some(host.clone());
        }
        if !self.transports.is_empty() {
            options.transports = self.transports.clone();
        }
        options.validate().context("invalid client options")?;
        Ok(options)
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let options = cli.client_options()?;
    let client = Realtime::new(options)?;
    spawn_state_printer(&client);

    let connected = timeout(
        Duration::from_secs(cli.connect_timeout),
        client.connection().wait_for(ConnectionState::Connected),
    )
    .await;
    match connected {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => {
            let reason = client
                .connection()
                .error_reason()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error reported".into());
            bail!("not connected after {}s: {reason}", cli.connect_timeout);
        }
    }
    debug!(id = ?client.connection().id(), "connected");

    let outcome = match cli.command {
        Commands::Listen { channel, enter } => listen(&client, &channel, enter).await,
        Commands::Publish {
            channel,
            name,
            data,
        } => publish(&client, &channel, &name, &data).await,
        Commands::Presence { channel } => presence(&client, &channel).await,
        Commands::Ping => ping(&client).await,
    };

    client.close();
    if timeout(
        Duration::from_secs(5),
        client.connection().wait_for(ConnectionState::Closed),
    )
    .await
    .is_err()
    {
        warn!("connection did not close cleanly");
    }
    outcome
}

fn spawn_state_printer(client: &Realtime) {
    let mut events = client.connection().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let change = event.change();
            match (&event, &change.reason) {
                (ConnectionEvent::StateChanged(_), Some(reason)) => {
                    eprintln!("connection: {} -> {} ({reason})", change.previous, change.current)
                }
                (ConnectionEvent::StateChanged(_), None) => {
                    eprintln!("connection: {} -> {}", change.previous, change.current)
                }
                (ConnectionEvent::Update(_), reason) => {
                    eprintln!("connection: update {reason:?}")
                }
            }
        }
    });
}

fn parse_data(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn listen(client: &Realtime, channel_name: &str, enter: Option<String>) -> Result<()> {
    let channel = client.channels().get(channel_name);
    let mut channel_events = channel.events();
    let mut messages = channel.subscribe().await?;
    let presence = channel.presence();
    let mut members = presence.subscribe().await?;
    if let Some(data) = enter {
        presence.enter(parse_data(&data)).await?;
    }
    eprintln!("listening on {channel_name}; Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = messages.recv() => match message {
                Ok(message) => println!(
                    "{} {}: {}",
                    message.client_id.as_deref().unwrap_or("-"),
                    message.name.as_deref().unwrap_or(""),
                    message.data
                ),
                Err(err) => {
                    warn!(error = %err, "message stream interrupted");
                    if matches!(err, tokio::sync::broadcast::error::RecvError::Closed) {
                        break;
                    }
                }
            },
            member = members.recv() => if let Ok(member) = member {
                println!(
                    "presence {} {} {}",
                    member.action,
                    member.client_id.as_deref().unwrap_or("-"),
                    member.data
                );
            },
            event = channel_events.recv() => if let Ok(event) = event {
                let change = event.change();
                match &event {
                    ChannelEvent::StateChanged(_) => eprintln!("channel: {} -> {}", change.previous, change.current),
                    ChannelEvent::Update(_) => eprintln!("channel: update {:?}", change.reason),
                }
            },
        }
    }
    Ok(())
}

async fn publish(client: &Realtime, channel: &str, name: &str, data: &str) -> Result<()> {
    client
        .channels()
        .get(channel)
        .publish(name, parse_data(data))
        .await?;
    println!("published {name} to {channel}");
    Ok(())
}

async fn presence(client: &Realtime, channel: &str) -> Result<()> {
    let members = client
        .channels()
        .get(channel)
        .presence()
        .get(PresenceQuery::default())
        .await?;
    if members.is_empty() {
        println!("nobody is present on {channel}");
    }
    for member in members {
        println!(
            "{} ({}) {}",
            member.client_id.as_deref().unwrap_or("-"),
            member.connection_id.as_deref().unwrap_or("-"),
            member.data
        );
    }
    Ok(())
}

async fn ping(client: &Realtime) -> Result<()> {
    let rtt = client.connection().ping().await?;
    println!("round trip {} ms", rtt.as_millis());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_falls_back_to_a_string() {
        assert_eq!(parse_data(r#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(parse_data("42"), serde_json::json!(42));
        assert_eq!(parse_data("hello there"), Value::String("hello there".into()));
    }

    #[test]
    fn flags_override_the_environment() {
        let cli = Cli::parse_from([
            "beach-realtime",
            "--key",
            "app.key:secret",
            "--transports",
            "comet",
            "--host",
            "realtime.test",
            "ping",
        ]);
        let options = cli.client_options().expect("valid");
        assert_eq!(options.key.as_deref(), Some("app.key:secret"));
        assert_eq!(options.transports, vec![TransportKind::Comet]);
        assert_eq!(options.realtime_host.as_deref(), Some("realtime.test"));
    }
}
