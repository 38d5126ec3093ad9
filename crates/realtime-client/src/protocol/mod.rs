//! Protocol envelope types exchanged with the service.

pub mod codec;
pub mod flags;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ErrorInfo;
pub use flags::{AttachFlags, ChannelModes, Flags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Action {
    Heartbeat,
    Ack,
    Nack,
    Connect,
    Connected,
    Disconnect,
    Disconnected,
    Close,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Presence,
    Message,
    Sync,
    Auth,
}

impl Action {
    const ALL: [Action; 18] = [
        Action::Heartbeat,
        Action::Ack,
        Action::Nack,
        Action::Connect,
        Action::Connected,
        Action::Disconnect,
        Action::Disconnected,
        Action::Close,
        Action::Closed,
        Action::Error,
        Action::Attach,
        Action::Attached,
        Action::Detach,
        Action::Detached,
        Action::Presence,
        Action::Message,
        Action::Sync,
        Action::Auth,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Action::Heartbeat => "HEARTBEAT",
            Action::Ack => "ACK",
            Action::Nack => "NACK",
            Action::Connect => "CONNECT",
            Action::Connected => "CONNECTED",
            Action::Disconnect => "DISCONNECT",
            Action::Disconnected => "DISCONNECTED",
            Action::Close => "CLOSE",
            Action::Closed => "CLOSED",
            Action::Error => "ERROR",
            Action::Attach => "ATTACH",
            Action::Attached => "ATTACHED",
            Action::Detach => "DETACH",
            Action::Detached => "DETACHED",
            Action::Presence => "PRESENCE",
            Action::Message => "MESSAGE",
            Action::Sync => "SYNC",
            Action::Auth => "AUTH",
        }
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        Action::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| format!("unrecognised protocol action {value}"))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Channel serials have been sent both as strings and as integers.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Connection serials are integers on the wire but older servers quote them.
fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inbound_rate: Option<u64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// One application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            data: data.into(),
            ..Self::default()
        }
    }

    /// Bytes counted against the connection's `maxMessageSize`.
    pub fn size(&self) -> usize {
        let mut size = 0;
        if let Some(name) = &self.name {
            size += name.len();
        }
        if let Some(client_id) = &self.client_id {
            size += client_id.len();
        }
        if let Some(extras) = &self.extras {
            size += extras.to_string().len();
        }
        size + data_size(&self.data)
    }

    /// `extras.delta.from`, present when the payload is a delta.
    pub fn delta_from(&self) -> Option<&str> {
        self.extras.as_ref()?.get("delta")?.get("from")?.as_str()
    }
}

pub(crate) fn data_size(data: &Value) -> usize {
    match data {
        Value::Null => 0,
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PresenceAction {
    Absent,
    Present,
    Enter,
    Leave,
    Update,
}

impl PresenceAction {
    pub fn name(self) -> &'static str {
        match self {
            PresenceAction::Absent => "absent",
            PresenceAction::Present => "present",
            PresenceAction::Enter => "enter",
            PresenceAction::Leave => "leave",
            PresenceAction::Update => "update",
        }
    }
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            other => Err(format!("unrecognised presence action {other}")),
        }
    }
}

impl fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Position of a presence message within its connection's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PresenceOrder {
    pub msg_serial: i64,
    pub index: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction, client_id: Option<String>, data: Value) -> Self {
        Self {
            action,
            id: None,
            client_id,
            connection_id: None,
            timestamp: None,
            data,
            encoding: None,
            extras: None,
        }
    }

    /// Map key identifying one member.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.client_id.as_deref().unwrap_or_default(),
            self.connection_id.as_deref().unwrap_or_default()
        )
    }

    /// Heuristic: a message whose id does not start with its connection id
    /// was made up by the server (e.g. a delayed leave) rather than sent by
    /// that connection, so its id carries no ordering.
    pub fn is_synthesized(&self) -> bool {
        match (&self.id, &self.connection_id) {
            (Some(id), Some(connection_id)) => !id.starts_with(connection_id.as_str()),
            _ => true,
        }
    }

    /// Parses `connectionId:msgSerial:index`.
    pub fn parse_id(&self) -> Option<PresenceOrder> {
        let id = self.id.as_deref()?;
        let mut parts = id.rsplitn(3, ':');
        let index = parts.next()?.parse().ok()?;
        let msg_serial = parts.next()?.parse().ok()?;
        parts.next()?;
        Some(PresenceOrder { msg_serial, index })
    }

    pub fn size(&self) -> usize {
        let mut size = self.client_id.as_ref().map_or(0, String::len);
        if let Some(extras) = &self.extras {
            size += extras.to_string().len();
        }
        size + data_size(&self.data)
    }
}

/// One envelope on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Flags::is_empty")]
    pub flags: Flags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_i64"
    )]
    pub connection_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_string"
    )]
    pub channel_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            flags: Flags::default(),
            id: None,
            timestamp: None,
            count: None,
            error: None,
            connection_id: None,
            connection_key: None,
            connection_serial: None,
            channel: None,
            channel_serial: None,
            msg_serial: None,
            messages: None,
            presence: None,
            connection_details: None,
            auth: None,
            params: None,
        }
    }

    pub fn for_channel(action: Action, channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::new(action)
        }
    }

    pub fn heartbeat(id: Option<String>) -> Self {
        Self {
            id,
            ..Self::new(Action::Heartbeat)
        }
    }

    pub fn messages(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            messages: Some(messages),
            ..Self::for_channel(Action::Message, channel)
        }
    }

    pub fn presence(channel: impl Into<String>, presence: Vec<PresenceMessage>) -> Self {
        Self {
            presence: Some(presence),
            ..Self::for_channel(Action::Presence, channel)
        }
    }

    /// Only MESSAGE and PRESENCE envelopes get a msgSerial and expect an ACK.
    pub fn ack_required(&self) -> bool {
        matches!(self.action, Action::Message | Action::Presence)
    }

    pub fn payload_size(&self) -> usize {
        let messages: usize = self.messages.iter().flatten().map(Message::size).sum();
        let presence: usize = self.presence.iter().flatten().map(PresenceMessage::size).sum();
        messages + presence
    }

    /// Number of messages or presence items carried.
    pub fn item_count(&self) -> usize {
        self.messages.as_ref().map_or(0, Vec::len) + self.presence.as_ref().map_or(0, Vec::len)
    }
}

impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ProtocolMessage; action={}", self.action)?;
        if let Some(channel) = &self.channel {
            write!(f, "; channel={channel}")?;
        }
        if let Some(serial) = self.msg_serial {
            write!(f, "; msgSerial={serial}")?;
        }
        if let Some(serial) = self.connection_serial {
            write!(f, "; connectionSerial={serial}")?;
        }
        if let Some(count) = self.count {
            write!(f, "; count={count}")?;
        }
        if !self.flags.is_empty() {
            write!(f, "; flags={:?}|{:?}", self.flags.attach, self.flags.modes)?;
        }
        if let Some(error) = &self.error {
            write!(f, "; error={error}")?;
        }
        let items = self.item_count();
        if items > 0 {
            write!(f, "; items={items}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_codes_are_stable() {
        assert_eq!(u8::from(Action::Heartbeat), 0);
        assert_eq!(u8::from(Action::Message), 15);
        assert_eq!(u8::from(Action::Auth), 17);
        assert_eq!(Action::try_from(16).unwrap(), Action::Sync);
        assert!(Action::try_from(42).is_err());
    }

    #[test]
    fn envelope_decodes_from_wire_json() {
        let raw = r#"{
            "action": 4,
            "connectionId": "abc",
            "connectionKey": "abc!key",
            "connectionSerial": "-1",
            "flags": 65541,
            "connectionDetails": {"maxIdleInterval": 15000, "connectionStateTtl": 120000}
        }"#;
        let msg: ProtocolMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.action, Action::Connected);
        assert_eq!(msg.connection_serial, Some(-1));
        assert!(msg.flags.attach.contains(AttachFlags::HAS_PRESENCE));
        assert!(msg.flags.attach.contains(AttachFlags::RESUMED));
        assert!(msg.flags.modes.contains(ChannelModes::PRESENCE));
        let details = msg.connection_details.unwrap();
        assert_eq!(details.max_idle_interval, Some(15_000));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = serde_json::from_str::<ProtocolMessage>(r#"{"action":99}"#);
        assert!(err.is_err());
    }

    #[test]
    fn presence_id_parsing_and_synthesis_heuristic() {
        let mut msg = PresenceMessage::new(PresenceAction::Enter, Some("alice".into()), Value::Null);
        msg.connection_id = Some("conn".into());
        msg.id = Some("conn:5:1".into());
        assert!(!msg.is_synthesized());
        assert_eq!(
            msg.parse_id(),
            Some(PresenceOrder {
                msg_serial: 5,
                index: 1
            })
        );
        msg.id = Some("other:5:1".into());
        assert!(msg.is_synthesized());
        assert_eq!(msg.member_key(), "alice:conn");
    }

    #[test]
    fn message_size_counts_name_client_and_data() {
        let mut msg = Message::new("evt", "hello");
        msg.client_id = Some("me".into());
        assert_eq!(msg.size(), 3 + 2 + 5);
        msg.data = serde_json::json!({"a": 1});
        assert_eq!(msg.size(), 3 + 2 + r#"{"a":1}"#.len());
    }

    #[test]
    fn empty_fields_are_not_serialized() {
        let msg = ProtocolMessage::heartbeat(None);
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"action":0}"#);
    }
}
