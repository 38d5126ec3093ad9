use std::fmt;

use crate::error::{ErrorInfo, codes};

use super::ProtocolMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Json,
    Binary,
}

impl Format {
    /// Value of the `format` connect parameter.
    pub fn param(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Binary => "msgpack",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.param())
    }
}

/// One encoded envelope ready for a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Serializes envelopes for a transport. JSON is built in; a binary codec
/// can be supplied through the client builder.
pub trait WireCodec: Send + Sync {
    fn format(&self) -> Format;

    fn encode(&self, message: &ProtocolMessage) -> Result<Frame, ErrorInfo>;

    fn decode(&self, bytes: &[u8]) -> Result<ProtocolMessage, ErrorInfo>;

    /// Comet bodies carry an array of envelopes.
    fn encode_batch(&self, messages: &[ProtocolMessage]) -> Result<Vec<u8>, ErrorInfo>;

    fn decode_batch(&self, bytes: &[u8]) -> Result<Vec<ProtocolMessage>, ErrorInfo>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

fn invalid(err: serde_json::Error) -> ErrorInfo {
    ErrorInfo::new(
        format!("Invalid protocol message: {err}"),
        codes::BAD_REQUEST,
        400,
    )
}

impl WireCodec for JsonCodec {
    fn format(&self) -> Format {
        Format::Json
    }

    fn encode(&self, message: &ProtocolMessage) -> Result<Frame, ErrorInfo> {
        serde_json::to_string(message)
            .map(Frame::Text)
            .map_err(invalid)
    }

    fn decode(&self, bytes: &[u8]) -> Result<ProtocolMessage, ErrorInfo> {
        serde_json::from_slice(bytes).map_err(invalid)
    }

    fn encode_batch(&self, messages: &[ProtocolMessage]) -> Result<Vec<u8>, ErrorInfo> {
        serde_json::to_vec(messages).map_err(invalid)
    }

    fn decode_batch(&self, bytes: &[u8]) -> Result<Vec<ProtocolMessage>, ErrorInfo> {
        serde_json::from_slice(bytes).map_err(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Action;

    #[test]
    fn json_batch_decodes_array() {
        let body = br#"[{"action":0},{"action":1,"msgSerial":3,"count":2}]"#;
        let decoded = JsonCodec.decode_batch(body).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].action, Action::Ack);
        assert_eq!(decoded[1].msg_serial, Some(3));
    }

    #[test]
    fn garbage_maps_to_bad_request() {
        let err = JsonCodec.decode(b"{nope").unwrap_err();
        assert_eq!(err.code, Some(codes::BAD_REQUEST));
        assert_eq!(err.status_code, Some(400));
    }
}
