//! Payload decoding for inbound messages.
//!
//! `encoding` lists the transforms applied by the publisher, outermost last
//! (`json/utf-8/vcdiff/base64`), so they are undone right to left. Whatever
//! cannot be undone stays in `encoding`.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde_json::Value;

use crate::error::{ErrorInfo, codes};

/// Applies a vcdiff delta to the previous payload.
pub trait DeltaDecoder: Send + Sync {
    fn apply(&self, delta: &[u8], base: &[u8]) -> Result<Vec<u8>, String>;
}

const GENERIC_DECODE_FAILURE: u32 = 40013;

enum Payload {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Payload::Text(text),
            other => Payload::Json(other),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.into_bytes(),
            Payload::Json(value) => value.to_string().into_bytes(),
        }
    }

    fn as_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Text(text) => text.as_bytes().to_vec(),
            Payload::Json(value) => value.to_string().into_bytes(),
        }
    }
}

/// Per-channel decoding state: the delta plugin and the last full payload.
#[derive(Default)]
pub(crate) struct DecodingContext {
    delta_decoder: Option<Arc<dyn DeltaDecoder>>,
    base_payload: Option<Vec<u8>>,
}

impl DecodingContext {
    pub fn new(delta_decoder: Option<Arc<dyn DeltaDecoder>>) -> Self {
        Self {
            delta_decoder,
            base_payload: None,
        }
    }
}

/// Decodes `data` in place and updates `encoding` to what is left.
///
/// On failure `data`/`encoding` still reflect the steps that succeeded.
/// With a context, a successful decode becomes the base for the next delta.
pub(crate) fn decode(
    data: &mut Value,
    encoding: &mut Option<String>,
    mut context: Option<&mut DecodingContext>,
) -> Result<(), ErrorInfo> {
    let Some(raw) = encoding.take().filter(|e| !e.is_empty()) else {
        return Ok(());
    };
    let transforms: Vec<&str> = raw.split('/').collect();
    let mut payload = Payload::from_value(std::mem::take(data));
    let mut last_payload: Option<Vec<u8>> = None;
    let mut remaining = transforms.len();
    let mut failure = None;

    while remaining > 0 {
        let step = transforms[remaining - 1];
        let name = step.split('+').next().unwrap_or_default();
        let outermost = remaining == transforms.len();
        match apply(name, payload, context.as_deref_mut()) {
            Ok(next) => {
                payload = next;
                if (name == "base64" && outermost) || name == "vcdiff" {
                    last_payload = Some(payload.as_bytes());
                }
                remaining -= 1;
            }
            Err((unchanged, err)) => {
                payload = unchanged;
                failure = Some(ErrorInfo::new(
                    format!(
                        "Error processing the {name} encoding, decoder returned '{}'",
                        err.message
                    ),
                    err.code.unwrap_or(GENERIC_DECODE_FAILURE),
                    400,
                ));
                break;
            }
        }
    }

    let leftover = transforms[..remaining].join("/");
    let (value, leftover) = match payload {
        Payload::Json(value) => (value, leftover),
        Payload::Text(text) => (Value::String(text), leftover),
        // Binary can't live in a JSON value; keep it base64 encoded.
        Payload::Bytes(bytes) => {
            let leftover = if leftover.is_empty() {
                "base64".to_string()
            } else {
                format!("{leftover}/base64")
            };
            (Value::String(BASE64_STANDARD.encode(bytes)), leftover)
        }
    };
    *data = value;
    *encoding = (!leftover.is_empty()).then_some(leftover);

    if let Some(err) = failure {
        return Err(err);
    }
    if let Some(context) = context {
        context.base_payload = Some(match last_payload {
            Some(bytes) => bytes,
            None => Payload::from_value(data.clone()).into_bytes(),
        });
    }
    Ok(())
}

fn apply(
    name: &str,
    payload: Payload,
    context: Option<&mut DecodingContext>,
) -> Result<Payload, (Payload, ErrorInfo)> {
    let fail = |payload, message: String, code| Err((payload, ErrorInfo::new(message, code, 400)));
    match name {
        "base64" => {
            let Payload::Text(text) = &payload else {
                return fail(payload, "base64 data is not a string".into(), GENERIC_DECODE_FAILURE);
            };
            match BASE64_STANDARD.decode(text.as_bytes()) {
                Ok(bytes) => Ok(Payload::Bytes(bytes)),
                Err(err) => fail(payload, err.to_string(), GENERIC_DECODE_FAILURE),
            }
        }
        "utf-8" => match payload {
            Payload::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Ok(Payload::Text(text)),
                Err(err) => {
                    let message = err.to_string();
                    fail(Payload::Bytes(err.into_bytes()), message, GENERIC_DECODE_FAILURE)
                }
            },
            other => Ok(other),
        },
        "json" => {
            let parsed = match &payload {
                Payload::Text(text) => serde_json::from_str(text),
                Payload::Bytes(bytes) => serde_json::from_slice(bytes),
                Payload::Json(_) => return Ok(payload),
            };
            match parsed {
                Ok(value) => Ok(Payload::Json(value)),
                Err(err) => fail(payload, err.to_string(), GENERIC_DECODE_FAILURE),
            }
        }
        "vcdiff" => {
            let Some(context) = context else {
                return fail(payload, "delta payloads are only valid on messages".into(), GENERIC_DECODE_FAILURE);
            };
            let Some(decoder) = context.delta_decoder.clone() else {
                return fail(payload, "Missing Vcdiff decoder".into(), codes::DELTA_DECODER_MISSING);
            };
            let base = context.base_payload.clone().unwrap_or_default();
            let delta = payload.as_bytes();
            match decoder.apply(&delta, &base) {
                Ok(bytes) => Ok(Payload::Bytes(bytes)),
                Err(err) => fail(
                    payload,
                    format!("Vcdiff delta decode failed with {err}"),
                    codes::DELTA_DECODE_FAILED,
                ),
            }
        }
        "cipher" => fail(
            payload,
            "Unable to decrypt message; not an encrypted channel".into(),
            GENERIC_DECODE_FAILURE,
        ),
        other => fail(payload, format!("Unknown encoding {other}"), GENERIC_DECODE_FAILURE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// "Delta" that appends itself to the base.
    struct Append;

    impl DeltaDecoder for Append {
        fn apply(&self, delta: &[u8], base: &[u8]) -> Result<Vec<u8>, String> {
            let mut out = base.to_vec();
            out.extend_from_slice(delta);
            Ok(out)
        }
    }

    struct Broken;

    impl DeltaDecoder for Broken {
        fn apply(&self, _: &[u8], _: &[u8]) -> Result<Vec<u8>, String> {
            Err("bad window".into())
        }
    }

    #[test]
    fn json_utf8_base64_stack_unwinds() {
        let mut data = json!(BASE64_STANDARD.encode(r#"{"n":1}"#));
        let mut encoding = Some("json/utf-8/base64".to_string());
        decode(&mut data, &mut encoding, None).unwrap();
        assert_eq!(data, json!({"n": 1}));
        assert_eq!(encoding, None);
    }

    #[test]
    fn binary_payload_stays_base64() {
        let raw = [0xff_u8, 0x00, 0x10];
        let mut data = json!(BASE64_STANDARD.encode(raw));
        let mut encoding = Some("base64".to_string());
        decode(&mut data, &mut encoding, None).unwrap();
        assert_eq!(data, json!(BASE64_STANDARD.encode(raw)));
        assert_eq!(encoding.as_deref(), Some("base64"));
    }

    #[test]
    fn failure_keeps_partial_progress() {
        let mut data = json!("not json");
        let mut encoding = Some("json".to_string());
        let err = decode(&mut data, &mut encoding, None).unwrap_err();
        assert_eq!(err.code, Some(GENERIC_DECODE_FAILURE));
        assert_eq!(data, json!("not json"));
        assert_eq!(encoding.as_deref(), Some("json"));

        let mut data = json!("abc");
        let mut encoding = Some("rot13/utf-8".to_string());
        let err = decode(&mut data, &mut encoding, None).unwrap_err();
        assert!(err.message.contains("rot13"));
        assert_eq!(encoding.as_deref(), Some("rot13"));
    }

    #[test]
    fn delta_applies_to_previous_payload() {
        let mut context = DecodingContext::new(Some(Arc::new(Append)));
        let mut data = json!("hello");
        let mut encoding = None;
        decode(&mut data, &mut encoding, Some(&mut context)).unwrap();
        // No encoding: nothing recorded yet.
        assert!(context.base_payload.is_none());

        let mut data = json!("hello");
        let mut encoding = Some("utf-8".to_string());
        decode(&mut data, &mut encoding, Some(&mut context)).unwrap();
        assert_eq!(context.base_payload.as_deref(), Some(&b"hello"[..]));

        let mut data = json!(BASE64_STANDARD.encode(" world"));
        let mut encoding = Some("utf-8/vcdiff/base64".to_string());
        decode(&mut data, &mut encoding, Some(&mut context)).unwrap();
        assert_eq!(data, json!("hello world"));
        assert_eq!(context.base_payload.as_deref(), Some(&b"hello world"[..]));
    }

    #[test]
    fn delta_errors_carry_their_codes() {
        let mut context = DecodingContext::new(None);
        let mut data = json!(BASE64_STANDARD.encode("x"));
        let mut encoding = Some("vcdiff/base64".to_string());
        let err = decode(&mut data, &mut encoding, Some(&mut context)).unwrap_err();
        assert_eq!(err.code, Some(codes::DELTA_DECODER_MISSING));

        let mut context = DecodingContext::new(Some(Arc::new(Broken)));
        let mut data = json!(BASE64_STANDARD.encode("x"));
        let mut encoding = Some("vcdiff/base64".to_string());
        let err = decode(&mut data, &mut encoding, Some(&mut context)).unwrap_err();
        assert_eq!(err.code, Some(codes::DELTA_DECODE_FAILED));
    }
}
