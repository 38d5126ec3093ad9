use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::{
    Transport, TransportCore, TransportEvent, TransportFactory, TransportId, TransportParams,
    TransportSink,
};
use crate::config::TransportKind;
use crate::error::{ErrorInfo, codes};
use crate::protocol::ProtocolMessage;
use crate::protocol::codec::Frame;

const NORMAL_CLOSURE: u16 = 1000;

pub struct WebSocketFactory;

impl TransportFactory for WebSocketFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn create(
        &self,
        id: TransportId,
        params: TransportParams,
        sink: TransportSink,
        cancel: CancellationToken,
    ) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport {
            core: TransportCore::new(id, TransportKind::WebSocket, params, sink, cancel),
        })
    }
}

/// Protocol envelopes over one WebSocket.
pub struct WebSocketTransport {
    core: Arc<TransportCore>,
}

pub(crate) fn ws_url(params: &TransportParams) -> Result<Url, ErrorInfo> {
    let scheme = if params.tls { "wss" } else { "ws" };
    let mut url = Url::parse(&format!("{scheme}://{}:{}/", params.host, params.port))
        .map_err(|err| ErrorInfo::new(format!("Invalid host: {err}"), codes::BAD_REQUEST, 400))?;
    url.query_pairs_mut().extend_pairs(params.connect_params());
    Ok(url)
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorInfo,
}

/// Handshake rejections carry an error object in their body.
fn handshake_error(err: tungstenite::Error) -> ErrorInfo {
    if let tungstenite::Error::Http(response) = &err {
        let status = response.status().as_u16();
        if let Some(body) = response.body() {
            if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
                return parsed.error;
            }
        }
        return ErrorInfo::new(
            format!("WebSocket handshake rejected with HTTP {status}"),
            codes::DISCONNECTED,
            status,
        );
    }
    ErrorInfo::network(err.to_string())
}

async fn run(core: Arc<TransportCore>) {
    let url = match ws_url(core.params()) {
        Ok(url) => url,
        Err(err) => return core.disconnect(Some(err)),
    };
    debug!(target: "realtime::transport", transport = %core.id(), host = %core.params().host, "websocket connecting");
    let cancel = core.cancel_token().clone();
    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect_async(url.as_str()) => match result {
            Ok((stream, _response)) => stream,
            Err(err) => {
                let err = handshake_error(err);
                warn!(target: "realtime::transport", transport = %core.id(), error = %err, "websocket connect failed");
                return core.disconnect(Some(err));
            }
        },
    };
    if core.is_disposed() {
        return;
    }
    core.emit(TransportEvent::Preconnect);

    let (mut ws_sender, mut ws_receiver) = stream.split();
    let mut outbound = core.open_outbound();
    let codec = Arc::clone(&core.params().codec);
    let writer_core = Arc::clone(&core);
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let frame = match codec.encode(&message) {
                Ok(Frame::Text(text)) => Message::Text(text),
                Ok(Frame::Binary(bytes)) => Message::Binary(bytes),
                Err(err) => {
                    warn!(target: "realtime::transport", error = %err, "dropping unencodable message");
                    continue;
                }
            };
            if let Err(err) = ws_sender.send(frame).await {
                writer_core.finish(TransportEvent::Disconnected(ErrorInfo::new(
                    format!("Exception from ws connection when trying to send: {err}"),
                    codes::INTERNAL,
                    500,
                )));
                return;
            }
        }
        // Outbound closed by dispose; queued frames have been flushed.
        let _ = ws_sender.close().await;
    });

    let mut close_code = None;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = ws_receiver.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => on_data(&core, text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => on_data(&core, &bytes),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => core.on_activity(),
            Some(Ok(Message::Close(frame))) => {
                close_code = Some(frame.map_or(NORMAL_CLOSURE, |f| u16::from(f.code)));
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(err)) => {
                debug!(target: "realtime::transport", transport = %core.id(), error = %err, "websocket error");
                core.disconnect(Some(ErrorInfo::new(
                    err.to_string(),
                    codes::DISCONNECTED,
                    400,
                )));
                break;
            }
            None => {
                let err = match close_code {
                    Some(NORMAL_CLOSURE) => {
                        ErrorInfo::new("Websocket closed", codes::DISCONNECTED, 400)
                    }
                    code => ErrorInfo::new(
                        format!(
                            "Unclean disconnection of WebSocket ; code = {}",
                            code.map_or_else(|| "none".to_string(), |c| c.to_string())
                        ),
                        codes::DISCONNECTED,
                        400,
                    ),
                };
                core.disconnect(Some(err));
                break;
            }
        }
    }
    // Make sure the writer sees a closed queue even when the reader ended first.
    core.dispose();
    let _ = writer.await;
}

fn on_data(core: &Arc<TransportCore>, bytes: &[u8]) {
    trace!(target: "realtime::transport", transport = %core.id(), len = bytes.len(), "data received");
    match core.params().codec.decode(bytes) {
        Ok(message) => core.on_protocol_message(message),
        Err(err) => {
            warn!(target: "realtime::transport", transport = %core.id(), error = %err, "undecodable frame");
            core.fail(ErrorInfo::new(
                "Invalid protocol message",
                codes::BAD_REQUEST,
                400,
            ));
        }
    }
}

impl Transport for WebSocketTransport {
    fn id(&self) -> TransportId {
        self.core.id()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn params(&self) -> &TransportParams {
        self.core.params()
    }

    fn connect(&self) {
        tokio::spawn(run(Arc::clone(&self.core)));
    }

    fn send(&self, message: ProtocolMessage) -> Result<(), ErrorInfo> {
        self.core.send(message)
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn disconnect(&self, error: Option<ErrorInfo>) {
        self.core.disconnect(error);
    }

    fn fail(&self, error: ErrorInfo) {
        self.core.fail(error);
    }

    fn close(&self) {
        self.core.close();
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::protocol::codec::JsonCodec;
    use crate::transport::ConnectMode;
    use std::collections::BTreeMap;

    #[test]
    fn url_carries_connect_params() {
        let params = TransportParams {
            host: "realtime.example".into(),
            port: 443,
            tls: true,
            mode: ConnectMode::Clean,
            connection_key: None,
            connection_serial: None,
            client_id: None,
            echo_messages: true,
            heartbeats: Some(true),
            stream: None,
            auth_params: vec![("access_token".into(), "tok en".into())],
            transport_params: BTreeMap::new(),
            timeouts: Timeouts::default(),
            codec: Arc::new(JsonCodec),
        };
        let url = ws_url(&params).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("realtime.example"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("access_token".into(), "tok en".into())));
        assert!(pairs.contains(&("format".into(), "json".into())));
        assert!(pairs.contains(&("heartbeats".into(), "true".into())));
    }
}
