//! HTTP long-poll / streaming transport.
//!
//! One logical connection multiplexes a long-lived receive request, at most
//! one outstanding send request, and fire-and-forget close/disconnect
//! beacons.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    Transport, TransportCore, TransportEvent, TransportFactory, TransportId, TransportParams,
    TransportSink,
};
use crate::config::TransportKind;
use crate::error::{ErrorInfo, codes, is_token_error};
use crate::protocol::{Action, ProtocolMessage};

const UNRESOLVABLE_ERROR_CODES: [u32; 3] = [80015, 80017, 80030];

/// Splits a streamed NDJSON body into complete records.
#[derive(Debug, Default)]
pub struct NdjsonSplitter {
    buffer: Vec<u8>,
}

impl NdjsonSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every complete, non-empty line; the tail stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let Some(last_newline) = self.buffer.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        complete
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(<[u8]>::to_vec)
            .collect()
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

#[derive(Clone, Default)]
pub struct CometFactory {
    client: Client,
}

impl CometFactory {
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl TransportFactory for CometFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Comet
    }

    fn create(
        &self,
        id: TransportId,
        params: TransportParams,
        sink: TransportSink,
        cancel: CancellationToken,
    ) -> Arc<dyn Transport> {
        let scheme = if params.tls { "https" } else { "http" };
        let base_uri = format!("{scheme}://{}:{}/comet/", params.host, params.port);
        let stream = params.stream.unwrap_or(true);
        let auth_params = params.auth_params.clone();
        Arc::new(CometTransport {
            shared: Arc::new(Shared {
                client: self.client.clone(),
                base_uri,
                stream,
                auth_params: Mutex::new(auth_params),
                preconnected: AtomicBool::new(false),
            }),
            core: TransportCore::new(id, TransportKind::Comet, params, sink, cancel),
        })
    }
}

struct Shared {
    client: Client,
    base_uri: String,
    stream: bool,
    auth_params: Mutex<Vec<(String, String)>>,
    preconnected: AtomicBool,
}

impl Shared {
    fn connection_uri(&self, core: &TransportCore, suffix: &str) -> Option<String> {
        core.connection_key()
            .map(|key| format!("{}{key}/{suffix}", self.base_uri))
    }
}

pub struct CometTransport {
    core: Arc<TransportCore>,
    shared: Arc<Shared>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorInfo,
}

/// Coded errors from realtime become protocol envelopes; network errors disconnect.
fn on_raw_error(core: &Arc<TransportCore>, err: ErrorInfo) {
    let Some(code) = err.code else {
        core.disconnect(Some(err));
        return;
    };
    let action = if !is_token_error(&err)
        && (UNRESOLVABLE_ERROR_CODES.contains(&code) || (40000..50000).contains(&code))
    {
        Action::Error
    } else {
        Action::Disconnected
    };
    let mut message = ProtocolMessage::new(action);
    message.error = Some(err);
    core.on_protocol_message(message);
}

fn on_data(core: &Arc<TransportCore>, bytes: &[u8]) {
    trace!(target: "realtime::transport", transport = %core.id(), len = bytes.len(), "comet data");
    match core.params().codec.decode_batch(bytes) {
        Ok(messages) => {
            for message in messages {
                core.on_protocol_message(message);
            }
        }
        Err(err) => {
            warn!(target: "realtime::transport", transport = %core.id(), error = %err, "undecodable comet body");
        }
    }
}

fn request_error(err: reqwest::Error) -> ErrorInfo {
    if err.is_timeout() {
        ErrorInfo::network(format!("Request timed out: {err}"))
    } else {
        ErrorInfo::network(err.to_string())
    }
}

async fn http_error(status: StatusCode, response: reqwest::Response) -> ErrorInfo {
    let body = response.bytes().await.unwrap_or_default();
    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(&body) {
        return parsed.error;
    }
    if let Ok(parsed) = serde_json::from_slice::<ErrorInfo>(&body) {
        if parsed.code.is_some() {
            return parsed;
        }
    }
    let status = status.as_u16();
    ErrorInfo::new(
        format!("Error response received from server: {status}"),
        u32::from(status) * 100,
        status,
    )
}

/// Runs one request, feeding received protocol messages into the core.
async fn exec(
    core: &Arc<TransportCore>,
    shared: &Shared,
    method: Method,
    url: &str,
    query: &[(String, String)],
    body: Option<Vec<u8>>,
    timeout: Duration,
    streaming: bool,
) -> Result<(), ErrorInfo> {
    let mut request = shared
        .client
        .request(method, url)
        .query(query)
        .timeout(timeout);
    if let Some(body) = body {
        request = request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
    }
    let mut response = request.send().await.map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(http_error(status, response).await);
    }
    if streaming {
        let mut splitter = NdjsonSplitter::new();
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            if !shared.preconnected.swap(true, Ordering::SeqCst) {
                core.emit(TransportEvent::Preconnect);
            }
            for record in splitter.push(&chunk) {
                on_data(core, &record);
            }
        }
        if !splitter.pending().is_empty() {
            let tail = splitter.pending().to_vec();
            on_data(core, &tail);
        }
    } else {
        let body = response.bytes().await.map_err(request_error)?;
        if !body.is_empty() {
            if !shared.preconnected.swap(true, Ordering::SeqCst) {
                core.emit(TransportEvent::Preconnect);
            }
            on_data(core, &body);
        }
    }
    Ok(())
}

async fn run(core: Arc<TransportCore>, shared: Arc<Shared>) {
    let cancel = core.cancel_token().clone();
    let mut query = core.params().connect_params();
    if !query.iter().any(|(k, _)| k == "stream") {
        query.push(("stream".into(), shared.stream.to_string()));
    }
    let connect_uri = format!("{}connect", shared.base_uri);
    debug!(target: "realtime::transport", transport = %core.id(), uri = %connect_uri, "comet connecting");

    let recv_timeout = core.params().timeouts.recv;
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = exec(&core, &shared, Method::GET, &connect_uri, &query, None, recv_timeout, shared.stream) => result,
    };
    if result.is_ok() && !shared.preconnected.swap(true, Ordering::SeqCst) {
        core.emit(TransportEvent::Preconnect);
    }
    core.on_activity();
    if let Err(err) = result {
        return on_raw_error(&core, err);
    }

    loop {
        if cancel.is_cancelled() || !core.is_connected() {
            return;
        }
        let Some(recv_uri) = shared.connection_uri(&core, "recv") else {
            return;
        };
        let auth = shared.auth_params.lock().clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = exec(&core, &shared, Method::GET, &recv_uri, &auth, None, recv_timeout, shared.stream) => result,
        };
        // Realtime heartbeats relative to request start, so completion counts as activity.
        core.on_activity();
        if let Err(err) = result {
            return on_raw_error(&core, err);
        }
    }
}

/// Posts queued sends one request at a time; CLOSE and DISCONNECT become beacons.
async fn send_loop(
    core: Arc<TransportCore>,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<ProtocolMessage>,
) {
    let timeout = core.params().timeouts.http_request;
    while let Some(first) = outbound.recv().await {
        let mut items = vec![first];
        while let Ok(next) = outbound.try_recv() {
            items.push(next);
        }
        let mut batch = Vec::new();
        for item in items {
            match item.action {
                Action::Close | Action::Disconnect => {
                    flush(&core, &shared, std::mem::take(&mut batch), timeout).await;
                    beacon(&core, &shared, item.action == Action::Close, timeout);
                }
                _ => batch.push(item),
            }
        }
        flush(&core, &shared, batch, timeout).await;
    }
}

async fn flush(
    core: &Arc<TransportCore>,
    shared: &Shared,
    batch: Vec<ProtocolMessage>,
    timeout: Duration,
) {
    if batch.is_empty() {
        return;
    }
    let Some(send_uri) = shared.connection_uri(core, "send") else {
        warn!(target: "realtime::transport", transport = %core.id(), count = batch.len(), "send before connection established; dropping");
        return;
    };
    let body = match core.params().codec.encode_batch(&batch) {
        Ok(body) => body,
        Err(err) => {
            warn!(target: "realtime::transport", error = %err, "dropping unencodable batch");
            return;
        }
    };
    let auth = shared.auth_params.lock().clone();
    let result = exec(core, shared, Method::POST, &send_uri, &auth, Some(body), timeout, false).await;
    core.on_activity();
    if let Err(err) = result {
        warn!(target: "realtime::transport", transport = %core.id(), error = %err, "comet send failed");
        on_raw_error(core, err);
    }
}

fn beacon(core: &Arc<TransportCore>, shared: &Shared, closing: bool, timeout: Duration) {
    let Some(uri) = shared.connection_uri(core, if closing { "close" } else { "disconnect" }) else {
        return;
    };
    let request = shared
        .client
        .post(uri)
        .query(&*shared.auth_params.lock())
        .timeout(timeout);
    let core = Arc::clone(core);
    tokio::spawn(async move {
        match request.send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                let err = http_error(response.status(), response).await;
                core.finish(TransportEvent::Disconnected(err));
            }
            Err(err) => core.finish(TransportEvent::Disconnected(request_error(err))),
        }
    });
}

impl Transport for CometTransport {
    fn id(&self) -> TransportId {
        self.core.id()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Comet
    }

    fn params(&self) -> &TransportParams {
        self.core.params()
    }

    fn connect(&self) {
        let outbound = self.core.open_outbound();
        tokio::spawn(send_loop(
            Arc::clone(&self.core),
            Arc::clone(&self.shared),
            outbound,
        ));
        tokio::spawn(run(Arc::clone(&self.core), Arc::clone(&self.shared)));
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
        if !self.core.is_finished() {
            self.core.disconnect(Some(ErrorInfo::disconnected()));
        }
        self.core.dispose();
    }

    fn on_auth_updated(&self, token: &str) {
        *self.shared.auth_params.lock() = vec![("access_token".into(), token.to_string())];
    }
}

impl Drop for CometTransport {
    fn drop(&mut self) {
        self.core.dispose();
    }
}
