//! WebSocket Transport
//!
//! Single responsibility: Move text frames over a WebSocket using tokio-tungstenite.
//! No knowledge of message kinds or session state.
//!
//! Each `connect()` spawns one connection task. The task owns both halves of
//! the socket, forwards outbound frames it receives over a channel, and reports
//! everything it observes through the transport's `EventSink`. Dropping the
//! transport drops the channel, which makes the task close the socket cleanly.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderName, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame, Message as WsMessage},
    },
};
use tracing::{debug, trace, warn};

use crate::error::{LinkError, Result};
use crate::transport::{
    EventSink, Transport, TransportFactory, TransportRequest, CLOSE_NO_STATUS,
};

/// Close code for connections that ended without a close handshake.
const CLOSE_ABNORMAL: u16 = 1006;

/// How long to wait for the server to answer our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

enum Outbound {
    Text(String),
    Close,
}

/// Builds `WsTransport`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransportFactory;

impl TransportFactory for WsTransportFactory {
    fn create(&self, request: TransportRequest, events: EventSink) -> Result<Box<dyn Transport>> {
        // Reject unusable URLs and headers now rather than on every connect
        build_request(&request)?;
        Ok(Box::new(WsTransport::new(request, events)))
    }
}

/// A WebSocket connection to the game server.
pub struct WsTransport {
    request: TransportRequest,
    events: EventSink,
    connected: Arc<AtomicBool>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(request: TransportRequest, events: EventSink) -> Self {
        Self {
            request,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            outbound: None,
            task: None,
        }
    }

    fn attempt_active(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Transport for WsTransport {
    fn connect(&mut self) {
        if self.attempt_active() {
            trace!(url = %self.request.url, "Connection already active");
            return;
        }

        let ws_request = match build_request(&self.request) {
            Ok(ws_request) => ws_request,
            Err(e) => {
                self.events.connection_error(e.to_string());
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.task = Some(tokio::spawn(run_connection(
            self.request.url.clone(),
            ws_request,
            rx,
            self.events.clone(),
            Arc::clone(&self.connected),
        )));
    }

    fn close(&mut self) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(Outbound::Close);
        }
    }

    fn send(&mut self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let tx = self.outbound.as_ref().ok_or(LinkError::NotConnected)?;
        tx.send(Outbound::Text(text))
            .map_err(|_| LinkError::Transport("Connection task has stopped".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Build the upgrade request: URL, extra headers and optional subprotocol.
pub fn build_request(request: &TransportRequest) -> Result<Request> {
    let mut ws_request = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| LinkError::Connection(format!("Invalid server URL {}: {}", request.url, e)))?;

    let headers = ws_request.headers_mut();
    for (name, value) in &request.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| LinkError::Connection(format!("Invalid header name {name}: {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| LinkError::Connection(format!("Invalid value for header {name}: {e}")))?;
        headers.insert(header_name, header_value);
    }

    if let Some(protocol) = &request.subprotocol {
        let value = HeaderValue::from_str(protocol)
            .map_err(|e| LinkError::Connection(format!("Invalid subprotocol {protocol}: {e}")))?;
        headers.insert("Sec-WebSocket-Protocol", value);
    }

    Ok(ws_request)
}

/// Connection task: connect, then pump frames both ways until the socket closes.
async fn run_connection(
    url: String,
    request: Request,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: EventSink,
    connected: Arc<AtomicBool>,
) {
    debug!(url = %url, transport = %events.id(), "Connecting to WebSocket");

    let ws = match connect_async_with_config(request, None, false).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(url = %url, error = %e, "WebSocket connect failed");
            events.connection_error(e.to_string());
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    connected.store(true, Ordering::SeqCst);
    debug!(url = %url, "WebSocket connected");
    events.connected();

    let mut close_deadline: Option<Instant> = None;

    let (status_code, reason, was_clean) = loop {
        tokio::select! {
            command = outbound.recv(), if close_deadline.is_none() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        warn!(error = %e, "WebSocket send failed");
                        break (CLOSE_ABNORMAL, e.to_string(), false);
                    }
                }
                // An explicit close, or the transport was dropped
                Some(Outbound::Close) | None => {
                    debug!(url = %url, "Closing WebSocket");
                    close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                        break (CLOSE_ABNORMAL, e.to_string(), false);
                    }
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    events.message(text);
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    trace!(size = data.len(), "Binary message received, ignoring");
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    break (code, reason, true);
                }
                // Ping/pong frames are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break (CLOSE_ABNORMAL, e.to_string(), false);
                }
                None => break (CLOSE_ABNORMAL, "Stream ended".to_string(), false),
            },
            _ = tokio::time::sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                warn!(url = %url, "Server did not answer close frame");
                break (CLOSE_ABNORMAL, "Close handshake timed out".to_string(), false);
            }
        }
    };

    // Completes the close handshake if the server started it
    let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;

    connected.store(false, Ordering::SeqCst);
    debug!(url = %url, status_code, reason = %reason, "WebSocket closed");
    events.closed(status_code, reason, was_clean);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportId;

    fn request(url: &str) -> TransportRequest {
        TransportRequest {
            url: url.to_string(),
            subprotocol: None,
            headers: vec![("User-Agent".to_string(), "gamelink-test".to_string())],
        }
    }

    #[test]
    fn test_build_request_sets_headers() {
        let mut req = request("ws://localhost:8080/game");
        req.subprotocol = Some("game.v1".into());

        let built = build_request(&req).unwrap();
        assert_eq!(built.uri().to_string(), "ws://localhost:8080/game");
        assert_eq!(built.headers()["User-Agent"], "gamelink-test");
        assert_eq!(built.headers()["Sec-WebSocket-Protocol"], "game.v1");
        assert!(built.headers().contains_key("Sec-WebSocket-Key"));
    }

    #[test]
    fn test_build_request_rejects_bad_url() {
        assert!(matches!(
            build_request(&request("not a url")),
            Err(LinkError::Connection(_))
        ));
    }

    #[test]
    fn test_factory_rejects_bad_header() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut req = request("ws://localhost:8080");
        req.headers.push(("Bad Header".into(), "x".into()));

        let result = WsTransportFactory.create(req, EventSink::new(TransportId(1), tx));
        assert!(result.is_err());
    }

    #[test]
    fn test_send_before_connect_is_not_connected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut transport =
            WsTransport::new(request("ws://localhost:8080"), EventSink::new(TransportId(1), tx));

        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send("Ping\n{}".into()),
            Err(LinkError::NotConnected)
        ));
        // Closing an unopened transport does nothing
        transport.close();
    }

    #[tokio::test]
    async fn test_connect_failure_reports_connection_error() {
        // Bind then drop a listener to get a port nobody is listening on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WsTransport::new(
            request(&format!("ws://127.0.0.1:{port}")),
            EventSink::new(TransportId(9), tx),
        );
        transport.connect();

        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.transport, TransportId(9));
        assert!(matches!(
            envelope.event,
            crate::transport::TransportEvent::ConnectionError(_)
        ));
        assert!(!transport.is_connected());
    }
}
