//! Stream transports.
//!
//! A [`StreamConnector`] opens one physical connection and reports what
//! happens to it as [`StreamEvent`]s. Reconnect policy lives in the
//! reconnector; connectors never retry on their own.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered events between a transport task and its dispatcher.
const EVENT_CAPACITY: usize = 128;

/// Lifecycle and traffic of one physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The connection is established.
    Opened,
    /// A text payload arrived.
    Message(String),
    /// A transport error; the connection may still close afterwards.
    Error(String),
    /// The remote end or the transport closed the connection.
    Closed,
}

/// Opens physical connections for the reconnector.
pub trait StreamConnector: Send + Sync + 'static {
    /// Start connecting to `url`.
    ///
    /// Events arrive on the returned channel until the connection closes,
    /// at which point the channel ends. Cancelling `cancel` closes the
    /// connection without reporting it as an unintentional close.
    fn connect(&self, url: &str, cancel: CancellationToken) -> mpsc::Receiver<StreamEvent>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    user_agent: String,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            user_agent: format!("agent-relay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl WebSocketConnector {
    /// Connector identifying itself with `user_agent`.
    #[must_use]
    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl StreamConnector for WebSocketConnector {
    fn connect(&self, url: &str, cancel: CancellationToken) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let url = url.to_owned();
        let user_agent = self.user_agent.clone();

        tokio::spawn(async move {
            let request = match url.as_str().into_client_request() {
                Ok(mut request) => {
                    match HeaderValue::from_str(&user_agent) {
                        Ok(value) => {
                            request.headers_mut().insert(USER_AGENT, value);
                        }
                        Err(err) => warn!(%err, "invalid user agent header, sending none"),
                    }
                    request
                }
                Err(err) => {
                    let _ = tx.send(StreamEvent::Error(format!("invalid stream url {url}: {err}"))).await;
                    let _ = tx.send(StreamEvent::Closed).await;
                    return;
                }
            };

            let connected = tokio::select! {
                () = cancel.cancelled() => return,
                result = tokio_tungstenite::connect_async(request) => result,
            };
            let (stream, _) = match connected {
                Ok(value) => value,
                Err(err) => {
                    debug!(url = %url, %err, "stream connect failed");
                    let _ = tx.send(StreamEvent::Error(err.to_string())).await;
                    let _ = tx.send(StreamEvent::Closed).await;
                    return;
                }
            };
            info!(url = %url, "stream connected");
            if tx.send(StreamEvent::Opened).await.is_err() {
                return;
            }

            let (mut writer, mut reader) = stream.split();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = writer.send(Message::Close(None)).await;
                        debug!(url = %url, "stream closed on request");
                        return;
                    }
                    frame = reader.next() => {
                        let event = match frame {
                            Some(Ok(Message::Text(text))) => StreamEvent::Message(text.as_str().to_owned()),
                            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                                Ok(text) => StreamEvent::Message(text),
                                Err(_) => continue,
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = tx.send(StreamEvent::Closed).await;
                                return;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(err)) => {
                                let _ = tx.send(StreamEvent::Error(err.to_string())).await;
                                let _ = tx.send(StreamEvent::Closed).await;
                                return;
                            }
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}
