use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tideline_core::Arguments;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::runtime::{CallOutcome, CallScope, ClientRuntime, ConnectionState};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("server url must use ws or wss, got {0}")]
    UnsupportedScheme(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// Constant delay between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Url,
    /// Sent on every connect so the server keeps one identity for this
    /// client across reconnects.
    pub window_key: String,
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
        }
        Ok(Self {
            url,
            window_key: Uuid::new_v4().simple().to_string(),
            token: None,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_window_key(mut self, window_key: impl Into<String>) -> Self {
        self.window_key = window_key.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The server url with the window key and token appended.
    pub fn endpoint(&self) -> Url {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("window_key", &self.window_key);
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        url
    }
}

/// A [`ClientRuntime`] driven by a reconnecting websocket. Cheap to clone;
/// every clone shares the same runtime. Not `Send`: run it on a
/// `LocalSet` or a current-thread runtime.
#[derive(Clone)]
pub struct SignalClient {
    runtime: Rc<RefCell<ClientRuntime>>,
    config: ClientConfig,
    shutdown: CancellationToken,
}

impl SignalClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            runtime: Rc::new(RefCell::new(ClientRuntime::new())),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connect<F>(&self, signal: impl Into<String>, handler: F)
    where
        F: FnMut(&mut CallScope, &Arguments) + 'static,
    {
        self.runtime.borrow_mut().connect(signal, handler);
    }

    /// Must not be called from inside a local handler; queue follow-ups on
    /// the [`CallScope`] instead.
    pub fn call(&self, signal: &str, arguments: Arguments) -> CallOutcome {
        self.runtime.borrow_mut().call(signal, arguments, None)
    }

    pub fn state(&self) -> ConnectionState {
        self.runtime.borrow().state()
    }

    pub fn pending_len(&self) -> usize {
        self.runtime.borrow().pending_len()
    }

    /// Stops [`SignalClient::run`], including a pending reconnect delay.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Keeps a connection open until [`SignalClient::shutdown`]. A lost or
    /// failed connection is retried after the reconnect delay; only one
    /// retry is ever pending.
    pub async fn run(&self) {
        let endpoint = self.config.endpoint();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.runtime.borrow_mut().begin_connecting();
            match self.session(&endpoint).await {
                Ok(()) => debug!(window_key = %self.config.window_key, "connection closed"),
                Err(err) => warn!(window_key = %self.config.window_key, error = %err, "connection failed"),
            }
            self.runtime.borrow_mut().on_disconnected();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect.delay) => {}
            }
        }
        self.runtime.borrow_mut().on_disconnected();
        info!(window_key = %self.config.window_key, "signal client stopped");
    }

    async fn session(&self, endpoint: &Url) -> Result<(), ClientError> {
        let connect = connect_async(endpoint.as_str());
        let (stream, _) = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            result = tokio::time::timeout(self.config.connect_timeout, connect) => {
                result.map_err(|_| ClientError::Timeout(self.config.connect_timeout))??
            }
        };
        let (mut ws_tx, mut ws_rx) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let flushed = self.runtime.borrow_mut().on_connected(tx);
        info!(window_key = %self.config.window_key, flushed, "connected");

        let mut in_flight = None;
        let result = self
            .pump(&mut ws_tx, &mut ws_rx, &mut rx, &mut in_flight)
            .await;

        let mut runtime = self.runtime.borrow_mut();
        runtime.on_disconnected();
        runtime.requeue_unsent(unsent_frames(in_flight, &mut rx));
        result
    }

    /// Moves frames between the socket and the runtime until either side
    /// stops. A frame whose write failed is left in `in_flight`.
    async fn pump(
        &self,
        ws_tx: &mut SplitSink<Socket, Message>,
        ws_rx: &mut SplitStream<Socket>,
        rx: &mut mpsc::UnboundedReceiver<String>,
        in_flight: &mut Option<String>,
    ) -> Result<(), ClientError> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some(frame) = rx.recv() => {
                    *in_flight = Some(frame.clone());
                    ws_tx.send(Message::Text(frame)).await?;
                    *in_flight = None;
                }
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.runtime.borrow_mut().receive(&text);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(reason = ?frame.map(|f| f.reason.to_string()), "server closed websocket");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Frames handed to a connection that never reached the socket, oldest first.
fn unsent_frames(
    in_flight: Option<String>,
    rx: &mut mpsc::UnboundedReceiver<String>,
) -> Vec<String> {
    in_flight
        .into_iter()
        .chain(std::iter::from_fn(|| rx.try_recv().ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tideline_core::args;

    #[test]
    fn endpoint_carries_window_key_and_token() {
        let config = ClientConfig::new("ws://127.0.0.1:8420/ws")
            .unwrap()
            .with_window_key("w1")
            .with_token("a.b");
        assert_eq!(
            config.endpoint().as_str(),
            "ws://127.0.0.1:8420/ws?window_key=w1&token=a.b"
        );
    }

    #[test]
    fn window_keys_are_stable_per_config() {
        let config = ClientConfig::new("ws://localhost/ws").unwrap();
        assert_eq!(config.window_key.len(), 32);
        assert_eq!(config.endpoint(), config.endpoint());
        assert_eq!(config.reconnect.delay, Duration::from_secs(3));
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            ClientConfig::new("http://localhost/ws"),
            Err(ClientError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ClientConfig::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn unsent_frames_keep_the_failed_write_first() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send("second".to_string()).unwrap();
        tx.send("third".to_string()).unwrap();

        let frames = unsent_frames(Some("first".to_string()), &mut rx);
        assert_eq!(frames, vec!["first", "second", "third"]);
        assert!(unsent_frames(None, &mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_servers_are_retried_until_shutdown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig::new(&format!("ws://{addr}/ws"))
            .unwrap()
            .with_reconnect_delay(Duration::from_secs(1));
        let client = SignalClient::new(config);
        assert_eq!(client.call("queued", args(json!({}))), CallOutcome::Buffered);

        let runner = client.clone();
        let stopper = client.clone();
        tokio::join!(runner.run(), async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.shutdown();
        });
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.pending_len(), 1);
    }
}
