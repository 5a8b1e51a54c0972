//! Websocket tunnel to the hub
//!
//! One reader task forwards inbound text frames, in arrival order, into a
//! queue. During the handshake the session pulls single frames off that
//! queue with [`Tunnel::intercept_next_text`]; afterwards [`Tunnel::on_text`]
//! hands the queue to a dispatcher task for good. A writer task owns the
//! sink, so any number of [`TunnelSender`] clones can send concurrently.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use borealis_core::{SyncError, SyncResult};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Peer violated the protocol
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// How long `close` waits for the close frame to be written
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// A frame queued for the writer task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Inbound text frames, in arrival order
pub type InboundReceiver = mpsc::UnboundedReceiver<String>;

/// Cloneable sending half of a tunnel
#[derive(Clone, Debug)]
pub struct TunnelSender {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl TunnelSender {
    /// Sender whose frames land in the returned queue instead of a socket
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TunnelSender { tx }, rx)
    }

    pub fn send_text(&self, text: impl Into<String>) -> SyncResult<()> {
        self.send(OutboundFrame::Text(text.into()))
    }

    pub fn send_bytes(&self, bytes: impl Into<Vec<u8>>) -> SyncResult<()> {
        self.send(OutboundFrame::Binary(bytes.into()))
    }

    fn send(&self, frame: OutboundFrame) -> SyncResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| SyncError::Transport("tunnel closed".into()))
    }

    /// True once the writer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Persistent text-frame connection to the hub
pub struct Tunnel {
    url: String,
    sender: TunnelSender,
    inbound: AsyncMutex<Option<InboundReceiver>>,
    closed: Arc<watch::Sender<bool>>,
    close_requested: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    /// Open a tunnel to `url` (`ws://` or `wss://`)
    pub async fn connect(url: &str) -> SyncResult<Self> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| SyncError::Transport(format!("connect to {url} failed: {e}")))?;

        debug!(url, status = %response.status(), "tunnel upgraded");
        Ok(Self::from_stream(url, ws))
    }

    /// Wrap an already upgraded websocket, client or server side
    pub fn from_stream<S>(url: impl Into<String>, ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let closed = Arc::new(watch::channel(false).0);

        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        debug!(len = bytes.len(), "ignoring binary frame");
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "tunnel closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("tunnel read error: {}", e);
                        break;
                    }
                }
            }
            reader_closed.send_replace(true);
        });

        let writer_closed = Arc::clone(&closed);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let (message, last) = match frame {
                    OutboundFrame::Text(text) => (Message::Text(text), false),
                    OutboundFrame::Binary(bytes) => (Message::Binary(bytes), false),
                    OutboundFrame::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        (Message::Close(Some(frame)), true)
                    }
                };

                if let Err(e) = sink.send(message).await {
                    warn!("tunnel write error: {}", e);
                    break;
                }
                if last {
                    break;
                }
            }
            let _ = sink.close().await;
            writer_closed.send_replace(true);
        });

        Tunnel {
            url: url.into(),
            sender: TunnelSender { tx: out_tx },
            inbound: AsyncMutex::new(Some(in_rx)),
            closed,
            close_requested: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// A sender that can outlive borrows of the tunnel
    pub fn sender(&self) -> TunnelSender {
        self.sender.clone()
    }

    pub fn send_text(&self, text: impl Into<String>) -> SyncResult<()> {
        self.sender.send_text(text)
    }

    pub fn send_bytes(&self, bytes: impl Into<Vec<u8>>) -> SyncResult<()> {
        self.sender.send_bytes(bytes)
    }

    /// Take exactly the next inbound text frame
    ///
    /// Only valid before [`Tunnel::on_text`] was called.
    pub async fn intercept_next_text(&self) -> SyncResult<String> {
        let mut inbound = self.inbound.lock().await;
        let rx = inbound
            .as_mut()
            .ok_or_else(|| SyncError::Transport("inbound frames are already dispatched".into()))?;

        rx.recv()
            .await
            .ok_or_else(|| SyncError::Transport("tunnel closed".into()))
    }

    /// Run `handler` for every inbound text frame from now on, in order
    ///
    /// Each frame is handled to completion before the next one starts.
    pub fn on_text<F, Fut>(&self, handler: F) -> SyncResult<()>
    where
        F: Fn(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self
            .inbound
            .try_lock()
            .ok()
            .and_then(|mut inbound| inbound.take())
            .ok_or_else(|| SyncError::Transport("text handler already installed".into()))?;

        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                handler(text).await;
            }
            debug!("tunnel dispatcher finished");
        });

        *self.dispatcher.lock() = Some(task);
        Ok(())
    }

    /// Close with `code`; later calls do nothing
    pub async fn close(&self, code: u16, reason: &str) {
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(url = %self.url, code, reason, "closing tunnel");

        let _ = self.sender.send(OutboundFrame::Close {
            code,
            reason: reason.to_owned(),
        });

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
                warn!("tunnel close frame was not flushed in time");
                writer.abort();
            }
        }

        self.abort_tasks();
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.close_requested.load(Ordering::Acquire)
    }

    /// Flips to `true` when the connection ends for any reason
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn abort_tasks(&self) {
        for slot in [&self.reader, &self.writer, &self.dispatcher] {
            if let Some(task) = slot.lock().take() {
                task.abort();
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::accept_async;

    async fn serve_one() -> (String, JoinHandle<WebSocketStream<TcpStream>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept_async(stream).await.unwrap()
        });
        (url, accept)
    }

    #[tokio::test]
    async fn test_intercept_then_dispatch_in_order() {
        let (url, accept) = serve_one().await;
        let tunnel = Tunnel::connect(&url).await.unwrap();
        let mut server = accept.await.unwrap();

        for text in ["hello", "one", "two", "three"] {
            server.send(Message::Text(text.into())).await.unwrap();
        }

        assert_eq!(tunnel.intercept_next_text().await.unwrap(), "hello");

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tunnel
            .on_text(move |text| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(text);
                }
            })
            .unwrap();

        for expected in ["one", "two", "three"] {
            assert_eq!(seen_rx.recv().await.unwrap(), expected);
        }

        assert!(tunnel.intercept_next_text().await.is_err());
        assert!(tunnel.on_text(|_| async {}).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_senders() {
        let (url, accept) = serve_one().await;
        let tunnel = Tunnel::connect(&url).await.unwrap();
        let mut server = accept.await.unwrap();

        let mut tasks = Vec::new();
        for n in 0..8 {
            let sender = tunnel.sender();
            tasks.push(tokio::spawn(async move { sender.send_text(format!("msg {n}")) }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        tunnel.send_bytes(vec![1, 2, 3]).unwrap();

        let mut texts = 0;
        while texts < 8 {
            match server.next().await.unwrap().unwrap() {
                Message::Text(_) => texts += 1,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(server.next().await.unwrap().unwrap(), Message::Binary(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (url, accept) = serve_one().await;
        let tunnel = Tunnel::connect(&url).await.unwrap();
        let mut server = accept.await.unwrap();

        tunnel.close(CLOSE_NORMAL, "Good day!").await;
        tunnel.close(CLOSE_PROTOCOL_ERROR, "again").await;
        assert!(tunnel.is_closed());
        assert!(tunnel.send_text("late").is_err());

        match server.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CLOSE_NORMAL);
                assert_eq!(frame.reason, "Good day!");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_is_observed() {
        let (url, accept) = serve_one().await;
        let tunnel = Tunnel::connect(&url).await.unwrap();
        let mut server = accept.await.unwrap();
        let mut signal = tunnel.closed_signal();

        server.close(None).await.unwrap();

        while !*signal.borrow_and_update() {
            signal.changed().await.unwrap();
        }
        assert!(tunnel.is_closed());
        assert!(tunnel.intercept_next_text().await.is_err());
    }

    #[tokio::test]
    async fn test_detached_sender() {
        let (sender, mut rx) = TunnelSender::channel();
        sender.send_text("frame").unwrap();
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Text("frame".into()));

        drop(rx);
        assert!(sender.is_closed());
        assert!(sender.send_text("gone").is_err());
    }
}
