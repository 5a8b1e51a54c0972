//! Simulated hub
//!
//! Plays the hub side of the tunnel: offers a real RSA key, unwraps the
//! client's session key, confirms, then records every envelope the client
//! sends and relays whatever the test asks it to send.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use borealis_core::{EntityId, SyncError, SyncResult};
use borealis_crypto::{Envelope, HandshakeOffer, SessionKey, Transcoder, Unpacked};
use borealis_wire::NetworkMessage;

/// RSA modulus size of the hub key; small to keep tests quick
pub const HUB_KEY_BITS: usize = 1024;

/// How the hub conducts the key exchange
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HubBehavior {
    #[default]
    Cooperative,
    /// Opening line with the wrong number of fields
    MalformedOffer,
    /// Confirmation whose payload is not an empty sequence
    RejectConfirmation,
    /// Hangs up right after a valid confirmation
    CloseAfterConfirmation,
    /// Accepts the upgrade and never sends the opening line
    Silent,
}

enum HubCommand {
    Text(String),
    Close,
}

struct Shared {
    id: EntityId,
    client_id: EntityId,
    behavior: HubBehavior,
    key: RsaPrivateKey,
    transcoder: RwLock<Option<Arc<Transcoder>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<HubCommand>>>,
    received: Mutex<Vec<Unpacked>>,
    session_keys: Mutex<Vec<SessionKey>>,
    close_codes: Mutex<Vec<u16>>,
    paths: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

/// A hub listening on a loopback port
pub struct SimulatedHub {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl SimulatedHub {
    pub async fn start() -> SyncResult<Self> {
        Self::start_with(HubBehavior::Cooperative).await
    }

    pub async fn start_with(behavior: HubBehavior) -> SyncResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let key = RsaPrivateKey::new(&mut OsRng, HUB_KEY_BITS)
            .map_err(|e| SyncError::Crypto(e.to_string()))?;

        let shared = Arc::new(Shared {
            id: EntityId::new_v4(),
            client_id: EntityId::new_v4(),
            behavior,
            key,
            transcoder: RwLock::new(None),
            outbound: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            session_keys: Mutex::new(Vec::new()),
            close_codes: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    if let Err(e) = shared.serve(stream).await {
                        warn!(%peer, "hub connection ended: {}", e);
                    }
                });
            }
        });

        Ok(SimulatedHub {
            addr,
            shared,
            accept_task,
        })
    }

    pub fn id(&self) -> EntityId {
        self.shared.id
    }

    /// Id handed to every client that connects
    pub fn client_id(&self) -> EntityId {
        self.shared.client_id
    }

    /// Value for the session's tunnel base
    pub fn tunnel_base(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send `message` from the hub to the client
    pub fn send(&self, message: &NetworkMessage) -> SyncResult<()> {
        self.send_as(self.shared.id, message)
    }

    /// Send `message` to the client with an arbitrary sender
    pub fn send_as(&self, sender: EntityId, message: &NetworkMessage) -> SyncResult<()> {
        let transcoder = self.shared.transcoder.read().clone().ok_or(SyncError::NotActive)?;
        let frame = transcoder.pack(sender, self.shared.client_id, message)?;
        self.send_raw(frame)
    }

    /// Send a text frame as is
    pub fn send_raw(&self, frame: impl Into<String>) -> SyncResult<()> {
        self.command(HubCommand::Text(frame.into()))
    }

    /// Close the client's tunnel from the hub side
    pub fn close_client(&self) -> SyncResult<()> {
        self.command(HubCommand::Close)
    }

    fn command(&self, command: HubCommand) -> SyncResult<()> {
        self.shared
            .outbound
            .lock()
            .as_ref()
            .ok_or(SyncError::NotActive)?
            .send(command)
            .map_err(|_| SyncError::Transport("client connection is gone".into()))
    }

    /// Everything received so far, in order
    pub fn received(&self) -> Vec<Unpacked> {
        self.shared.received.lock().clone()
    }

    /// Received payloads that decode as messages
    pub fn messages(&self) -> Vec<NetworkMessage> {
        self.received()
            .into_iter()
            .filter_map(|unpacked| NetworkMessage::decode(unpacked.payload).ok())
            .collect()
    }

    /// Wait until at least `count` envelopes arrived
    pub async fn wait_for_received(&self, count: usize, timeout: Duration) -> SyncResult<Vec<Unpacked>> {
        if wait_until(timeout, || self.shared.received.lock().len() >= count).await {
            Ok(self.received())
        } else {
            Err(SyncError::Transport(format!(
                "expected {count} envelopes, got {}",
                self.shared.received.lock().len()
            )))
        }
    }

    /// Unwrapped session key of every connection, in order
    pub fn session_keys(&self) -> Vec<SessionKey> {
        self.shared.session_keys.lock().clone()
    }

    /// Close codes the client sent, one per closed connection
    pub fn close_codes(&self) -> Vec<u16> {
        self.shared.close_codes.lock().clone()
    }

    /// Request paths of every upgrade
    pub fn paths(&self) -> Vec<String> {
        self.shared.paths.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }
}

impl Drop for SimulatedHub {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Shared {
    async fn serve(self: Arc<Self>, stream: TcpStream) -> SyncResult<()> {
        let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
            self.paths.lock().push(request.uri().path().to_owned());
            Ok::<Response, ErrorResponse>(response)
        })
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
        self.connections.fetch_add(1, Ordering::AcqRel);

        let (mut sink, mut stream) = ws.split();
        if self.behavior == HubBehavior::Silent {
            return self.drain(&mut stream).await;
        }

        let offer = match self.behavior {
            HubBehavior::MalformedOffer => format!("{}|not-a-key", self.client_id),
            _ => HandshakeOffer::format(self.client_id, &RsaPublicKey::from(&self.key)),
        };
        sink.send(Message::Text(offer)).await.map_err(transport)?;

        let wrapped = loop {
            match stream.next().await {
                Some(Ok(Message::Binary(bytes))) => break bytes,
                Some(Ok(Message::Close(frame))) => {
                    self.record_close(frame);
                    return Ok(());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(transport(e)),
                None => return Ok(()),
            }
        };

        let key = self.unwrap_key(&wrapped)?;
        self.session_keys.lock().push(key);
        let transcoder = Arc::new(Transcoder::new());
        transcoder.register_key(self.client_id, key);
        transcoder.register_secondary_recipient(self.id, self.client_id);

        let confirmation: Value = match self.behavior {
            HubBehavior::RejectConfirmation => json!(["not", "empty"]),
            _ => json!([]),
        };
        let frame = transcoder.pack(self.id, self.client_id, &confirmation)?;
        sink.send(Message::Text(frame)).await.map_err(transport)?;

        if self.behavior == HubBehavior::CloseAfterConfirmation {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "Hub closing".into(),
            };
            sink.send(Message::Close(Some(frame))).await.map_err(transport)?;
            return self.drain(&mut stream).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.transcoder.write() = Some(Arc::clone(&transcoder));
        *self.outbound.lock() = Some(tx);

        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(Message::Text(text))) => self.record(&transcoder, &text),
                    Some(Ok(Message::Close(frame))) => {
                        self.record_close(frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("hub read error: {}", e);
                        break;
                    }
                    None => break,
                },
                command = rx.recv() => match command {
                    Some(HubCommand::Text(text)) => {
                        sink.send(Message::Text(text)).await.map_err(transport)?;
                    }
                    Some(HubCommand::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Hub closing".into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Read until the client goes away, keeping only its close code
    async fn drain<S>(&self, stream: &mut S) -> SyncResult<()>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        while let Some(next) = stream.next().await {
            match next {
                Ok(Message::Close(frame)) => {
                    self.record_close(frame);
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> SyncResult<SessionKey> {
        let key = self
            .key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| SyncError::Crypto(format!("key unwrap failed: {e}")))?;
        key.as_slice()
            .try_into()
            .map_err(|_| SyncError::Crypto(format!("session key has {} bytes", key.len())))
    }

    fn record(&self, transcoder: &Transcoder, frame: &str) {
        // third-party recipients travel under the client's own key
        if let Ok(envelope) = Envelope::parse(frame) {
            if envelope.recipient != self.client_id && !transcoder.has_key(envelope.recipient) {
                transcoder.register_secondary_recipient(envelope.recipient, self.client_id);
            }
        }

        match transcoder.unpack(frame) {
            Ok(unpacked) => self.received.lock().push(unpacked),
            Err(e) => warn!("hub could not read client frame: {}", e),
        }
    }

    fn record_close(&self, frame: Option<CloseFrame<'static>>) {
        if let Some(frame) = frame {
            self.close_codes.lock().push(u16::from(frame.code));
        }
    }
}

fn transport(e: impl std::fmt::Display) -> SyncError {
    SyncError::Transport(e.to_string())
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
