//! Session manager - tunnel lifecycle and key exchange
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Active
//!       ^              |             |           |
//!       +--------------+-------------+-----------+   (failure or close)
//! ```

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use borealis_core::{
    Aircraft, Controller, ControllerMetadata, ControllerState, EntityId, SyncError, SyncResult,
};
use borealis_crypto::{generate_key, HandshakeOffer, Transcoder};
use borealis_state::{EntityStore, StoreChange};
use borealis_transport::{
    DiscoveryClient, ServerInfo, Tunnel, TunnelSender, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR,
};
use borealis_wire::{ChannelMessage, ControllerUpdate, Frequency, KillMessage, NetworkMessage, TextMessage};

use crate::{Dispatcher, SessionConfig, SessionEvent};

/// Close reason for a failed key exchange
pub const HANDSHAKE_FAILED: &str = "Handshake failed.";

/// Close reason when leaving
pub const FAREWELL: &str = "Good day!";

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
}

/// An established tunnel and the keys that belong to it
struct Link {
    hub: EntityId,
    me: EntityId,
    tunnel: Arc<Tunnel>,
    transcoder: Arc<Transcoder>,
    sender: TunnelSender,
}

impl Link {
    async fn shutdown(&self, code: u16, reason: &str) {
        self.tunnel.close(code, reason).await;
    }

    fn send(&self, recipient: EntityId, message: &NetworkMessage) -> SyncResult<()> {
        let frame = self.transcoder.pack(self.me, recipient, message)?;
        self.sender.send_text(frame)
    }
}

/// Client session against one hub at a time
pub struct Session {
    config: SessionConfig,
    store: Arc<EntityStore>,
    state: Arc<watch::Sender<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    discovery: RwLock<Option<DiscoveryClient>>,
    presence: RwLock<ControllerMetadata>,
    /// Serializes connect and disconnect
    lifecycle: AsyncMutex<()>,
    link: Arc<RwLock<Option<Arc<Link>>>>,
    /// Tears the link down when the hub closes the tunnel
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Tunnel of a connect attempt still in the key exchange
    pending: Mutex<Option<Arc<Tunnel>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let discovery = (!config.discovery_endpoint.is_empty())
            .then(|| DiscoveryClient::new(config.discovery_endpoint.clone()));
        let (events, _) = broadcast::channel(config.change_buffer.max(1));

        Session {
            store: Arc::new(EntityStore::with_config(config.store_config())),
            state: Arc::new(watch::channel(SessionState::Disconnected).0),
            events,
            discovery: RwLock::new(discovery),
            presence: RwLock::new(ControllerMetadata::from(&config.presence)),
            lifecycle: AsyncMutex::new(()),
            link: Arc::new(RwLock::new(None)),
            watcher: Mutex::new(None),
            pending: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(?previous, ?next, "session state changed");
        }
    }

    /// Identity the hub assigned to us in the current session
    pub fn me(&self) -> Option<EntityId> {
        self.link.read().as_ref().map(|link| link.me)
    }

    pub fn hub(&self) -> Option<EntityId> {
        self.link.read().as_ref().map(|link| link.hub)
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Point discovery at `url`; nothing is fetched yet
    pub fn select_endpoint(&self, url: impl Into<String>) {
        let client = DiscoveryClient::new(url);
        debug!(endpoint = client.endpoint(), "discovery endpoint selected");
        *self.discovery.write() = Some(client);
    }

    pub async fn list_servers(&self) -> SyncResult<Vec<ServerInfo>> {
        let client = self
            .discovery
            .read()
            .clone()
            .ok_or_else(|| SyncError::NotConfigured("no discovery endpoint selected".into()))?;
        client.list_servers().await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect to `hub`, replacing any current session
    ///
    /// Returns once the session is active or has failed; on failure the
    /// state is back to `Disconnected`.
    pub async fn select_server(&self, hub: EntityId) -> SyncResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        self.teardown(CLOSE_NORMAL, FAREWELL).await;
        self.store.clear();
        self.set_state(SessionState::Connecting);

        match self.establish(hub).await {
            Ok(link) => {
                info!(%hub, me = %link.me, "session active");
                let link = Arc::new(link);
                *self.link.write() = Some(Arc::clone(&link));
                self.set_state(SessionState::Active);
                *self.watcher.lock() = Some(self.watch_tunnel(&link));
                Ok(())
            }
            Err(e) => {
                warn!(%hub, "connection attempt failed: {}", e);
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Leave the hub
    ///
    /// A connect attempt still waiting on the hub is aborted first, so this
    /// never waits behind a hub that stays silent.
    pub async fn disconnect(&self) {
        let pending = self.pending.lock().clone();
        if let Some(tunnel) = pending {
            tunnel.close(CLOSE_NORMAL, FAREWELL).await;
        }

        let _lifecycle = self.lifecycle.lock().await;
        self.teardown(CLOSE_NORMAL, FAREWELL).await;
        self.set_state(SessionState::Disconnected);
    }

    /// Close the current tunnel and drop its keys
    async fn teardown(&self, code: u16, reason: &str) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        let link = self.link.write().take();
        if let Some(link) = link {
            link.shutdown(code, reason).await;
        }
    }

    async fn establish(&self, hub: EntityId) -> SyncResult<Link> {
        let url = self.config.tunnel_url(hub);
        info!(%hub, %url, "connecting to hub");

        let tunnel = Arc::new(Tunnel::connect(&url).await?);
        *self.pending.lock() = Some(Arc::clone(&tunnel));
        self.set_state(SessionState::Handshaking);

        let brought_up = self.bring_up(&tunnel, hub).await;
        self.pending.lock().take();

        match brought_up {
            Ok((me, transcoder)) => Ok(Link {
                hub,
                me,
                sender: tunnel.sender(),
                tunnel,
                transcoder,
            }),
            Err(e) => {
                let code = match e {
                    SyncError::Handshake(_) => CLOSE_PROTOCOL_ERROR,
                    _ => CLOSE_NORMAL,
                };
                tunnel.close(code, HANDSHAKE_FAILED).await;
                Err(e)
            }
        }
    }

    /// Key exchange, dispatcher install, confirmation and presence
    async fn bring_up(&self, tunnel: &Tunnel, hub: EntityId) -> SyncResult<(EntityId, Arc<Transcoder>)> {
        let transcoder = Arc::new(Transcoder::new());
        let me = exchange_keys(tunnel, &transcoder, hub).await?;

        let dispatcher = Arc::new(Dispatcher::new(
            me,
            hub,
            Arc::clone(&transcoder),
            tunnel.sender(),
            Arc::clone(&self.store),
            self.events.clone(),
        ));
        tunnel.on_text(move |frame| {
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                let _ = dispatcher.handle_frame(&frame).await;
            }
        })?;

        // the hub finishes its own setup after sending the confirmation
        tokio::time::sleep(self.config.confirmation_delay).await;
        tunnel.send_text(transcoder.pack(me, me, &Vec::<Value>::new())?)?;

        let presence = self.presence_update(me);
        tunnel.send_text(transcoder.pack(me, hub, &presence)?)?;

        // sends only queue; a hub that hung up after confirming shows here
        if tunnel.is_closed() {
            return Err(SyncError::Transport("tunnel closed during bring-up".into()));
        }
        Ok((me, transcoder))
    }

    /// Drop `link` and move to `Disconnected` when the hub goes away
    fn watch_tunnel(&self, link: &Arc<Link>) -> JoinHandle<()> {
        let mut closed = link.tunnel.closed_signal();
        let ours = Arc::downgrade(link);
        let slot = Arc::clone(&self.link);
        let state = Arc::clone(&self.state);
        let hub = link.hub;

        tokio::spawn(async move {
            while !*closed.borrow_and_update() {
                if closed.changed().await.is_err() {
                    break;
                }
            }

            // the slot may already hold a newer link
            let link = {
                let mut slot = slot.write();
                match slot.as_ref() {
                    Some(current) if Arc::as_ptr(current) == ours.as_ptr() => slot.take(),
                    _ => None,
                }
            };
            let Some(link) = link else {
                return;
            };

            warn!(%hub, "tunnel closed by hub");
            if state.send_replace(SessionState::Disconnected) != SessionState::Disconnected {
                info!(next = ?SessionState::Disconnected, "session state changed");
            }
            link.shutdown(CLOSE_NORMAL, FAREWELL).await;
        })
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn active_link(&self) -> SyncResult<Arc<Link>> {
        if self.state() != SessionState::Active {
            return Err(SyncError::NotActive);
        }
        self.link.read().clone().ok_or(SyncError::NotActive)
    }

    fn presence_update(&self, me: EntityId) -> NetworkMessage {
        ControllerUpdate::new(me)
            .with_metadata(self.presence.read().clone())
            .with_state(ControllerState::default())
            .into()
    }

    /// Change how we present ourselves and tell the hub
    pub fn announce(&self, metadata: ControllerMetadata) -> SyncResult<()> {
        *self.presence.write() = metadata;
        let link = self.active_link()?;
        link.send(link.hub, &self.presence_update(link.me))
    }

    pub fn send_channel_text(&self, frequency: Frequency, text: impl Into<String>) -> SyncResult<()> {
        let link = self.active_link()?;
        let message = NetworkMessage::ChannelMessage(ChannelMessage {
            from: link.me,
            frequency,
            text: text.into(),
        });
        link.send(link.hub, &message)
    }

    pub fn send_direct_text(&self, recipient: EntityId, text: impl Into<String>) -> SyncResult<()> {
        let link = self.active_link()?;
        let message = NetworkMessage::TextMessage(TextMessage {
            from: link.me,
            to: recipient,
            text: text.into(),
        });
        link.send(link.hub, &message)
    }

    pub fn send_kill(&self, victim: EntityId) -> SyncResult<()> {
        let link = self.active_link()?;
        link.send(link.hub, &NetworkMessage::KillMessage(KillMessage { victim }))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn store(&self) -> Arc<EntityStore> {
        Arc::clone(&self.store)
    }

    /// Aircraft projected to now
    pub fn aircraft(&self) -> Vec<Aircraft> {
        self.store.aircraft()
    }

    pub fn controllers(&self) -> Vec<Controller> {
        self.store.controllers()
    }

    pub fn ids_by_callsign(&self, callsign: &str) -> Vec<EntityId> {
        self.store.ids_by_callsign(callsign)
    }

    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("hub", &self.hub())
            .field("me", &self.me())
            .finish_non_exhaustive()
    }
}

/// Client side of the key exchange; returns the id the hub assigned us
async fn exchange_keys(tunnel: &Tunnel, transcoder: &Transcoder, hub: EntityId) -> SyncResult<EntityId> {
    let offer = HandshakeOffer::parse(&tunnel.intercept_next_text().await?)?;
    let me = offer.client_id;
    debug!(%me, "received handshake offer");

    transcoder.load_asymmetric_key(offer.hub_key);
    let key = generate_key();
    transcoder.register_key(me, key);
    transcoder.register_secondary_recipient(hub, me);

    tunnel.send_bytes(transcoder.asymmetric_encrypt(&key)?)?;

    let confirmation = tunnel.intercept_next_text().await?;
    let unpacked = transcoder
        .unpack(&confirmation)
        .map_err(|e| SyncError::Handshake(format!("unreadable confirmation: {e}")))?;

    match unpacked.payload {
        Value::Array(items) if items.is_empty() => Ok(me),
        other => Err(SyncError::Handshake(format!(
            "expected empty confirmation, got {other}"
        ))),
    }
}
