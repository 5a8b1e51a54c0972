//! Inbound frame dispatch
//!
//! Frames reach the dispatcher one at a time in tunnel order, so updates
//! to the same id apply in the order the hub sent them. Only the items of
//! an authoritative update run in parallel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use borealis_core::{EntityId, SyncError, SyncResult, Timestamp};
use borealis_crypto::Transcoder;
use borealis_state::{EntityStore, Reconciled, ReconciliationResult};
use borealis_transport::TunnelSender;
use borealis_wire::{ChannelMessage, NetworkMessage, TextMessage};

/// Non-state traffic surfaced to consumers
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    ChannelText { sent: Timestamp, message: ChannelMessage },
    DirectText { sent: Timestamp, message: TextMessage },
    Kill { sent: Timestamp, victim: EntityId },
}

/// What a handled frame did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatched {
    Aircraft(Reconciled),
    Controller(Reconciled),
    Authoritative(ReconciliationResult),
    Event,
}

/// Routes decoded messages into the store or out as events
pub struct Dispatcher {
    me: EntityId,
    hub: EntityId,
    transcoder: Arc<Transcoder>,
    sender: TunnelSender,
    store: Arc<EntityStore>,
    events: broadcast::Sender<SessionEvent>,
}

impl Dispatcher {
    pub fn new(
        me: EntityId,
        hub: EntityId,
        transcoder: Arc<Transcoder>,
        sender: TunnelSender,
        store: Arc<EntityStore>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Dispatcher {
            me,
            hub,
            transcoder,
            sender,
            store,
            events,
        }
    }

    /// Unpack, decode and dispatch one text frame
    ///
    /// Failures only affect this frame and are logged here; the returned
    /// error is informational.
    pub async fn handle_frame(&self, frame: &str) -> SyncResult<Dispatched> {
        let result = self.decode_and_dispatch(frame).await;

        match &result {
            Ok(outcome) => debug!(?outcome, "frame handled"),
            Err(SyncError::UnsupportedMessageKind(kind)) => {
                error!(kind = %kind, "unsupported protocol message, hub version mismatch?")
            }
            Err(e) => warn!("dropping frame: {}", e),
        }
        result
    }

    async fn decode_and_dispatch(&self, frame: &str) -> SyncResult<Dispatched> {
        let unpacked = self.transcoder.unpack(frame)?;
        let message = NetworkMessage::decode(unpacked.payload)?;
        debug!(kind = message.kind(), sender = %unpacked.sender, "inbound message");

        Ok(self.dispatch(unpacked.sent, message).await)
    }

    /// Apply a decoded message
    pub async fn dispatch(&self, sent: Timestamp, message: NetworkMessage) -> Dispatched {
        match message {
            NetworkMessage::AircraftUpdate(update) => {
                let outcome = match self.store.reconcile_aircraft(sent, &update) {
                    Reconciled::Unknown(id) => {
                        self.resync(id);
                        self.store.seed_aircraft(sent, &update);
                        Reconciled::Seeded
                    }
                    outcome => outcome,
                };
                Dispatched::Aircraft(outcome)
            }
            NetworkMessage::ControllerUpdate(update) => {
                let outcome = match self.store.reconcile_controller(sent, &update) {
                    Reconciled::Unknown(id) => {
                        self.resync(id);
                        self.store.seed_controller(sent, &update);
                        Reconciled::Seeded
                    }
                    outcome => outcome,
                };
                Dispatched::Controller(outcome)
            }
            NetworkMessage::AuthoritativeUpdate(bulk) => {
                Dispatched::Authoritative(self.store.apply_authoritative(sent, bulk).await)
            }
            NetworkMessage::ChannelMessage(message) => {
                self.emit(SessionEvent::ChannelText { sent, message })
            }
            NetworkMessage::TextMessage(message) => {
                self.emit(SessionEvent::DirectText { sent, message })
            }
            NetworkMessage::KillMessage(kill) => self.emit(SessionEvent::Kill {
                sent,
                victim: kill.victim,
            }),
        }
    }

    /// First contact with `id`: route it through the hub and send it
    /// everything we know
    ///
    /// The snapshot is taken before `id` itself is seeded. Send failures
    /// are logged; the update is applied regardless.
    fn resync(&self, id: EntityId) {
        self.transcoder.register_secondary_recipient(id, self.hub);

        let snapshot = NetworkMessage::from(self.store.snapshot());
        let sent = self
            .transcoder
            .pack(self.me, id, &snapshot)
            .and_then(|frame| self.sender.send_text(frame));

        match sent {
            Ok(()) => debug!(%id, "sent authoritative snapshot to new entity"),
            Err(e) => warn!(%id, "authoritative snapshot not sent: {}", e),
        }
    }

    fn emit(&self, event: SessionEvent) -> Dispatched {
        let _ = self.events.send(event);
        Dispatched::Event
    }
}
