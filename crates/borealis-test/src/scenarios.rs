//! End-to-end session scenarios against the simulated hub

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use borealis_core::{
    AircraftMetadata, AircraftState, ControllerLevel, ControllerMetadata, Coordinate, EntityId,
    Movement, SyncError,
};
use borealis_crypto::Transcoder;
use borealis_runtime::{Session, SessionConfig, SessionEvent, SessionState};
use borealis_state::StoreChange;
use borealis_wire::{
    AircraftUpdate, AuthoritativeUpdate, ChannelMessage, ControllerUpdate, Frequency, NetworkMessage,
};

use crate::{wait_until, HubBehavior, SimulatedHub};

const WAIT: Duration = Duration::from_secs(5);

fn session_for(hub: &SimulatedHub) -> Session {
    Session::with_config(
        SessionConfig::default()
            .with_tunnel_base(hub.tunnel_base())
            .with_confirmation_delay(Duration::from_millis(10)),
    )
}

fn flight(id: EntityId, callsign: &str) -> AircraftUpdate {
    AircraftUpdate::new(id)
        .with_metadata(AircraftMetadata {
            callsign: callsign.into(),
            origin: "KLAX".into(),
            destination: "KSFO".into(),
            ..AircraftMetadata::default()
        })
        .with_state(AircraftState {
            position: Coordinate::new(33.9, -118.4),
            heading: 300.0,
            altitude: 8000,
        })
        .with_movement(Movement { speed: 250.0 })
}

async fn connected() -> (SimulatedHub, Session) {
    let hub = SimulatedHub::start().await.unwrap();
    let session = session_for(&hub);
    session.select_server(hub.id()).await.unwrap();
    // confirmation and presence
    hub.wait_for_received(2, WAIT).await.unwrap();
    (hub, session)
}

#[tokio::test]
async fn test_handshake_success() {
    let hub = SimulatedHub::start().await.unwrap();
    let session = session_for(&hub);

    session.select_server(hub.id()).await.unwrap();

    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.me(), Some(hub.client_id()));
    assert_eq!(session.hub(), Some(hub.id()));
    assert_eq!(hub.paths(), vec![format!("/connect/{}", hub.id())]);

    let received = hub.wait_for_received(2, WAIT).await.unwrap();

    // confirmation: empty payload addressed to ourselves
    assert_eq!(received[0].sender, hub.client_id());
    assert_eq!(received[0].recipient, hub.client_id());
    assert_eq!(received[0].payload, Value::Array(vec![]));

    // presence: full metadata, empty area, addressed to the hub
    assert_eq!(received[1].recipient, hub.id());
    let NetworkMessage::ControllerUpdate(presence) =
        NetworkMessage::decode(received[1].payload.clone()).unwrap()
    else {
        panic!("expected a controller update");
    };
    assert_eq!(presence.controller, hub.client_id());
    assert_eq!(
        presence.metadata,
        Some(ControllerMetadata::new("KZLA", ControllerLevel::Center))
    );
    assert!(presence.state.unwrap().area.is_empty());
}

#[tokio::test]
async fn test_malformed_handshake() {
    let hub = SimulatedHub::start_with(HubBehavior::MalformedOffer).await.unwrap();
    let session = session_for(&hub);

    let result = session.select_server(hub.id()).await;

    assert!(matches!(result, Err(SyncError::Handshake(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.store().is_empty());
    assert!(session.me().is_none());
    assert!(hub.received().is_empty());
}

#[tokio::test]
async fn test_rejected_confirmation() {
    let hub = SimulatedHub::start_with(HubBehavior::RejectConfirmation).await.unwrap();
    let session = session_for(&hub);

    let result = session.select_server(hub.id()).await;

    assert!(matches!(result, Err(SyncError::Handshake(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(wait_until(WAIT, || hub.close_codes() == vec![1002]).await);
    assert!(hub.received().is_empty());
}

#[tokio::test]
async fn test_unknown_id_gets_snapshot_reply() {
    let (hub, session) = connected().await;
    let known = EntityId::new_v4();
    let stranger = EntityId::new_v4();

    hub.send(&flight(known, "SWA1").into()).unwrap();
    let received = hub.wait_for_received(3, WAIT).await.unwrap();
    assert_eq!(received[2].recipient, known);

    hub.send(&flight(stranger, "AAL123").into()).unwrap();
    let received = hub.wait_for_received(4, WAIT).await.unwrap();

    let reply = &received[3];
    assert_eq!(reply.sender, hub.client_id());
    assert_eq!(reply.recipient, stranger);
    let NetworkMessage::AuthoritativeUpdate(snapshot) = NetworkMessage::decode(reply.payload.clone()).unwrap()
    else {
        panic!("expected an authoritative update");
    };
    let ids: Vec<EntityId> = snapshot.aircraft.iter().map(|u| u.aircraft).collect();
    assert_eq!(ids, vec![known]);

    assert!(wait_until(WAIT, || session.ids_by_callsign("aal123") == vec![stranger]).await);

    // a second update for the same id merges quietly
    hub.send(&AircraftUpdate::new(stranger).with_movement(Movement { speed: 180.0 }).into())
        .unwrap();
    let store = session.store();
    assert!(
        wait_until(WAIT, || store
            .raw_aircraft(stranger)
            .map_or(false, |ac| ac.movement.speed == 180.0))
        .await
    );
    assert_eq!(hub.received().len(), 4);
    assert_eq!(store.raw_aircraft(stranger).unwrap().metadata.callsign, "AAL123");
}

#[tokio::test]
async fn test_authoritative_bulk_apply() {
    let (hub, session) = connected().await;

    let bulk = AuthoritativeUpdate {
        aircraft: (0..25).map(|n| flight(EntityId::new_v4(), &format!("BLK{n}"))).collect(),
        controllers: vec![
            ControllerUpdate::new(EntityId::new_v4())
                .with_metadata(ControllerMetadata::new("LAX_TWR", ControllerLevel::Tower)),
            ControllerUpdate::new(EntityId::new_v4())
                .with_metadata(ControllerMetadata::new("SCT_APP", ControllerLevel::Approach)),
        ],
    };
    hub.send(&bulk.into()).unwrap();

    let store = session.store();
    assert!(wait_until(WAIT, || store.aircraft_count() == 25 && store.controller_count() == 2).await);
    assert_eq!(session.controllers().len(), 2);

    // a snapshot is never answered with a snapshot
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.received().len(), 2);
}

#[tokio::test]
async fn test_delete_removes_aircraft() {
    let (hub, session) = connected().await;
    let id = EntityId::new_v4();
    let store = session.store();

    hub.send(&flight(id, "JBU55").into()).unwrap();
    assert!(wait_until(WAIT, || store.contains_aircraft(id)).await);

    hub.send(&AircraftUpdate::delete(id).into()).unwrap();
    assert!(wait_until(WAIT, || session.aircraft().is_empty()).await);
}

#[tokio::test]
async fn test_reconnect_clears_store() {
    let (hub, session) = connected().await;
    hub.send(&flight(EntityId::new_v4(), "DAL7").into()).unwrap();
    let store = session.store();
    assert!(wait_until(WAIT, || store.aircraft_count() == 1).await);

    let mut changes = store.subscribe();
    session.select_server(hub.id()).await.unwrap();

    assert_eq!(session.state(), SessionState::Active);
    assert!(store.is_empty());
    assert_eq!(hub.connections(), 2);
    assert!(wait_until(WAIT, || hub.close_codes() == vec![1000]).await);

    let mut saw_clear = false;
    while let Ok(change) = changes.try_recv() {
        saw_clear |= change == StoreChange::Cleared;
    }
    assert!(saw_clear);

    // every connection negotiates its own key
    let keys = hub.session_keys();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);

    // traffic under the first key is dropped, later traffic still lands
    let stale = Transcoder::new();
    stale.register_key(hub.client_id(), keys[0]);
    let old = EntityId::new_v4();
    let fresh = EntityId::new_v4();
    hub.send_raw(stale.pack(hub.id(), hub.client_id(), &NetworkMessage::from(flight(old, "OLD1"))).unwrap())
        .unwrap();
    hub.send(&flight(fresh, "NEW1").into()).unwrap();

    assert!(wait_until(WAIT, || store.contains_aircraft(fresh)).await);
    assert!(!store.contains_aircraft(old));
}

#[tokio::test]
async fn test_hub_close_moves_to_disconnected() {
    let (hub, session) = connected().await;
    let mut states = session.subscribe_state();

    hub.close_client().unwrap();

    tokio::time::timeout(WAIT, states.wait_for(|state| *state == SessionState::Disconnected))
        .await
        .unwrap()
        .unwrap();
    assert!(session.me().is_none());
    assert!(session.hub().is_none());
    assert!(matches!(
        session.send_kill(EntityId::new_v4()),
        Err(SyncError::NotActive)
    ));

    // the next selection starts clean
    session.select_server(hub.id()).await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(hub.connections(), 2);
}

#[tokio::test]
async fn test_hub_hangup_after_confirmation_fails_connect() {
    let hub = SimulatedHub::start_with(HubBehavior::CloseAfterConfirmation).await.unwrap();
    let session = Session::with_config(
        SessionConfig::default()
            .with_tunnel_base(hub.tunnel_base())
            .with_confirmation_delay(Duration::from_millis(200)),
    );

    let result = session.select_server(hub.id()).await;

    assert!(matches!(result, Err(SyncError::Transport(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.me().is_none());
    assert!(matches!(session.send_kill(EntityId::new_v4()), Err(SyncError::NotActive)));
}

#[tokio::test]
async fn test_disconnect_interrupts_silent_hub() {
    let hub = SimulatedHub::start_with(HubBehavior::Silent).await.unwrap();
    let session = Arc::new(session_for(&hub));

    let connecting = {
        let session = Arc::clone(&session);
        let hub_id = hub.id();
        tokio::spawn(async move { session.select_server(hub_id).await })
    };
    assert!(wait_until(WAIT, || session.state() == SessionState::Handshaking).await);

    tokio::time::timeout(WAIT, session.disconnect()).await.unwrap();

    let result = tokio::time::timeout(WAIT, connecting).await.unwrap().unwrap();
    assert!(matches!(result, Err(SyncError::Transport(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(wait_until(WAIT, || hub.close_codes() == vec![1000]).await);
}

#[tokio::test]
async fn test_outbound_commands_reach_hub() {
    let (hub, session) = connected().await;
    let target = EntityId::new_v4();

    session.send_channel_text(Frequency(121_500), "ATIS information K").unwrap();
    session.send_direct_text(target, "contact ground 121.75").unwrap();
    session.send_kill(target).unwrap();
    session
        .announce(ControllerMetadata::new("LAX_DEP", ControllerLevel::Approach))
        .unwrap();

    let received = hub.wait_for_received(6, WAIT).await.unwrap();
    assert!(received[2..].iter().all(|u| u.recipient == hub.id()));

    let messages = hub.messages();
    assert_eq!(
        messages[1],
        NetworkMessage::ChannelMessage(ChannelMessage {
            from: hub.client_id(),
            frequency: Frequency(121_500),
            text: "ATIS information K".into(),
        })
    );
    assert!(matches!(&messages[2], NetworkMessage::TextMessage(m) if m.to == target));
    assert!(matches!(&messages[3], NetworkMessage::KillMessage(k) if k.victim == target));
    assert!(matches!(
        &messages[4],
        NetworkMessage::ControllerUpdate(u) if u.metadata.as_ref().map(|m| m.callsign.as_str()) == Some("LAX_DEP")
    ));
}

#[tokio::test]
async fn test_inbound_text_is_an_event() {
    let (hub, session) = connected().await;
    let mut events = session.subscribe_events();

    let message = ChannelMessage {
        from: hub.id(),
        frequency: Frequency(132_450),
        text: "all stations".into(),
    };
    hub.send(&NetworkMessage::ChannelMessage(message.clone())).unwrap();

    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, SessionEvent::ChannelText { message: m, .. } if m == message));
}

#[tokio::test]
async fn test_garbage_frames_do_not_end_session() {
    let (hub, session) = connected().await;

    hub.send_raw("{\"sent\": 1}").unwrap();
    let id = EntityId::new_v4();
    hub.send(&flight(id, "ASA8").into()).unwrap();

    let store = session.store();
    assert!(wait_until(WAIT, || store.contains_aircraft(id)).await);
    assert_eq!(session.state(), SessionState::Active);
}
