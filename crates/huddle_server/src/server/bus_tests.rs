#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::{MessageId, RoomId, RoomTopic, UserId};
use huddle_protocol::{BusEnvelope, ServerEvent};
use huddle_store::{LocalBus, PubSub};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::bus::{BusRouter, RoomBroadcaster};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::sessions::{SessionCommand, SessionHandle};

fn room(id: &str) -> RoomId {
	RoomId::new(id).unwrap()
}

fn session(conn_id: u64, user: &str) -> (SessionHandle, mpsc::Receiver<SessionCommand>) {
	let (tx, rx) = mpsc::channel(16);
	(SessionHandle::new(conn_id, UserId::new(user).unwrap(), tx), rx)
}

fn read_event(user: &str) -> ServerEvent {
	ServerEvent::MessagesRead {
		user_id: UserId::new(user).unwrap(),
		message_ids: vec![MessageId::new("m1").unwrap()],
	}
}

async fn recv_event(rx: &mut mpsc::Receiver<SessionCommand>) -> Option<ServerEvent> {
	match timeout(Duration::from_millis(250), rx.recv()).await {
		Ok(Some(SessionCommand::Deliver(ev))) => Some(*ev),
		_ => None,
	}
}

#[tokio::test]
async fn own_origin_envelopes_are_dropped() {
	let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
	let hub = RoomHub::new(RoomHubConfig::default());
	let router = BusRouter::new("instance-a", bus.clone(), hub.clone());

	let (s1, mut rx1) = session(1, "u1");
	hub.subscribe_room(room("r1"), s1).await;
	router.ensure_room(&room("r1")).await;

	// Same-origin publish: the local hub already delivered it at send time,
	// so the router must not echo it back.
	let env = BusEnvelope::new("instance-a", &read_event("u2")).unwrap();
	bus.publish(&RoomTopic::format(&room("r1")), env).await.unwrap();
	assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_err());

	// Foreign origin flows through to local sessions.
	let env = BusEnvelope::new("instance-b", &read_event("u2")).unwrap();
	bus.publish(&RoomTopic::format(&room("r1")), env).await.unwrap();
	assert!(matches!(recv_event(&mut rx1).await, Some(ServerEvent::MessagesRead { .. })));
}

#[tokio::test]
async fn cross_instance_read_receipts_are_relayed_not_reapplied() {
	// Receipts arriving over the bus are trusted: the origin instance
	// already performed the durable update, so the subscriber side only
	// relays the event to local sessions. The router has no repository
	// access at all; this test pins the relay half of that contract.
	let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
	let hub = RoomHub::new(RoomHubConfig::default());
	let router = BusRouter::new("instance-a", bus.clone(), hub.clone());

	let (s1, mut rx1) = session(1, "u1");
	hub.subscribe_room(room("r1"), s1).await;
	router.ensure_room(&room("r1")).await;

	let env = BusEnvelope::new("instance-b", &read_event("u9")).unwrap();
	bus.publish(&RoomTopic::format(&room("r1")), env).await.unwrap();

	match recv_event(&mut rx1).await {
		Some(ServerEvent::MessagesRead { user_id, message_ids }) => {
			assert_eq!(user_id.as_str(), "u9");
			assert_eq!(message_ids.len(), 1);
		}
		other => panic!("expected messagesRead relay, got {other:?}"),
	}
}

#[tokio::test]
async fn broadcaster_reaches_remote_instance_sessions() {
	let bus: Arc<LocalBus> = Arc::new(LocalBus::new());

	// Instance A: the sender side.
	let hub_a = RoomHub::new(RoomHubConfig::default());
	let broadcaster = RoomBroadcaster::new("instance-a", hub_a.clone(), bus.clone());

	// Instance B: a subscriber on the same fabric.
	let hub_b = RoomHub::new(RoomHubConfig::default());
	let router_b = BusRouter::new("instance-b", bus.clone(), hub_b.clone());

	let (sa, mut rx_a) = session(1, "alice");
	let (sb, mut rx_b) = session(2, "bob");
	hub_a.subscribe_room(room("r1"), sa).await;
	hub_b.subscribe_room(room("r1"), sb).await;
	router_b.ensure_room(&room("r1")).await;

	broadcaster.broadcast(&room("r1"), &read_event("alice"), None).await;

	assert!(recv_event(&mut rx_a).await.is_some(), "local session must receive");
	assert!(recv_event(&mut rx_b).await.is_some(), "remote-instance session must receive");
}

#[tokio::test]
async fn prune_drops_rooms_without_live_sessions() {
	let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
	let hub = RoomHub::new(RoomHubConfig::default());
	let router = BusRouter::new("instance-a", bus.clone(), hub.clone());

	let (s1, rx1) = session(1, "u1");
	hub.subscribe_room(room("r1"), s1).await;
	router.ensure_room(&room("r1")).await;
	assert_eq!(router.subscribed_rooms().await, 1);

	drop(rx1);
	assert_eq!(router.prune().await, 1);
	assert_eq!(router.subscribed_rooms().await, 0);
}
