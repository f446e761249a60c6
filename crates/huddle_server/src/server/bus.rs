#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use huddle_domain::{RoomId, RoomTopic};
use huddle_protocol::{BusEnvelope, ServerEvent};
use huddle_store::PubSub;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::server::room_hub::RoomHub;
use crate::server::sessions::ConnId;

/// Local fan-out plus cross-instance publication for room-scoped events.
///
/// Message persistence is authoritative; a bus publish failure is logged
/// and never surfaced to the sending session.
#[derive(Clone)]
pub struct RoomBroadcaster {
	instance_id: String,
	hub: RoomHub,
	bus: Arc<dyn PubSub>,
}

impl RoomBroadcaster {
	pub fn new(instance_id: impl Into<String>, hub: RoomHub, bus: Arc<dyn PubSub>) -> Self {
		Self {
			instance_id: instance_id.into(),
			hub,
			bus,
		}
	}

	pub fn instance_id(&self) -> &str {
		&self.instance_id
	}

	/// Deliver locally (skipping `skip`) and publish to the bus.
	pub async fn broadcast(&self, room: &RoomId, event: &ServerEvent, skip: Option<ConnId>) {
		self.hub.publish_to_room(room, event, skip).await;
		self.publish_remote(room, event).await;
	}

	async fn publish_remote(&self, room: &RoomId, event: &ServerEvent) {
		let envelope = match BusEnvelope::new(&self.instance_id, event) {
			Ok(env) => env,
			Err(e) => {
				warn!(room = %room, kind = event.kind(), error = %e, "failed to build bus envelope");
				return;
			}
		};

		let topic = RoomTopic::format(room);
		if let Err(e) = self.bus.publish(&topic, envelope).await {
			metrics::counter!("huddle_server_bus_publish_failures_total").increment(1);
			warn!(topic = %topic, kind = event.kind(), error = %e, "bus publish failed");
		} else {
			metrics::counter!("huddle_server_bus_published_total").increment(1);
		}
	}
}

/// Routes bus envelopes from other instances into the local room hub.
///
/// One subscription task per room with local sessions. Envelopes carrying
/// this instance's own origin are dropped: their events were already
/// delivered locally at publish time.
pub struct BusRouter {
	instance_id: String,
	bus: Arc<dyn PubSub>,
	hub: RoomHub,
	tasks: Mutex<HashMap<RoomId, tokio::task::JoinHandle<()>>>,
}

impl BusRouter {
	pub fn new(instance_id: impl Into<String>, bus: Arc<dyn PubSub>, hub: RoomHub) -> Self {
		Self {
			instance_id: instance_id.into(),
			bus,
			hub,
			tasks: Mutex::new(HashMap::new()),
		}
	}

	/// Make sure a forwarding task exists for `room`.
	pub async fn ensure_room(&self, room: &RoomId) {
		let mut tasks = self.tasks.lock().await;
		if let Some(task) = tasks.get(room) {
			if !task.is_finished() {
				return;
			}
			tasks.remove(room);
		}

		let topic = RoomTopic::format(room);
		let mut sub = match self.bus.subscribe(&topic).await {
			Ok(sub) => sub,
			Err(e) => {
				// Local delivery keeps working without the bus.
				warn!(topic = %topic, error = %e, "bus subscribe failed; cross-instance events unavailable");
				return;
			}
		};

		let origin = self.instance_id.clone();
		let hub = self.hub.clone();
		let task_room = room.clone();

		let task = tokio::spawn(async move {
			while let Some(envelope) = sub.recv().await {
				if envelope.origin == origin {
					continue;
				}

				metrics::counter!("huddle_server_bus_received_total").increment(1);
				let kind = envelope.kind.clone();
				match envelope.into_event() {
					Some(event) => {
						hub.publish_to_room(&task_room, &event, None).await;
					}
					None => {
						debug!(room = %task_room, kind = %kind, "dropping undecodable bus envelope");
					}
				}
			}
			debug!(room = %task_room, "bus subscription closed; router task exiting");
		});

		tasks.insert(room.clone(), task);
		debug!(room = %room, "bus router: room subscription started");
	}

	/// Stop forwarding for `room` (last local session left).
	pub async fn drop_room(&self, room: &RoomId) {
		if let Some(task) = self.tasks.lock().await.remove(room) {
			task.abort();
			debug!(room = %room, "bus router: room subscription dropped");
		}
	}

	/// Drop subscriptions for rooms with no live local sessions.
	pub async fn prune(&self) -> usize {
		let rooms: Vec<RoomId> = {
			let tasks = self.tasks.lock().await;
			tasks.keys().cloned().collect()
		};

		let mut dropped = 0;
		for room in rooms {
			if !self.hub.room_is_live(&room).await {
				self.drop_room(&room).await;
				dropped += 1;
			}
		}
		dropped
	}

	pub async fn subscribed_rooms(&self) -> usize {
		self.tasks.lock().await.len()
	}

	/// Abort every forwarding task.
	pub async fn shutdown(&self) {
		let mut tasks = self.tasks.lock().await;
		for (room, task) in tasks.drain() {
			task.abort();
			debug!(room = %room, "bus router: task aborted at shutdown");
		}
		info!("bus router shut down");
	}
}
