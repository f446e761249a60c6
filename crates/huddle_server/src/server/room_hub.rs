#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use huddle_domain::RoomId;
use huddle_protocol::ServerEvent;
use tokio::sync::Mutex;
use tracing::debug;

use crate::server::sessions::{ConnId, SessionHandle};

/// Per-room hub that fans events out to local sessions.
#[derive(Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self { debug_logs: false }
	}
}

#[derive(Default)]
struct Inner {
	rooms: HashMap<RoomId, RoomEntry>,
}

#[derive(Default)]
struct RoomEntry {
	subscribers: Vec<SessionHandle>,
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe a session to a room. Re-subscribing replaces the handle.
	pub async fn subscribe_room(&self, room: RoomId, handle: SessionHandle) {
		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(room.clone()).or_default();

		prune_closed_subscribers(entry);
		entry.subscribers.retain(|s| s.conn_id() != handle.conn_id());
		entry.subscribers.push(handle);

		if self.cfg.debug_logs {
			debug!(room = %room, subs = entry.subscribers.len(), "room hub: subscribed");
		}
	}

	/// Drop one session's subscription.
	pub async fn unsubscribe_room(&self, room: &RoomId, conn_id: ConnId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(room) {
			entry.subscribers.retain(|s| s.conn_id() != conn_id && !s.is_closed());

			if entry.subscribers.is_empty() {
				inner.rooms.remove(room);
			}
		}
	}

	/// Deliver an event to every session in `room`, skipping `skip`.
	///
	/// Returns how many sessions received the event.
	pub async fn publish_to_room(&self, room: &RoomId, event: &ServerEvent, skip: Option<ConnId>) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(room) else {
			return 0;
		};

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(room);
			return 0;
		}

		let mut delivered = 0usize;
		let mut dropped = 0usize;

		for sub in entry.subscribers.iter() {
			if skip == Some(sub.conn_id()) {
				continue;
			}
			if sub.deliver(event.clone()) {
				delivered += 1;
			} else {
				dropped += 1;
			}
		}

		prune_closed_subscribers(entry);
		if entry.subscribers.is_empty() {
			inner.rooms.remove(room);
		}

		if self.cfg.debug_logs && dropped > 0 {
			debug!(room = %room, dropped, kind = event.kind(), "room hub: dropped for slow or closed sessions");
		}

		delivered
	}

	/// Whether the room still has live subscribers.
	pub async fn room_is_live(&self, room: &RoomId) -> bool {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.get(room)
			.is_some_and(|e| e.subscribers.iter().any(|s| !s.is_closed()))
	}

	/// Get a snapshot of subscriber counts per room.
	pub async fn room_subscriber_counts(&self) -> HashMap<RoomId, usize> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.map(|(k, v)| (k.clone(), v.subscribers.iter().filter(|s| !s.is_closed()).count()))
			.collect()
	}

	/// Rooms currently tracked (live or not yet pruned).
	pub async fn rooms(&self) -> Vec<RoomId> {
		let inner = self.inner.lock().await;
		inner.rooms.keys().cloned().collect()
	}
}

fn prune_closed_subscribers(entry: &mut RoomEntry) {
	entry.subscribers.retain(|s| !s.is_closed());
}
