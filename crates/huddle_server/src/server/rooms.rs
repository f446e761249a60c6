#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use huddle_domain::{Message, MessageKind, Room, RoomId, User, UserId};
use huddle_protocol::ServerEvent;
use huddle_store::{Cache, Clock, MessageRepo, RoomRepo, keys};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::server::bus::{BusRouter, RoomBroadcaster};
use crate::server::payload::PayloadResolver;
use crate::server::registry::BoundedRegistry;
use crate::server::room_hub::RoomHub;
use crate::server::sessions::{ConnId, ConnectionRegistry, SessionHandle};

/// Positive access-check cache TTL.
const ACCESS_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum JoinError {
	#[error("room not found")]
	NotFound,
	#[error("access denied")]
	AccessDenied,
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

/// Why a session is leaving its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
	/// Joining a different room.
	Switch,
	/// Connection closed normally.
	Disconnect,
}

#[derive(Debug)]
pub struct JoinOutcome {
	pub room: Room,
	pub participants: Vec<User>,
	pub rejoined: bool,
}

#[derive(Debug, Clone)]
pub struct RoomDirectoryConfig {
	/// Capacity of the user -> current-room registry.
	pub current_room_capacity: usize,
}

impl Default for RoomDirectoryConfig {
	fn default() -> Self {
		Self {
			current_room_capacity: 2_000,
		}
	}
}

/// Room membership and presence: current-room tracking, join/leave
/// transitions, participant broadcasts.
pub struct RoomDirectory {
	current: BoundedRegistry<UserId, RoomId>,
	rooms: Arc<dyn RoomRepo>,
	messages: Arc<dyn MessageRepo>,
	resolver: PayloadResolver,
	broadcaster: RoomBroadcaster,
	bus_router: Arc<BusRouter>,
	hub: RoomHub,
	connections: Arc<ConnectionRegistry>,
	cache: Arc<dyn Cache>,
	clock: Arc<dyn Clock>,
}

impl RoomDirectory {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		cfg: RoomDirectoryConfig,
		rooms: Arc<dyn RoomRepo>,
		messages: Arc<dyn MessageRepo>,
		resolver: PayloadResolver,
		broadcaster: RoomBroadcaster,
		bus_router: Arc<BusRouter>,
		hub: RoomHub,
		connections: Arc<ConnectionRegistry>,
		cache: Arc<dyn Cache>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			current: BoundedRegistry::new("current_rooms", cfg.current_room_capacity),
			rooms,
			messages,
			resolver,
			broadcaster,
			bus_router,
			hub,
			connections,
			cache,
			clock,
		}
	}

	/// The room the user is currently joined to on this instance.
	pub fn current_room(&self, user: &UserId) -> Option<RoomId> {
		self.current.get(user)
	}

	/// Join `room_id`, leaving any prior room first.
	pub async fn join(&self, handle: &SessionHandle, user: &User, room_id: &RoomId) -> Result<JoinOutcome, JoinError> {
		if let Some(old) = self.current.get(&user.id) {
			if old == *room_id {
				// Idempotent rejoin: report current state, no side effects.
				let room = self.load_room(room_id).await?;
				let participants = self.resolver.resolve_users(&room.participants).await;
				self.hub.subscribe_room(room_id.clone(), handle.clone()).await;
				return Ok(JoinOutcome {
					room,
					participants,
					rejoined: true,
				});
			}

			// Old-room broadcasts fire before the new join is visible.
			self.leave(handle.conn_id(), user, &old, LeaveReason::Switch).await;
		}

		let room = self.load_room(room_id).await?;
		if room.password_hash.is_some() && !room.has_participant(&user.id) {
			// Password entry happens in the room-CRUD surface; a protected
			// room only admits users it already lists.
			return Err(JoinError::AccessDenied);
		}

		let participant_ids = self
			.rooms
			.add_participant(room_id, &user.id)
			.await
			.context("add participant")?
			.ok_or(JoinError::NotFound)?;
		let participants = self.resolver.resolve_users(&participant_ids).await;

		self.current.insert(user.id.clone(), room_id.clone());
		self.connections.set_room(&user.id, Some(room_id.clone()));
		self.hub.subscribe_room(room_id.clone(), handle.clone()).await;
		self.bus_router.ensure_room(room_id).await;

		if let Err(e) = self
			.cache
			.set(&keys::room_access(room_id, &user.id), "1", ACCESS_CACHE_TTL)
			.await
		{
			debug!(room = %room_id, error = %e, "access cache set failed");
		}

		self.broadcaster
			.broadcast(
				room_id,
				&ServerEvent::ParticipantsUpdate {
					room_id: room_id.clone(),
					participants: participants.clone(),
				},
				None,
			)
			.await;
		self.broadcaster
			.broadcast(
				room_id,
				&ServerEvent::UserJoined {
					room_id: room_id.clone(),
					user: user.clone(),
				},
				Some(handle.conn_id()),
			)
			.await;

		self.spawn_system_message(room_id.clone(), format!("{} joined", user.name));

		info!(user = %user.id, room = %room_id, "user joined room");
		metrics::counter!("huddle_server_room_joins_total").increment(1);

		Ok(JoinOutcome {
			room,
			participants,
			rejoined: false,
		})
	}

	/// Graceful departure: membership removal and participant broadcasts.
	pub async fn leave(&self, conn_id: ConnId, user: &User, room_id: &RoomId, reason: LeaveReason) {
		self.current.remove_if(&user.id, |r| r == room_id);
		self.connections.set_room(&user.id, None);
		self.hub.unsubscribe_room(room_id, conn_id).await;

		match self.rooms.remove_participant(room_id, &user.id).await {
			Ok(Some(participant_ids)) => {
				let participants = self.resolver.resolve_users(&participant_ids).await;
				self.broadcaster
					.broadcast(
						room_id,
						&ServerEvent::ParticipantsUpdate {
							room_id: room_id.clone(),
							participants,
						},
						None,
					)
					.await;
				self.broadcaster
					.broadcast(
						room_id,
						&ServerEvent::UserLeft {
							room_id: room_id.clone(),
							user_id: user.id.clone(),
						},
						None,
					)
					.await;
			}
			Ok(None) => {}
			Err(e) => warn!(room = %room_id, user = %user.id, error = %e, "participant removal failed"),
		}

		if reason == LeaveReason::Disconnect {
			self.spawn_system_message(room_id.clone(), format!("{} disconnected", user.name));
		}

		if !self.hub.room_is_live(room_id).await {
			self.bus_router.drop_room(room_id).await;
		}

		info!(user = %user.id, room = %room_id, ?reason, "user left room");
	}

	/// Pre-emption cleanup: the replacement session keeps the membership,
	/// so only this connection's hub subscription goes away.
	pub async fn detach_preempted(&self, conn_id: ConnId, room_id: &RoomId) {
		self.hub.unsubscribe_room(room_id, conn_id).await;
		debug!(conn_id, room = %room_id, "pre-empted session detached without leave messages");
	}

	pub fn tracked_users(&self) -> usize {
		self.current.len()
	}

	async fn load_room(&self, room_id: &RoomId) -> Result<Room, JoinError> {
		self.rooms
			.get(room_id)
			.await
			.context("load room")?
			.ok_or(JoinError::NotFound)
	}

	fn spawn_system_message(&self, room_id: RoomId, content: String) {
		let messages = Arc::clone(&self.messages);
		let resolver = self.resolver.clone();
		let broadcaster = self.broadcaster.clone();
		let now = self.clock.now_ms();

		tokio::spawn(async move {
			let message = Message::new(room_id.clone(), None, content, MessageKind::System, now);
			if let Err(e) = messages.create(&message).await {
				warn!(room = %room_id, error = %e, "system message persist failed");
				return;
			}

			let payload = resolver.resolve(&message).await;
			broadcaster
				.broadcast(&room_id, &ServerEvent::Message { message: payload }, None)
				.await;
		});
	}
}
