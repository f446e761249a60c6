#![forbid(unsafe_code)]

//! Shared fixture for component tests: a full core over in-memory seams.

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::{Room, RoomId, SessionId, User, UserId};
use huddle_protocol::ServerEvent;
use huddle_store::{LocalBus, ManualClock, MemoryCache, MemorySessions, MemoryStore, ScriptedAiGenerator};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::core::{Collaborators, Core, CoreConfig};
use crate::server::rooms::JoinOutcome;
use crate::server::sessions::{ConnId, ConnectionRegistryConfig, SessionCommand, SessionHandle};

pub struct TestCore {
	pub core: Arc<Core>,
	pub store: Arc<MemoryStore>,
	pub cache: Arc<MemoryCache>,
	pub clock: Arc<ManualClock>,
	pub bus: Arc<LocalBus>,
	pub generator: Arc<ScriptedAiGenerator>,
	pub sessions: Arc<MemorySessions>,
}

impl TestCore {
	pub async fn new() -> Self {
		Self::with_config(CoreConfig {
			instance_id: "instance-test".to_string(),
			connections: ConnectionRegistryConfig {
				capacity: 64,
				preempt_window: Duration::from_millis(100),
			},
			..CoreConfig::default()
		})
		.await
	}

	pub async fn with_config(cfg: CoreConfig) -> Self {
		let clock = Arc::new(ManualClock::new(1_000_000));
		let store = Arc::new(MemoryStore::new());
		let cache = Arc::new(MemoryCache::new(clock.clone()));
		let bus = Arc::new(LocalBus::new());
		let generator = Arc::new(ScriptedAiGenerator::new().with_chunk_delay(Duration::from_millis(1)));
		let sessions = Arc::new(MemorySessions::allow_all());

		let core = Core::new(
			cfg,
			Collaborators {
				clock: clock.clone(),
				cache: cache.clone(),
				bus: bus.clone(),
				messages: store.clone(),
				rooms: store.clone(),
				users: store.clone(),
				files: store.clone(),
				verifier: sessions.clone(),
				generator: generator.clone(),
			},
		);

		Self {
			core,
			store,
			cache,
			clock,
			bus,
			generator,
			sessions,
		}
	}

	pub async fn seed_user(&self, id: &str) -> User {
		let user = User {
			id: UserId::new(id).unwrap(),
			name: id.to_string(),
			email: format!("{id}@example.com"),
			profile_image: None,
		};
		self.store.insert_user(user.clone()).await;
		user
	}

	pub async fn seed_room(&self, id: &str, creator: &str) -> RoomId {
		let room_id = RoomId::new(id).unwrap();
		self.store
			.insert_room(Room {
				id: room_id.clone(),
				name: format!("room {id}"),
				password_hash: None,
				creator: UserId::new(creator).unwrap(),
				participants: Vec::new(),
				created_at: 0,
			})
			.await;
		room_id
	}

	/// Create a session handle and register it as the user's connection.
	pub fn attach(&self, conn_id: ConnId, user: &User) -> (SessionHandle, mpsc::Receiver<SessionCommand>) {
		let (tx, rx) = mpsc::channel(64);
		let handle = SessionHandle::new(conn_id, user.id.clone(), tx);
		let _ = self.core.connections.register(handle.clone(), "test-device", "127.0.0.1");
		(handle, rx)
	}

	/// Register, then join a room.
	pub async fn join(&self, handle: &SessionHandle, user: &User, room: &RoomId) -> JoinOutcome {
		self.core.rooms.join(handle, user, room).await.expect("join ok")
	}

	pub fn session_id(&self, id: &str) -> SessionId {
		SessionId::new(id).unwrap()
	}
}

/// Next delivered event within `wait_ms`, skipping nothing.
pub async fn next_event(rx: &mut mpsc::Receiver<SessionCommand>, wait_ms: u64) -> Option<ServerEvent> {
	match timeout(Duration::from_millis(wait_ms), rx.recv()).await {
		Ok(Some(SessionCommand::Deliver(ev))) => Some(*ev),
		_ => None,
	}
}

/// Drain events until one matches `pred` or the timeout lapses.
pub async fn wait_for_event<F>(rx: &mut mpsc::Receiver<SessionCommand>, wait_ms: u64, mut pred: F) -> Option<ServerEvent>
where
	F: FnMut(&ServerEvent) -> bool,
{
	let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
	loop {
		let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
		if remaining.is_zero() {
			return None;
		}
		match timeout(remaining, rx.recv()).await {
			Ok(Some(SessionCommand::Deliver(ev))) => {
				if pred(&ev) {
					return Some(*ev);
				}
			}
			Ok(Some(SessionCommand::Close)) | Ok(None) | Err(_) => return None,
		}
	}
}
