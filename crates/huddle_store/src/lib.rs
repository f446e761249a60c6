#![forbid(unsafe_code)]

//! Collaborator seams consumed by the realtime core.
//!
//! The core never talks to a database, cache, bus, or model provider
//! directly; it goes through the traits in this crate. `memory` provides an
//! implementation of every seam (the dev/demo backend and the test double),
//! `sql` a sqlx-backed durable store.

pub mod clock;
pub mod keys;
pub mod memory;
pub mod sql;

use std::time::Duration;

use async_trait::async_trait;
use huddle_domain::{FileId, FileRef, Message, MessageId, Room, RoomId, SessionId, User, UserId};
use huddle_protocol::BusEnvelope;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::{LocalBus, MemoryCache, MemorySessions, MemoryStore, ScriptedAiGenerator};
pub use sql::SqlStore;

/// Durable message store.
#[async_trait]
pub trait MessageRepo: Send + Sync {
	async fn create(&self, message: &Message) -> anyhow::Result<()>;

	async fn get(&self, id: &MessageId) -> anyhow::Result<Option<Message>>;

	/// Non-deleted messages of `room` strictly older than `before` (when
	/// set), newest first, at most `limit`.
	async fn find_before(&self, room: &RoomId, before: Option<i64>, limit: usize) -> anyhow::Result<Vec<Message>>;

	/// Bulk read marking: one conditional update per id, unordered.
	/// Ids the user already read are left untouched.
	async fn mark_read(&self, user: &UserId, ids: &[MessageId], read_at: i64) -> anyhow::Result<()>;

	/// Apply a reaction op and return the updated message, or `None` when
	/// the message does not exist.
	async fn apply_reaction(
		&self,
		id: &MessageId,
		emoji: &str,
		user: &UserId,
		add: bool,
	) -> anyhow::Result<Option<Message>>;
}

/// Room store. The core mutates only the participants set.
#[async_trait]
pub trait RoomRepo: Send + Sync {
	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<Room>>;

	/// Add a participant and return the updated set; `None` when the room
	/// does not exist. Adding an existing participant is a no-op.
	async fn add_participant(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Vec<UserId>>>;

	/// Remove a participant and return the updated set; `None` when the
	/// room does not exist.
	async fn remove_participant(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Vec<UserId>>>;
}

/// User store, read-only to the core.
#[async_trait]
pub trait UserRepo: Send + Sync {
	async fn get(&self, id: &UserId) -> anyhow::Result<Option<User>>;

	/// Resolve many users; unknown ids are skipped.
	async fn get_many(&self, ids: &[UserId]) -> anyhow::Result<Vec<User>>;
}

/// Uploaded-file store, read-only to the core.
#[async_trait]
pub trait FileRepo: Send + Sync {
	async fn get(&self, id: &FileId) -> anyhow::Result<Option<FileRef>>;
}

/// Session validation against the auth subsystem.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
	/// Whether `session` is alive and bound to `user`.
	async fn validate_session(&self, user: &UserId, session: &SessionId) -> anyhow::Result<bool>;

	/// Bump session last-activity. Best-effort.
	async fn touch_session(&self, user: &UserId, session: &SessionId) -> anyhow::Result<()>;
}

/// Volatile shared cache. Every operation is best-effort: callers treat
/// errors as misses and never fail the surrounding request.
#[async_trait]
pub trait Cache: Send + Sync {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

	async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

	async fn delete(&self, key: &str) -> anyhow::Result<()>;

	/// Atomic increment; the TTL applies when the key is created.
	async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64>;
}

/// Read a JSON value through the cache boundary.
///
/// Writes always store canonical JSON, so any entry that fails to decode is
/// stale or foreign: it is deleted and reported as a miss rather than
/// surfaced.
pub async fn cache_get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
	let raw = cache.get(key).await.ok().flatten()?;
	match serde_json::from_str(&raw) {
		Ok(v) => Some(v),
		Err(e) => {
			tracing::debug!(key, error = %e, "dropping undecodable cache entry");
			let _ = cache.delete(key).await;
			None
		}
	}
}

/// Write a JSON value through the cache boundary. Best-effort.
pub async fn cache_set_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
	let raw = match serde_json::to_string(value) {
		Ok(raw) => raw,
		Err(e) => {
			tracing::debug!(key, error = %e, "skipping unencodable cache value");
			return;
		}
	};
	if let Err(e) = cache.set(key, &raw, ttl).await {
		tracing::debug!(key, error = %e, "cache set failed");
	}
}

/// Cross-instance publish/subscribe fabric. Topic per room.
#[async_trait]
pub trait PubSub: Send + Sync {
	/// Publish; failure is logged by callers, never propagated to clients.
	async fn publish(&self, topic: &str, envelope: BusEnvelope) -> anyhow::Result<()>;

	async fn subscribe(&self, topic: &str) -> anyhow::Result<BusSubscription>;
}

/// Live subscription to one topic.
pub struct BusSubscription {
	rx: mpsc::Receiver<BusEnvelope>,
}

impl BusSubscription {
	pub fn new(rx: mpsc::Receiver<BusEnvelope>) -> Self {
		Self { rx }
	}

	/// Next envelope; `None` once the subscription is closed.
	pub async fn recv(&mut self) -> Option<BusEnvelope> {
		self.rx.recv().await
	}
}

/// One event of a streaming AI response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiEvent {
	Chunk(String),
	Complete,
	Error(String),
}

/// Lazy chunk sequence terminated by `Complete` or `Error`.
pub struct AiStream {
	rx: mpsc::Receiver<AiEvent>,
}

impl AiStream {
	pub fn new(rx: mpsc::Receiver<AiEvent>) -> Self {
		Self { rx }
	}

	/// Next event. A closed channel without a terminal event is reported
	/// as an error so consumers always observe a terminal.
	pub async fn recv(&mut self) -> AiEvent {
		match self.rx.recv().await {
			Some(ev) => ev,
			None => AiEvent::Error("generator stream closed unexpectedly".to_string()),
		}
	}
}

/// AI response generator.
#[async_trait]
pub trait AiGenerator: Send + Sync {
	/// Start generating a response for `query` with `model`.
	async fn stream(&self, query: &str, model: &str) -> anyhow::Result<AiStream>;
}
