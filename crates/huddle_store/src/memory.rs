#![forbid(unsafe_code)]

//! In-memory implementations of every collaborator seam.
//!
//! These back the dev/demo server mode and double as test fixtures; they
//! keep the trait contracts honest without external services.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use huddle_domain::{FileId, FileRef, Message, MessageId, Room, RoomId, SessionId, User, UserId};
use huddle_protocol::BusEnvelope;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::debug;

use crate::clock::Clock;
use crate::{
	AiEvent, AiGenerator, AiStream, AuthVerifier, BusSubscription, Cache, FileRepo, MessageRepo, PubSub, RoomRepo,
	UserRepo,
};

/// In-memory document store implementing the four repositories.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
	messages: HashMap<MessageId, Message>,
	rooms: HashMap<RoomId, Room>,
	users: HashMap<UserId, User>,
	files: HashMap<FileId, FileRef>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert_user(&self, user: User) {
		self.inner.lock().await.users.insert(user.id.clone(), user);
	}

	pub async fn insert_room(&self, room: Room) {
		self.inner.lock().await.rooms.insert(room.id.clone(), room);
	}

	pub async fn insert_file(&self, file: FileRef) {
		self.inner.lock().await.files.insert(file.id.clone(), file);
	}

	pub async fn message_count(&self) -> usize {
		self.inner.lock().await.messages.len()
	}
}

#[async_trait]
impl MessageRepo for MemoryStore {
	async fn create(&self, message: &Message) -> anyhow::Result<()> {
		self.inner.lock().await.messages.insert(message.id.clone(), message.clone());
		Ok(())
	}

	async fn get(&self, id: &MessageId) -> anyhow::Result<Option<Message>> {
		Ok(self.inner.lock().await.messages.get(id).cloned())
	}

	async fn find_before(&self, room: &RoomId, before: Option<i64>, limit: usize) -> anyhow::Result<Vec<Message>> {
		let inner = self.inner.lock().await;
		let mut page: Vec<Message> = inner
			.messages
			.values()
			.filter(|m| &m.room == room && !m.deleted)
			.filter(|m| before.is_none_or(|ts| m.timestamp < ts))
			.cloned()
			.collect();

		// Newest first; id as a tiebreaker for equal timestamps.
		page.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
		page.truncate(limit);
		Ok(page)
	}

	async fn mark_read(&self, user: &UserId, ids: &[MessageId], read_at: i64) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		for id in ids {
			if let Some(msg) = inner.messages.get_mut(id) {
				msg.mark_read(user, read_at);
			}
		}
		Ok(())
	}

	async fn apply_reaction(
		&self,
		id: &MessageId,
		emoji: &str,
		user: &UserId,
		add: bool,
	) -> anyhow::Result<Option<Message>> {
		let mut inner = self.inner.lock().await;
		let Some(msg) = inner.messages.get_mut(id) else {
			return Ok(None);
		};
		msg.apply_reaction(emoji, user, add);
		Ok(Some(msg.clone()))
	}
}

#[async_trait]
impl RoomRepo for MemoryStore {
	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<Room>> {
		Ok(self.inner.lock().await.rooms.get(id).cloned())
	}

	async fn add_participant(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Vec<UserId>>> {
		let mut inner = self.inner.lock().await;
		let Some(room) = inner.rooms.get_mut(room) else {
			return Ok(None);
		};
		if !room.has_participant(user) {
			room.participants.push(user.clone());
		}
		Ok(Some(room.participants.clone()))
	}

	async fn remove_participant(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Vec<UserId>>> {
		let mut inner = self.inner.lock().await;
		let Some(room) = inner.rooms.get_mut(room) else {
			return Ok(None);
		};
		room.participants.retain(|p| p != user);
		Ok(Some(room.participants.clone()))
	}
}

#[async_trait]
impl UserRepo for MemoryStore {
	async fn get(&self, id: &UserId) -> anyhow::Result<Option<User>> {
		Ok(self.inner.lock().await.users.get(id).cloned())
	}

	async fn get_many(&self, ids: &[UserId]) -> anyhow::Result<Vec<User>> {
		let inner = self.inner.lock().await;
		Ok(ids.iter().filter_map(|id| inner.users.get(id).cloned()).collect())
	}
}

#[async_trait]
impl FileRepo for MemoryStore {
	async fn get(&self, id: &FileId) -> anyhow::Result<Option<FileRef>> {
		Ok(self.inner.lock().await.files.get(id).cloned())
	}
}

/// In-memory session table for the auth seam.
pub struct MemorySessions {
	allow_all: bool,
	inner: Mutex<HashMap<(UserId, SessionId), i64>>,
}

impl MemorySessions {
	pub fn new() -> Self {
		Self {
			allow_all: false,
			inner: Mutex::new(HashMap::new()),
		}
	}

	/// Verifier that accepts any `(user, session)` pair; dev mode only.
	pub fn allow_all() -> Self {
		Self {
			allow_all: true,
			inner: Mutex::new(HashMap::new()),
		}
	}

	pub async fn seed(&self, user: UserId, session: SessionId) {
		self.inner.lock().await.insert((user, session), 0);
	}

	/// How many times the session's last-activity was bumped.
	pub async fn touch_count(&self, user: &UserId, session: &SessionId) -> Option<i64> {
		self.inner.lock().await.get(&(user.clone(), session.clone())).copied()
	}
}

impl Default for MemorySessions {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl AuthVerifier for MemorySessions {
	async fn validate_session(&self, user: &UserId, session: &SessionId) -> anyhow::Result<bool> {
		if self.allow_all {
			return Ok(true);
		}
		Ok(self.inner.lock().await.contains_key(&(user.clone(), session.clone())))
	}

	async fn touch_session(&self, user: &UserId, session: &SessionId) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		if let Some(ts) = inner.get_mut(&(user.clone(), session.clone())) {
			*ts += 1;
		}
		Ok(())
	}
}

/// In-process cache with TTL semantics driven by a [`Clock`].
pub struct MemoryCache {
	clock: Arc<dyn Clock>,
	fail: AtomicBool,
	inner: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
	value: String,
	expires_at_ms: i64,
}

impl MemoryCache {
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self {
			clock,
			fail: AtomicBool::new(false),
			inner: Mutex::new(HashMap::new()),
		}
	}

	/// Make every operation fail, simulating a cache outage.
	pub fn set_fail(&self, fail: bool) {
		self.fail.store(fail, Ordering::SeqCst);
	}

	fn check_up(&self) -> anyhow::Result<()> {
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("cache unavailable");
		}
		Ok(())
	}
}

#[async_trait]
impl Cache for MemoryCache {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
		self.check_up()?;
		let now = self.clock.now_ms();
		let mut inner = self.inner.lock().await;
		match inner.get(key) {
			Some(entry) if entry.expires_at_ms > now => Ok(Some(entry.value.clone())),
			Some(_) => {
				inner.remove(key);
				Ok(None)
			}
			None => Ok(None),
		}
	}

	async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
		self.check_up()?;
		let expires_at_ms = self.clock.now_ms() + ttl.as_millis() as i64;
		self.inner.lock().await.insert(
			key.to_string(),
			CacheEntry {
				value: value.to_string(),
				expires_at_ms,
			},
		);
		Ok(())
	}

	async fn delete(&self, key: &str) -> anyhow::Result<()> {
		self.check_up()?;
		self.inner.lock().await.remove(key);
		Ok(())
	}

	async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
		self.check_up()?;
		let now = self.clock.now_ms();
		let mut inner = self.inner.lock().await;

		let fresh = match inner.get(key) {
			Some(entry) if entry.expires_at_ms > now => entry.value.parse::<i64>().unwrap_or(0),
			_ => 0,
		};
		let next = fresh + 1;

		let expires_at_ms = match inner.get(key) {
			Some(entry) if entry.expires_at_ms > now => entry.expires_at_ms,
			_ => now + ttl.as_millis() as i64,
		};
		inner.insert(
			key.to_string(),
			CacheEntry {
				value: next.to_string(),
				expires_at_ms,
			},
		);
		Ok(next)
	}
}

/// In-process pub/sub fabric: one broadcast channel per topic.
///
/// Stands in for the shared bus in single-instance and test deployments;
/// two `LocalBus` handles over the same `Arc` emulate two instances on one
/// fabric.
#[derive(Default)]
pub struct LocalBus {
	channel_capacity: usize,
	topics: Mutex<HashMap<String, broadcast::Sender<BusEnvelope>>>,
}

impl LocalBus {
	pub fn new() -> Self {
		Self {
			channel_capacity: 256,
			topics: Mutex::new(HashMap::new()),
		}
	}

	async fn sender(&self, topic: &str) -> broadcast::Sender<BusEnvelope> {
		let mut topics = self.topics.lock().await;
		topics
			.entry(topic.to_string())
			.or_insert_with(|| broadcast::channel(self.channel_capacity.max(16)).0)
			.clone()
	}
}

#[async_trait]
impl PubSub for LocalBus {
	async fn publish(&self, topic: &str, envelope: BusEnvelope) -> anyhow::Result<()> {
		let sender = self.sender(topic).await;
		// No subscribers is fine; the envelope is simply dropped.
		let _ = sender.send(envelope);
		Ok(())
	}

	async fn subscribe(&self, topic: &str) -> anyhow::Result<BusSubscription> {
		let mut rx = self.sender(topic).await.subscribe();
		let (tx, out_rx) = mpsc::channel(64);
		let topic = topic.to_string();

		tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(env) => {
						if tx.send(env).await.is_err() {
							break;
						}
					}
					Err(broadcast::error::RecvError::Lagged(n)) => {
						debug!(topic = %topic, lagged = n, "bus subscriber lagged; envelopes dropped");
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});

		Ok(BusSubscription::new(out_rx))
	}
}

/// Generator that replays configured chunks; the dev/demo model provider.
pub struct ScriptedAiGenerator {
	chunk_delay: Duration,
	scripts: Mutex<HashMap<String, Vec<String>>>,
	failing: Mutex<HashSet<String>>,
}

impl ScriptedAiGenerator {
	pub fn new() -> Self {
		Self {
			chunk_delay: Duration::from_millis(5),
			scripts: Mutex::new(HashMap::new()),
			failing: Mutex::new(HashSet::new()),
		}
	}

	/// Customize inter-chunk delay (useful for tests).
	pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
		self.chunk_delay = delay;
		self
	}

	/// Fix the chunks returned for `model`.
	pub async fn script(&self, model: &str, chunks: Vec<String>) {
		self.scripts.lock().await.insert(model.to_string(), chunks);
	}

	/// Make `model` emit one chunk and then fail.
	pub async fn fail_model(&self, model: &str) {
		self.failing.lock().await.insert(model.to_string());
	}
}

impl Default for ScriptedAiGenerator {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl AiGenerator for ScriptedAiGenerator {
	async fn stream(&self, query: &str, model: &str) -> anyhow::Result<AiStream> {
		let chunks = {
			let scripts = self.scripts.lock().await;
			scripts
				.get(model)
				.cloned()
				.unwrap_or_else(|| vec![format!("[{model}] "), format!("echo: {query}")])
		};
		let fail = self.failing.lock().await.contains(model);
		let delay = self.chunk_delay;

		let (tx, rx) = mpsc::channel(64);
		tokio::spawn(async move {
			for (i, chunk) in chunks.iter().enumerate() {
				if fail && i == 1 {
					let _ = tx.send(AiEvent::Error("model backend failed".to_string())).await;
					return;
				}
				if tx.send(AiEvent::Chunk(chunk.clone())).await.is_err() {
					return;
				}
				tokio::time::sleep(delay).await;
			}

			if fail && chunks.len() < 2 {
				let _ = tx.send(AiEvent::Error("model backend failed".to_string())).await;
			} else {
				let _ = tx.send(AiEvent::Complete).await;
			}
		});

		Ok(AiStream::new(rx))
	}
}
