#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use huddle_domain::{MessageId, RoomId, UserId};
use huddle_protocol::MessagePayload;
use huddle_store::{Cache, Clock, MessageRepo, RoomRepo, cache_get_json, cache_set_json, keys};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::payload::PayloadResolver;
use crate::server::registry::BoundedRegistry;

#[derive(Debug, Clone)]
pub struct HistoryConfig {
	pub page_limit: usize,
	/// Hard timeout per repository attempt.
	pub attempt_timeout: Duration,
	pub retry_base: Duration,
	pub retry_cap: Duration,
	pub max_attempts: u32,
	pub cache_ttl: Duration,
	pub access_cache_ttl: Duration,
	pub inflight_capacity: usize,
}

impl Default for HistoryConfig {
	fn default() -> Self {
		Self {
			page_limit: 25,
			attempt_timeout: Duration::from_secs(8),
			retry_base: Duration::from_millis(1_500),
			retry_cap: Duration::from_secs(5),
			max_attempts: 3,
			cache_ttl: Duration::from_secs(30),
			access_cache_ttl: Duration::from_secs(300),
			inflight_capacity: 1_000,
		}
	}
}

#[derive(Debug, Error)]
pub enum HistoryError {
	#[error("access denied")]
	AccessDenied,
	#[error("history load timed out")]
	Timeout,
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl HistoryError {
	pub fn code(&self) -> &'static str {
		match self {
			Self::AccessDenied => "ACCESS_DENIED",
			Self::Timeout | Self::Internal(_) => "LOAD_ERROR",
		}
	}
}

/// One page of history, ascending by time. Cached as canonical JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
	pub messages: Vec<MessagePayload>,
	#[serde(rename = "hasMore")]
	pub has_more: bool,
	#[serde(rename = "oldestTimestamp")]
	pub oldest_timestamp: Option<i64>,
}

/// Outcome of a fetch request.
#[derive(Debug)]
pub enum FetchOutcome {
	Page(HistoryPage),
	/// An identical load is already running; this request is dropped.
	Duplicate,
}

/// Paginated history reads with cache-through, per-attempt timeout, and
/// bounded retry.
pub struct HistoryLoader {
	cfg: HistoryConfig,
	messages: Arc<dyn MessageRepo>,
	rooms: Arc<dyn RoomRepo>,
	resolver: PayloadResolver,
	cache: Arc<dyn Cache>,
	clock: Arc<dyn Clock>,
	/// In-flight load keys -> start time (ms).
	inflight: BoundedRegistry<String, i64>,
}

impl HistoryLoader {
	pub fn new(
		cfg: HistoryConfig,
		messages: Arc<dyn MessageRepo>,
		rooms: Arc<dyn RoomRepo>,
		resolver: PayloadResolver,
		cache: Arc<dyn Cache>,
		clock: Arc<dyn Clock>,
	) -> Self {
		let inflight = BoundedRegistry::new("history_inflight", cfg.inflight_capacity);
		Self {
			cfg,
			messages,
			rooms,
			resolver,
			cache,
			clock,
			inflight,
		}
	}

	pub fn page_limit(&self) -> usize {
		self.cfg.page_limit
	}

	/// Fetch one page of history for `user` in `room`.
	pub async fn fetch(&self, user: &UserId, room: &RoomId, before: Option<i64>) -> Result<FetchOutcome, HistoryError> {
		self.check_access(user, room).await?;

		let cache_key = keys::history(room, before, self.cfg.page_limit);
		if let Some(page) = cache_get_json::<HistoryPage>(self.cache.as_ref(), &cache_key).await {
			metrics::counter!("huddle_server_history_cache_hits_total").increment(1);
			return Ok(FetchOutcome::Page(page));
		}
		metrics::counter!("huddle_server_history_cache_misses_total").increment(1);

		let flight_key = inflight_key(room, user, before);
		if !self.inflight.insert_if_absent(flight_key.clone(), self.clock.now_ms()) {
			debug!(room = %room, user = %user, "duplicate history load dropped");
			metrics::counter!("huddle_server_history_duplicate_loads_total").increment(1);
			return Ok(FetchOutcome::Duplicate);
		}

		let result = self.fetch_with_retry(room, before).await;
		self.inflight.remove(&flight_key);
		let page = result?;

		// Receipts for the requesting reader happen off the response path.
		let ids: Vec<MessageId> = page.messages.iter().map(|m| m.id.clone()).collect();
		if !ids.is_empty() {
			let messages = Arc::clone(&self.messages);
			let reader = user.clone();
			let read_at = self.clock.now_ms();
			tokio::spawn(async move {
				if let Err(e) = messages.mark_read(&reader, &ids, read_at).await {
					debug!(user = %reader, error = %e, "bulk mark-read failed");
				}
			});
		}

		cache_set_json(self.cache.as_ref(), &cache_key, &page, self.cfg.cache_ttl).await;
		Ok(FetchOutcome::Page(page))
	}

	/// Delete the room's latest-page cache entry; called after a persist.
	pub async fn invalidate_latest(&self, room: &RoomId) {
		let key = keys::history(room, None, self.cfg.page_limit);
		if let Err(e) = self.cache.delete(&key).await {
			debug!(room = %room, error = %e, "history cache invalidation failed");
		}
	}

	/// Drop in-flight keys older than `max_age`; janitor hook.
	pub fn sweep_inflight(&self, max_age: Duration) -> usize {
		let cutoff = self.clock.now_ms() - max_age.as_millis() as i64;
		self.inflight.retain(|_, started| *started >= cutoff)
	}

	/// Clear the in-flight registry; memory-pressure hook.
	pub fn clear_inflight(&self) -> usize {
		self.inflight.clear()
	}

	pub fn inflight_len(&self) -> usize {
		self.inflight.len()
	}

	async fn check_access(&self, user: &UserId, room: &RoomId) -> Result<(), HistoryError> {
		let key = keys::room_access(room, user);
		if let Ok(Some(_)) = self.cache.get(&key).await {
			return Ok(());
		}

		let record = self
			.rooms
			.get(room)
			.await
			.context("load room for access check")?
			.ok_or(HistoryError::AccessDenied)?;
		if !record.has_participant(user) {
			return Err(HistoryError::AccessDenied);
		}

		if let Err(e) = self.cache.set(&key, "1", self.cfg.access_cache_ttl).await {
			debug!(room = %room, error = %e, "access cache set failed");
		}
		Ok(())
	}

	async fn fetch_with_retry(&self, room: &RoomId, before: Option<i64>) -> Result<HistoryPage, HistoryError> {
		let mut wait = self.cfg.retry_base;

		for attempt in 1..=self.cfg.max_attempts {
			match tokio::time::timeout(self.cfg.attempt_timeout, self.load_page(room, before)).await {
				Ok(Ok(page)) => return Ok(page),
				Ok(Err(e)) => return Err(HistoryError::Internal(e)),
				Err(_) => {
					metrics::counter!("huddle_server_history_timeouts_total").increment(1);
					warn!(room = %room, attempt, "history load attempt timed out");

					if attempt < self.cfg.max_attempts {
						tokio::time::sleep(wait).await;
						wait = next_backoff(wait, self.cfg.retry_cap);
					}
				}
			}
		}

		Err(HistoryError::Timeout)
	}

	async fn load_page(&self, room: &RoomId, before: Option<i64>) -> anyhow::Result<HistoryPage> {
		let limit = self.cfg.page_limit;

		// limit+1 probe: the extra row only answers `hasMore`.
		let mut fetched = self
			.messages
			.find_before(room, before, limit + 1)
			.await
			.context("load history page")?;

		let has_more = fetched.len() == limit + 1;
		if has_more {
			fetched.pop();
		}
		fetched.reverse();

		let oldest_timestamp = fetched.first().map(|m| m.timestamp);
		let messages = self.resolver.resolve_many(&fetched).await;

		Ok(HistoryPage {
			messages,
			has_more,
			oldest_timestamp,
		})
	}
}

fn inflight_key(room: &RoomId, user: &UserId, before: Option<i64>) -> String {
	match before {
		Some(ts) => format!("{}:{}:{}", room.as_str(), user.as_str(), ts),
		None => format!("{}:{}:latest", room.as_str(), user.as_str()),
	}
}

fn next_backoff(current: Duration, cap: Duration) -> Duration {
	let grown = current.mul_f64(1.5);
	if grown > cap { cap } else { grown }
}
