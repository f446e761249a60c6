#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use huddle_domain::{RoomId, UserId};
use huddle_protocol::ServerEvent;
use huddle_store::Clock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::registry::BoundedRegistry;

pub type ConnId = u64;

/// Command consumed by a connection's writer task.
#[derive(Debug)]
pub enum SessionCommand {
	Deliver(Box<ServerEvent>),
	Close,
}

/// Cloneable outbound path to one connection.
#[derive(Clone)]
pub struct SessionHandle {
	inner: Arc<HandleInner>,
}

struct HandleInner {
	conn_id: ConnId,
	user: UserId,
	tx: mpsc::Sender<SessionCommand>,
	preempted: AtomicBool,
}

impl SessionHandle {
	pub fn new(conn_id: ConnId, user: UserId, tx: mpsc::Sender<SessionCommand>) -> Self {
		Self {
			inner: Arc::new(HandleInner {
				conn_id,
				user,
				tx,
				preempted: AtomicBool::new(false),
			}),
		}
	}

	pub fn conn_id(&self) -> ConnId {
		self.inner.conn_id
	}

	pub fn user(&self) -> &UserId {
		&self.inner.user
	}

	/// Queue an event; a full or closed outbound queue drops it.
	pub fn deliver(&self, event: ServerEvent) -> bool {
		match self.inner.tx.try_send(SessionCommand::Deliver(Box::new(event))) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("huddle_server_outbound_dropped_total").increment(1);
				warn!(conn_id = self.inner.conn_id, "outbound queue full; event dropped");
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	/// Ask the writer task to flush and close the connection.
	pub fn close(&self) {
		if self.inner.tx.try_send(SessionCommand::Close).is_err() {
			let tx = self.inner.tx.clone();
			tokio::spawn(async move {
				let _ = tx.send(SessionCommand::Close).await;
			});
		}
	}

	pub fn is_closed(&self) -> bool {
		self.inner.tx.is_closed()
	}

	/// Flag the session as pre-empted so its disconnect path skips leave
	/// messages.
	pub fn mark_preempted(&self) {
		self.inner.preempted.store(true, Ordering::SeqCst);
	}

	pub fn is_preempted(&self) -> bool {
		self.inner.preempted.load(Ordering::SeqCst)
	}
}

/// In-memory connection entry; one per user.
#[derive(Clone)]
pub struct ConnectionEntry {
	pub handle: SessionHandle,
	pub created_ms: i64,
	pub last_activity_ms: i64,
	pub room: Option<RoomId>,
}

/// Outcome of registering an authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
	Fresh,
	/// A prior session for the same user was warned and scheduled for
	/// pre-emption.
	Replaced,
}

#[derive(Debug, Clone)]
pub struct ConnectionRegistryConfig {
	pub capacity: usize,
	/// Grace window between `duplicate_login` and forced close.
	pub preempt_window: Duration,
}

impl Default for ConnectionRegistryConfig {
	fn default() -> Self {
		Self {
			capacity: 2_000,
			preempt_window: Duration::from_secs(8),
		}
	}
}

struct PendingPreempt {
	handle: SessionHandle,
	timer: tokio::task::JoinHandle<()>,
}

/// Single-active-session registry (at most one entry per user).
pub struct ConnectionRegistry {
	cfg: ConnectionRegistryConfig,
	clock: Arc<dyn Clock>,
	entries: BoundedRegistry<UserId, ConnectionEntry>,
	/// Pre-emption timers keyed by the *outgoing* connection id.
	pending: Arc<Mutex<HashMap<ConnId, PendingPreempt>>>,
}

impl ConnectionRegistry {
	pub fn new(cfg: ConnectionRegistryConfig, clock: Arc<dyn Clock>) -> Self {
		let entries = BoundedRegistry::new("connections", cfg.capacity);
		Self {
			cfg,
			clock,
			entries,
			pending: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Register an authenticated session, pre-empting any prior one.
	pub fn register(&self, handle: SessionHandle, device_info: &str, ip_address: &str) -> RegisterOutcome {
		let now = self.clock.now_ms();
		let user = handle.user().clone();
		let entry = ConnectionEntry {
			handle: handle.clone(),
			created_ms: now,
			last_activity_ms: now,
			room: None,
		};

		let (prior, evicted) = self.entries.replace(user.clone(), entry);

		if let Some((evicted_user, evicted_entry)) = evicted {
			// Capacity pressure: the oldest connection loses its slot and
			// is closed without room-leave side effects.
			warn!(user = %evicted_user, "connection registry at capacity; closing oldest session");
			evicted_entry.handle.mark_preempted();
			evicted_entry.handle.close();
		}

		let Some(prior) = prior else {
			metrics::gauge!("huddle_server_registered_users").increment(1.0);
			info!(conn_id = handle.conn_id(), user = %user, "session registered");
			return RegisterOutcome::Fresh;
		};

		if prior.handle.conn_id() == handle.conn_id() {
			return RegisterOutcome::Fresh;
		}

		info!(
			conn_id = handle.conn_id(),
			prior_conn_id = prior.handle.conn_id(),
			user = %user,
			"duplicate login; warning prior session"
		);
		metrics::counter!("huddle_server_duplicate_logins_total").increment(1);

		prior.handle.deliver(ServerEvent::DuplicateLogin {
			device_info: device_info.to_string(),
			ip_address: ip_address.to_string(),
			timestamp: now,
		});
		prior.handle.mark_preempted();
		self.schedule_preemption(prior.handle);

		RegisterOutcome::Replaced
	}

	fn schedule_preemption(&self, old: SessionHandle) {
		let conn_id = old.conn_id();
		let window = self.cfg.preempt_window;
		let pending = Arc::clone(&self.pending);

		let timer_handle = old.clone();
		let timer = tokio::spawn(async move {
			tokio::time::sleep(window).await;

			let fired = pending.lock().map(|mut p| p.remove(&conn_id).is_some()).unwrap_or(false);
			if !fired {
				// Cancelled concurrently; the incumbent already went away.
				return;
			}

			timer_handle.deliver(ServerEvent::SessionEnded {
				reason: "duplicate_login".to_string(),
			});
			timer_handle.close();
			debug!(conn_id, "pre-emption window elapsed; prior session closed");
		});

		if let Ok(mut p) = self.pending.lock() {
			p.insert(conn_id, PendingPreempt { handle: old, timer });
		}
	}

	/// Complete any pending pre-emption for `user` immediately.
	pub fn force_end_pending(&self, user: &UserId, reason: &str) -> bool {
		let victims: Vec<PendingPreempt> = {
			let Ok(mut pending) = self.pending.lock() else {
				return false;
			};
			let conn_ids: Vec<ConnId> = pending
				.iter()
				.filter(|(_, p)| p.handle.user() == user)
				.map(|(id, _)| *id)
				.collect();
			conn_ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
		};

		let mut ended = false;
		for victim in victims {
			victim.timer.abort();
			victim.handle.deliver(ServerEvent::SessionEnded {
				reason: reason.to_string(),
			});
			victim.handle.close();
			ended = true;
		}
		ended
	}

	/// Remove the entry for `user` only if it still points at `conn_id`.
	///
	/// Also cancels any pre-emption timer aimed at `conn_id`: a session that
	/// disconnects during the warning window must not receive a second
	/// `session_ended`.
	pub fn unregister(&self, user: &UserId, conn_id: ConnId) -> bool {
		if let Ok(mut pending) = self.pending.lock()
			&& let Some(p) = pending.remove(&conn_id)
		{
			p.timer.abort();
		}

		let removed = self.entries.remove_if(user, |e| e.handle.conn_id() == conn_id);
		if removed.is_some() {
			metrics::gauge!("huddle_server_registered_users").decrement(1.0);
			info!(conn_id, user = %user, "session unregistered");
			true
		} else {
			debug!(conn_id, user = %user, "stale unregister ignored (entry already replaced)");
			false
		}
	}

	pub fn lookup(&self, user: &UserId) -> Option<SessionHandle> {
		self.entries.get(user).map(|e| e.handle)
	}

	pub fn entry(&self, user: &UserId) -> Option<ConnectionEntry> {
		self.entries.get(user)
	}

	/// Record the user's current room on the connection entry.
	pub fn set_room(&self, user: &UserId, room: Option<RoomId>) {
		let now = self.clock.now_ms();
		self.entries.update(user, |entry| {
			entry.room = room;
			entry.last_activity_ms = now;
		});
	}

	/// Bump last-activity for the user's entry.
	pub fn touch(&self, user: &UserId) {
		let now = self.clock.now_ms();
		self.entries.update(user, |entry| {
			entry.last_activity_ms = now;
		});
	}

	/// Drop entries whose handle is no longer connected; janitor hook.
	pub fn sweep_dead(&self) -> usize {
		let dropped = self.entries.retain(|_, e| !e.handle.is_closed());
		if dropped > 0 {
			metrics::gauge!("huddle_server_registered_users").decrement(dropped as f64);
		}
		dropped
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
