#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time source consumed by the core; the seam exists so window and expiry
/// arithmetic can be tested without sleeping.
pub trait Clock: Send + Sync {
	/// Current Unix time in milliseconds.
	fn now_ms(&self) -> i64;
}

/// Wall-clock implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
	ms: AtomicI64,
}

impl ManualClock {
	pub fn new(start_ms: i64) -> Self {
		Self {
			ms: AtomicI64::new(start_ms),
		}
	}

	pub fn set(&self, ms: i64) {
		self.ms.store(ms, Ordering::SeqCst);
	}

	pub fn advance(&self, delta_ms: i64) {
		self.ms.fetch_add(delta_ms, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_ms(&self) -> i64 {
		self.ms.load(Ordering::SeqCst)
	}
}
