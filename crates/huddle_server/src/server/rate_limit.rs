#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::UserId;
use huddle_store::{Cache, Clock, keys};
use tracing::debug;

use crate::server::registry::BoundedRegistry;
use crate::util::time::{WINDOW_MS, window_index};

/// Rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
	/// Maximum operations per user per window.
	pub max_per_window: u32,

	/// In-process fallback registry capacity.
	pub fallback_capacity: usize,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			max_per_window: 40,
			fallback_capacity: 2_000,
		}
	}
}

/// Per-user bucket held in the in-process fallback.
#[derive(Debug, Clone, Copy)]
pub struct RateBucket {
	pub window: i64,
	pub count: u32,
}

/// Sliding fixed-window rate limiter.
///
/// The authoritative counter lives in the shared cache (atomic increment,
/// TTL one window) so the budget holds across instances; a cache outage
/// degrades to the in-process bounded registry rather than failing sends.
pub struct RateLimiter {
	cfg: RateLimitConfig,
	clock: Arc<dyn Clock>,
	cache: Arc<dyn Cache>,
	fallback: BoundedRegistry<UserId, RateBucket>,
}

impl RateLimiter {
	pub fn new(cfg: RateLimitConfig, clock: Arc<dyn Clock>, cache: Arc<dyn Cache>) -> Self {
		let fallback = BoundedRegistry::new("rate_buckets", cfg.fallback_capacity);
		Self {
			cfg,
			clock,
			cache,
			fallback,
		}
	}

	/// Whether `user` may perform one more operation in the current window.
	pub async fn check(&self, user: &UserId) -> bool {
		let window = window_index(self.clock.now_ms());
		let key = keys::rate_bucket(user, window);

		let count = match self.cache.incr(&key, Duration::from_millis(WINDOW_MS as u64)).await {
			Ok(n) => n,
			Err(e) => {
				debug!(user = %user, error = %e, "rate cache unavailable; using in-process counter");
				metrics::counter!("huddle_server_rate_cache_fallbacks_total").increment(1);
				let bucket = self.fallback.upsert(user.clone(), |prev| match prev {
					Some(b) if b.window == window => RateBucket {
						window,
						count: b.count.saturating_add(1),
					},
					_ => RateBucket { window, count: 1 },
				});
				bucket.count as i64
			}
		};

		let ok = count <= self.cfg.max_per_window as i64;
		if !ok {
			metrics::counter!("huddle_server_rate_limited_total").increment(1);
		}
		ok
	}

	/// Drop fallback buckets older than `max_age_windows`; janitor hook.
	pub fn sweep(&self, max_age_windows: i64) -> usize {
		let cutoff = window_index(self.clock.now_ms()) - max_age_windows;
		self.fallback.retain(|_, bucket| bucket.window >= cutoff)
	}

	/// Clear the fallback registry; memory-pressure hook.
	pub fn clear_fallback(&self) -> usize {
		self.fallback.clear()
	}

	pub fn fallback_len(&self) -> usize {
		self.fallback.len()
	}
}
