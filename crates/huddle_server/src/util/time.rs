#![forbid(unsafe_code)]

/// Rate-limit window length.
pub const WINDOW_MS: i64 = 60_000;

/// Fixed wall-clock minute index for rate buckets.
#[inline]
pub fn window_index(now_ms: i64) -> i64 {
	now_ms.div_euclid(WINDOW_MS)
}
