#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::server::core::Core;
use crate::util::mem::process_rss_bytes;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
	pub interval: Duration,
	/// Fallback rate buckets older than this many windows are dropped.
	pub rate_max_age_windows: i64,
	/// In-flight history keys older than this are dropped.
	pub inflight_max_age: Duration,
	/// RSS above this logs a warning.
	pub soft_rss_bytes: Option<u64>,
	/// RSS above this clears the rate and in-flight registries.
	pub hard_rss_bytes: Option<u64>,
}

impl Default for JanitorConfig {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(180),
			rate_max_age_windows: 2,
			inflight_max_age: Duration::from_secs(300),
			soft_rss_bytes: Some(512 * 1024 * 1024),
			hard_rss_bytes: Some(1024 * 1024 * 1024),
		}
	}
}

/// One sweep over every registry the janitor owns.
pub async fn sweep_once(cfg: &JanitorConfig, core: &Core) {
	let streams = core.ai.sweep_idle();
	let buckets = core.rate.sweep(cfg.rate_max_age_windows);
	let connections = core.connections.sweep_dead();
	let inflight = core.history.sweep_inflight(cfg.inflight_max_age);
	let bus_rooms = core.bus_router.prune().await;

	debug!(streams, buckets, connections, inflight, bus_rooms, "janitor sweep complete");
	metrics::gauge!("huddle_server_ai_streams_active").set(core.ai.active_streams() as f64);
	metrics::gauge!("huddle_server_connections_tracked").set(core.connections.len() as f64);

	let Some(rss) = process_rss_bytes() else {
		return;
	};
	metrics::gauge!("huddle_server_rss_bytes").set(rss as f64);

	if let Some(hard) = cfg.hard_rss_bytes
		&& rss >= hard
	{
		let rate_dropped = core.rate.clear_fallback();
		let inflight_dropped = core.history.clear_inflight();
		warn!(
			rss,
			hard, rate_dropped, inflight_dropped, "hard memory threshold crossed; volatile registries cleared"
		);
		metrics::counter!("huddle_server_memory_pressure_clears_total").increment(1);
	} else if let Some(soft) = cfg.soft_rss_bytes
		&& rss >= soft
	{
		warn!(rss, soft, "soft memory threshold crossed");
	}
}

/// Run the janitor until the shutdown signal flips.
pub fn spawn_janitor(cfg: JanitorConfig, core: Arc<Core>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(cfg.interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		info!(interval_secs = cfg.interval.as_secs(), "janitor started");

		loop {
			tokio::select! {
				_ = interval.tick() => {
					sweep_once(&cfg, &core).await;
				}

				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						info!("janitor stopping");
						break;
					}
				}
			}
		}
	})
}
