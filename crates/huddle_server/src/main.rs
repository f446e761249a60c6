#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use huddle_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use huddle_server::server::connection::handle_connection;
use huddle_server::server::core::{Collaborators, Core};
use huddle_server::server::health::{HealthState, spawn_health_server};
use huddle_server::server::janitor::spawn_janitor;
use huddle_store::{
	AuthVerifier, Cache, Clock, FileRepo, LocalBus, MemoryCache, MemorySessions, MemoryStore, MessageRepo, PubSub,
	RoomRepo, ScriptedAiGenerator, SqlStore, SystemClock, UserRepo,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: huddle_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Bind address (default: 127.0.0.1:18350)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind = "127.0.0.1:18350".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind.parse().unwrap_or_else(|e| {
		eprintln!("invalid bind address {bind}: {e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,huddle_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn build_collaborators(cfg: &ServerConfig) -> anyhow::Result<Collaborators> {
	let clock: Arc<dyn Clock> = Arc::new(SystemClock);
	let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(Arc::clone(&clock)));
	let bus: Arc<dyn PubSub> = Arc::new(LocalBus::new());

	// Sessions are owned by the auth subsystem; without one attached this
	// instance accepts any (user, session) pair the token authorises.
	let verifier: Arc<dyn AuthVerifier> = Arc::new(MemorySessions::allow_all());
	let generator = Arc::new(ScriptedAiGenerator::new());

	let (messages, rooms, users, files): (
		Arc<dyn MessageRepo>,
		Arc<dyn RoomRepo>,
		Arc<dyn UserRepo>,
		Arc<dyn FileRepo>,
	) = if cfg.persistence.enabled {
		let url = cfg
			.persistence
			.database_url
			.as_deref()
			.context("persistence enabled but no database_url configured")?;
		let store = Arc::new(SqlStore::connect(url).await?);
		info!("persistent store connected");
		(store.clone(), store.clone(), store.clone(), store)
	} else {
		let store = Arc::new(MemoryStore::new());
		info!("in-memory store active (persistence disabled)");
		(store.clone(), store.clone(), store.clone(), store)
	};

	Ok(Collaborators {
		clock,
		cache,
		bus,
		messages,
		rooms,
		users,
		files,
		verifier,
		generator,
	})
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = default_config_path()?;
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let collaborators = build_collaborators(&server_cfg).await?;
	let core = Core::new(server_cfg.core_config(), collaborators);
	let conn_settings = server_cfg.connection_settings();

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let janitor = spawn_janitor(server_cfg.janitor_config(), Arc::clone(&core), shutdown_rx);

	let listener = TcpListener::bind(bind_addr).await.context("bind listener")?;
	info!(bind = %bind_addr, "huddle_server listening");
	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "accept failed");
						continue;
					}
				};

				let conn_id = next_conn_id;
				next_conn_id += 1;
				metrics::counter!("huddle_server_connections_total").increment(1);
				info!(conn_id, remote = %peer, "accepted connection");

				let core = Arc::clone(&core);
				let settings = conn_settings.clone();
				tokio::spawn(async move {
					if let Err(e) = handle_connection(conn_id, stream, peer, core, settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				});
			}

			sig = shutdown_signal() => {
				info!(signal = sig, "shutdown requested; refusing new sessions");
				break;
			}
		}
	}

	// Drain: flip readiness, give in-flight work a bounded grace period,
	// then tear the background machinery down.
	health_state.mark_not_ready();
	tokio::time::sleep(server_cfg.server.shutdown_grace).await;

	let _ = shutdown_tx.send(true);
	core.shutdown().await;
	let _ = janitor.await;

	info!("huddle_server stopped");
	Ok(())
}

async fn shutdown_signal() -> &'static str {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		let mut term = match signal(SignalKind::terminate()) {
			Ok(term) => term,
			Err(e) => {
				warn!(error = %e, "SIGTERM handler unavailable; falling back to ctrl-c only");
				let _ = tokio::signal::ctrl_c().await;
				return "SIGINT";
			}
		};

		tokio::select! {
			_ = tokio::signal::ctrl_c() => "SIGINT",
			_ = term.recv() => "SIGTERM",
		}
	}

	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
		"SIGINT"
	}
}
