#![forbid(unsafe_code)]

use std::sync::Arc;

use huddle_store::{AiGenerator, AuthVerifier, Cache, Clock, FileRepo, MessageRepo, PubSub, RoomRepo, UserRepo};
use tracing::info;

use crate::server::ai::{AiConfig, AiStreamCoordinator};
use crate::server::auth::SessionAuthenticator;
use crate::server::bus::{BusRouter, RoomBroadcaster};
use crate::server::history::{HistoryConfig, HistoryLoader};
use crate::server::ingest::{IngestConfig, MessageIngest};
use crate::server::payload::PayloadResolver;
use crate::server::rate_limit::{RateLimitConfig, RateLimiter};
use crate::server::receipts::ReceiptProcessor;
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::rooms::{RoomDirectory, RoomDirectoryConfig};
use crate::server::sessions::{ConnectionRegistry, ConnectionRegistryConfig};
use crate::util::secret::SecretString;

/// External seams the core consumes; everything behind them is replaceable.
#[derive(Clone)]
pub struct Collaborators {
	pub clock: Arc<dyn Clock>,
	pub cache: Arc<dyn Cache>,
	pub bus: Arc<dyn PubSub>,
	pub messages: Arc<dyn MessageRepo>,
	pub rooms: Arc<dyn RoomRepo>,
	pub users: Arc<dyn UserRepo>,
	pub files: Arc<dyn FileRepo>,
	pub verifier: Arc<dyn AuthVerifier>,
	pub generator: Arc<dyn AiGenerator>,
}

/// Assembled configuration for the realtime core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
	/// This instance's identity on the bus.
	pub instance_id: String,
	pub auth_secret: SecretString,
	pub rate: RateLimitConfig,
	pub connections: ConnectionRegistryConfig,
	pub rooms: RoomDirectoryConfig,
	pub history: HistoryConfig,
	pub ingest: IngestConfig,
	pub ai: AiConfig,
	pub hub: RoomHubConfig,
}

impl Default for CoreConfig {
	fn default() -> Self {
		Self {
			instance_id: uuid::Uuid::new_v4().to_string(),
			auth_secret: SecretString::new("insecure-dev-secret"),
			rate: RateLimitConfig::default(),
			connections: ConnectionRegistryConfig::default(),
			rooms: RoomDirectoryConfig::default(),
			history: HistoryConfig::default(),
			ingest: IngestConfig::default(),
			ai: AiConfig::default(),
			hub: RoomHubConfig::default(),
		}
	}
}

/// The realtime session and fan-out core, fully wired.
///
/// Created once at startup and shared by every connection task. All mutable
/// state lives in the bounded registries owned by the components; there are
/// no process-wide singletons.
pub struct Core {
	pub auth: SessionAuthenticator,
	pub connections: Arc<ConnectionRegistry>,
	pub hub: RoomHub,
	pub broadcaster: RoomBroadcaster,
	pub bus_router: Arc<BusRouter>,
	pub rooms: Arc<RoomDirectory>,
	pub history: Arc<HistoryLoader>,
	pub rate: Arc<RateLimiter>,
	pub ai: Arc<AiStreamCoordinator>,
	pub ingest: Arc<MessageIngest>,
	pub receipts: Arc<ReceiptProcessor>,
	pub resolver: PayloadResolver,
	pub clock: Arc<dyn Clock>,
}

impl Core {
	pub fn new(cfg: CoreConfig, collab: Collaborators) -> Arc<Self> {
		let hub = RoomHub::new(cfg.hub.clone());
		let broadcaster = RoomBroadcaster::new(cfg.instance_id.clone(), hub.clone(), Arc::clone(&collab.bus));
		let bus_router = Arc::new(BusRouter::new(
			cfg.instance_id.clone(),
			Arc::clone(&collab.bus),
			hub.clone(),
		));

		let resolver = PayloadResolver::new(
			Arc::clone(&collab.users),
			Arc::clone(&collab.files),
			Arc::clone(&collab.cache),
		);

		let auth = SessionAuthenticator::new(
			cfg.auth_secret.clone(),
			Arc::clone(&collab.verifier),
			Arc::clone(&collab.users),
			Arc::clone(&collab.cache),
			Arc::clone(&collab.clock),
		);

		let connections = Arc::new(ConnectionRegistry::new(cfg.connections.clone(), Arc::clone(&collab.clock)));

		let rooms = Arc::new(RoomDirectory::new(
			cfg.rooms.clone(),
			Arc::clone(&collab.rooms),
			Arc::clone(&collab.messages),
			resolver.clone(),
			broadcaster.clone(),
			Arc::clone(&bus_router),
			hub.clone(),
			Arc::clone(&connections),
			Arc::clone(&collab.cache),
			Arc::clone(&collab.clock),
		));

		let history = Arc::new(HistoryLoader::new(
			cfg.history.clone(),
			Arc::clone(&collab.messages),
			Arc::clone(&collab.rooms),
			resolver.clone(),
			Arc::clone(&collab.cache),
			Arc::clone(&collab.clock),
		));

		let rate = Arc::new(RateLimiter::new(
			cfg.rate.clone(),
			Arc::clone(&collab.clock),
			Arc::clone(&collab.cache),
		));

		let ai = Arc::new(AiStreamCoordinator::new(
			cfg.ai.clone(),
			Arc::clone(&collab.generator),
			Arc::clone(&collab.messages),
			resolver.clone(),
			broadcaster.clone(),
			Arc::clone(&collab.clock),
		));

		let ingest = Arc::new(MessageIngest::new(
			cfg.ingest.clone(),
			Arc::clone(&rate),
			Arc::clone(&collab.messages),
			resolver.clone(),
			broadcaster.clone(),
			Arc::clone(&rooms),
			Arc::clone(&history),
			Arc::clone(&ai),
			Arc::clone(&connections),
			Arc::clone(&collab.verifier),
			Arc::clone(&collab.clock),
		));

		let receipts = Arc::new(ReceiptProcessor::new(
			Arc::clone(&collab.messages),
			broadcaster.clone(),
			Arc::clone(&collab.clock),
		));

		info!(instance_id = %cfg.instance_id, "realtime core assembled");

		Arc::new(Self {
			auth,
			connections,
			hub,
			broadcaster,
			bus_router,
			rooms,
			history,
			rate,
			ai,
			ingest,
			receipts,
			resolver,
			clock: collab.clock,
		})
	}

	/// Release cross-instance subscriptions; part of shutdown.
	pub async fn shutdown(&self) {
		self.bus_router.shutdown().await;
	}
}
