#![forbid(unsafe_code)]

use std::sync::Arc;

use huddle_domain::{FileId, Message, MessageId, MessageKind, RoomId, SessionId, User};
use huddle_protocol::ServerEvent;
use huddle_store::{AuthVerifier, Clock, MessageRepo};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::server::ai::AiStreamCoordinator;
use crate::server::bus::RoomBroadcaster;
use crate::server::history::HistoryLoader;
use crate::server::payload::PayloadResolver;
use crate::server::rate_limit::RateLimiter;
use crate::server::rooms::RoomDirectory;
use crate::server::sessions::ConnectionRegistry;

#[derive(Debug, Clone)]
pub struct IngestConfig {
	/// Model tags recognised in `@<model>` mentions.
	pub ai_models: Vec<String>,
}

impl Default for IngestConfig {
	fn default() -> Self {
		Self {
			ai_models: vec!["wayneAI".to_string(), "consultingAI".to_string()],
		}
	}
}

#[derive(Debug, Error)]
pub enum SendError {
	#[error("not a participant of this room")]
	Unauthorized,
	#[error("rate limit exceeded")]
	RateLimited,
	#[error("{0}")]
	InvalidInput(&'static str),
	#[error("message could not be stored")]
	PersistFailed,
}

impl SendError {
	pub fn code(&self) -> &'static str {
		match self {
			Self::Unauthorized => "ACCESS_DENIED",
			Self::RateLimited => "RATE_LIMITED",
			Self::InvalidInput(_) => "MESSAGE_ERROR",
			Self::PersistFailed => "MESSAGE_ERROR",
		}
	}
}

/// A detected AI mention: the model tag plus the query with the mention
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
	pub model: String,
	pub query: String,
}

/// Find `@<model>` mentions for the configured model set.
///
/// A mention only counts at a token boundary, so `@wayneAI2` does not
/// trigger `wayneAI`. Each model fires at most once per message.
pub fn detect_mentions(content: &str, models: &[String]) -> Vec<Mention> {
	let mut out = Vec::new();

	for model in models {
		let needle = format!("@{model}");
		let mut found = false;

		let mut start = 0;
		while let Some(pos) = content[start..].find(&needle) {
			let at = start + pos;
			let end = at + needle.len();
			let boundary = content[end..].chars().next().is_none_or(|c| !c.is_alphanumeric());
			if boundary {
				found = true;
				break;
			}
			start = end;
		}

		if found {
			let query = content.replace(&needle, " ");
			let query = query.split_whitespace().collect::<Vec<_>>().join(" ");
			out.push(Mention {
				model: model.clone(),
				query,
			});
		}
	}

	out
}

/// Message ingest & fan-out.
pub struct MessageIngest {
	cfg: IngestConfig,
	rate: Arc<RateLimiter>,
	messages: Arc<dyn MessageRepo>,
	resolver: PayloadResolver,
	broadcaster: RoomBroadcaster,
	rooms: Arc<RoomDirectory>,
	history: Arc<HistoryLoader>,
	ai: Arc<AiStreamCoordinator>,
	connections: Arc<ConnectionRegistry>,
	verifier: Arc<dyn AuthVerifier>,
	clock: Arc<dyn Clock>,
}

impl MessageIngest {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		cfg: IngestConfig,
		rate: Arc<RateLimiter>,
		messages: Arc<dyn MessageRepo>,
		resolver: PayloadResolver,
		broadcaster: RoomBroadcaster,
		rooms: Arc<RoomDirectory>,
		history: Arc<HistoryLoader>,
		ai: Arc<AiStreamCoordinator>,
		connections: Arc<ConnectionRegistry>,
		verifier: Arc<dyn AuthVerifier>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			cfg,
			rate,
			messages,
			resolver,
			broadcaster,
			rooms,
			history,
			ai,
			connections,
			verifier,
			clock,
		}
	}

	/// Persist and fan out one inbound message.
	pub async fn send(
		&self,
		user: &User,
		session: &SessionId,
		room_id: &RoomId,
		content: String,
		kind: Option<MessageKind>,
		file: Option<FileId>,
	) -> Result<MessageId, SendError> {
		let content = content.trim().to_string();
		if content.is_empty() && file.is_none() {
			return Err(SendError::InvalidInput("message needs content or a file"));
		}
		if self.rooms.current_room(&user.id).as_ref() != Some(room_id) {
			return Err(SendError::Unauthorized);
		}

		if !self.rate.check(&user.id).await {
			debug!(user = %user.id, "send rate limited");
			return Err(SendError::RateLimited);
		}

		let mentions = detect_mentions(&content, &self.cfg.ai_models);

		// A file reference escalates the kind regardless of what the client
		// claimed.
		let kind = if file.is_some() {
			MessageKind::File
		} else {
			kind.unwrap_or(MessageKind::Text)
		};

		let mut message = Message::new(room_id.clone(), Some(user.id.clone()), content, kind, self.clock.now_ms());
		message.file = file;

		if let Err(e) = self.messages.create(&message).await {
			warn!(room = %room_id, user = %user.id, error = %e, "message persist failed");
			return Err(SendError::PersistFailed);
		}
		metrics::counter!("huddle_server_messages_total", "kind" => kind.as_str()).increment(1);

		let payload = self.resolver.resolve(&message).await;
		self.broadcaster
			.broadcast(room_id, &ServerEvent::Message { message: payload }, None)
			.await;

		// The newest history page changed; drop its cache entry.
		self.history.invalidate_latest(room_id).await;

		for mention in mentions {
			info!(room = %room_id, model = %mention.model, user = %user.id, "ai mention detected");
			self.ai
				.start_stream(room_id.clone(), user.id.clone(), mention.model, mention.query);
		}

		self.connections.touch(&user.id);
		let verifier = Arc::clone(&self.verifier);
		let touch_user = user.id.clone();
		let touch_session = session.clone();
		tokio::spawn(async move {
			if let Err(e) = verifier.touch_session(&touch_user, &touch_session).await {
				debug!(user = %touch_user, error = %e, "session touch failed");
			}
		});

		Ok(message.id)
	}
}
