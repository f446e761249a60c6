#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::{Message, MessageKind, RoomId, StreamId, UserId};
use huddle_protocol::ServerEvent;
use huddle_store::{AiEvent, AiGenerator, Clock, MessageRepo};
use tracing::{debug, info, warn};

use crate::server::bus::RoomBroadcaster;
use crate::server::payload::PayloadResolver;
use crate::server::registry::BoundedRegistry;

#[derive(Debug, Clone)]
pub struct AiConfig {
	/// Bounded registry capacity for concurrent streams.
	pub stream_capacity: usize,
	/// Idle window after which the janitor drops a stream silently.
	pub idle_expiry: Duration,
}

impl Default for AiConfig {
	fn default() -> Self {
		Self {
			stream_capacity: 500,
			idle_expiry: Duration::from_secs(30 * 60),
		}
	}
}

/// In-memory state of one AI response being produced.
#[derive(Clone)]
pub struct StreamingSession {
	pub room: RoomId,
	pub initiator: UserId,
	pub model: String,
	pub content: String,
	pub last_activity_ms: i64,
}

/// AI streaming coordinator: one task per mention, relaying chunks to
/// the room and finalising into a stored `ai` message.
pub struct AiStreamCoordinator {
	cfg: AiConfig,
	generator: Arc<dyn AiGenerator>,
	messages: Arc<dyn MessageRepo>,
	resolver: PayloadResolver,
	broadcaster: RoomBroadcaster,
	clock: Arc<dyn Clock>,
	streams: BoundedRegistry<StreamId, StreamingSession>,
}

impl AiStreamCoordinator {
	pub fn new(
		cfg: AiConfig,
		generator: Arc<dyn AiGenerator>,
		messages: Arc<dyn MessageRepo>,
		resolver: PayloadResolver,
		broadcaster: RoomBroadcaster,
		clock: Arc<dyn Clock>,
	) -> Self {
		let streams = BoundedRegistry::new("ai_streams", cfg.stream_capacity);
		Self {
			cfg,
			generator,
			messages,
			resolver,
			broadcaster,
			clock,
			streams,
		}
	}

	/// Begin a streaming session for one detected mention.
	///
	/// The initiating user's disconnect does not cancel the stream; output
	/// is room-scoped and the idle sweep handles abandonment.
	pub fn start_stream(self: &Arc<Self>, room: RoomId, initiator: UserId, model: String, query: String) -> StreamId {
		let sid = StreamId::mint();
		let now = self.clock.now_ms();

		self.streams.insert(
			sid.clone(),
			StreamingSession {
				room: room.clone(),
				initiator: initiator.clone(),
				model: model.clone(),
				content: String::new(),
				last_activity_ms: now,
			},
		);
		metrics::counter!("huddle_server_ai_streams_total").increment(1);
		info!(sid = %sid, room = %room, model = %model, user = %initiator, "ai stream started");

		let coordinator = Arc::clone(self);
		let task_sid = sid.clone();
		tokio::spawn(async move {
			coordinator.run(task_sid, room, model, query).await;
		});

		sid
	}

	async fn run(self: Arc<Self>, sid: StreamId, room: RoomId, model: String, query: String) {
		self.broadcaster
			.broadcast(
				&room,
				&ServerEvent::AiMessageStart {
					sid: sid.as_str().to_string(),
					model: model.clone(),
					timestamp: self.clock.now_ms(),
				},
				None,
			)
			.await;

		let mut stream = match self.generator.stream(&query, &model).await {
			Ok(stream) => stream,
			Err(e) => {
				warn!(sid = %sid, model = %model, error = %e, "generator refused stream");
				self.fail(&sid, &room).await;
				return;
			}
		};

		let mut content = String::new();

		loop {
			match stream.recv().await {
				AiEvent::Chunk(chunk) => {
					if !self.streams.contains(&sid) {
						// Expired by the janitor; stop without client events.
						debug!(sid = %sid, "stream expired mid-generation; dropping output");
						return;
					}

					content.push_str(&chunk);
					let now = self.clock.now_ms();
					let full = content.clone();
					self.streams.update(&sid, |s| {
						s.content = full;
						s.last_activity_ms = now;
					});

					self.broadcaster
						.broadcast(
							&room,
							&ServerEvent::AiMessageChunk {
								sid: sid.as_str().to_string(),
								chunk,
								full_content: content.clone(),
							},
							None,
						)
						.await;
				}

				AiEvent::Complete => {
					let mut message =
						Message::new(room.clone(), None, content, MessageKind::Ai, self.clock.now_ms());
					message.ai_model = Some(model.clone());

					match self.messages.create(&message).await {
						Ok(()) => {
							let payload = self.resolver.resolve(&message).await;
							self.broadcaster
								.broadcast(
									&room,
									&ServerEvent::AiMessageComplete {
										sid: sid.as_str().to_string(),
										message: payload,
									},
									None,
								)
								.await;
							metrics::counter!("huddle_server_ai_streams_completed_total").increment(1);
							info!(sid = %sid, model = %model, "ai stream completed");
						}
						Err(e) => {
							warn!(sid = %sid, error = %e, "ai message persist failed");
							self.fail(&sid, &room).await;
							return;
						}
					}

					self.streams.remove(&sid);
					return;
				}

				AiEvent::Error(e) => {
					warn!(sid = %sid, model = %model, error = %e, "ai stream failed");
					self.fail(&sid, &room).await;
					return;
				}
			}
		}
	}

	async fn fail(&self, sid: &StreamId, room: &RoomId) {
		metrics::counter!("huddle_server_ai_streams_failed_total").increment(1);
		self.broadcaster
			.broadcast(
				room,
				&ServerEvent::AiMessageError {
					sid: sid.as_str().to_string(),
				},
				None,
			)
			.await;
		self.streams.remove(sid);
	}

	/// Drop streams idle longer than the configured expiry, silently.
	pub fn sweep_idle(&self) -> usize {
		let cutoff = self.clock.now_ms() - self.cfg.idle_expiry.as_millis() as i64;
		let dropped = self.streams.retain(|_, s| s.last_activity_ms >= cutoff);
		if dropped > 0 {
			debug!(dropped, "expired idle ai streams");
		}
		dropped
	}

	pub fn active_streams(&self) -> usize {
		self.streams.len()
	}
}
