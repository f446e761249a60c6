#![forbid(unsafe_code)]

use std::sync::Arc;

use huddle_domain::{MessageId, RoomId, UserId};
use huddle_protocol::ServerEvent;
use huddle_store::{Clock, MessageRepo};
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::bus::RoomBroadcaster;
use crate::server::sessions::ConnId;

#[derive(Debug, Error)]
pub enum ReactError {
	#[error("message not found")]
	NotFound,
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl ReactError {
	pub fn code(&self) -> &'static str {
		match self {
			Self::NotFound => "MESSAGE_ERROR",
			Self::Internal(_) => "INTERNAL_ERROR",
		}
	}
}

/// Read-receipt and reaction processor.
pub struct ReceiptProcessor {
	messages: Arc<dyn MessageRepo>,
	broadcaster: RoomBroadcaster,
	clock: Arc<dyn Clock>,
}

impl ReceiptProcessor {
	pub fn new(messages: Arc<dyn MessageRepo>, broadcaster: RoomBroadcaster, clock: Arc<dyn Clock>) -> Self {
		Self {
			messages,
			broadcaster,
			clock,
		}
	}

	/// Bulk read marking. Silent towards the caller; failures are
	/// swallowed after logging.
	pub async fn mark_read(&self, caller: ConnId, user: &UserId, room: &RoomId, message_ids: Vec<MessageId>) {
		if message_ids.is_empty() {
			return;
		}

		if let Err(e) = self.messages.mark_read(user, &message_ids, self.clock.now_ms()).await {
			debug!(user = %user, error = %e, "read marking failed");
			return;
		}
		metrics::counter!("huddle_server_reads_marked_total").increment(message_ids.len() as u64);

		self.broadcaster
			.broadcast(
				room,
				&ServerEvent::MessagesRead {
					user_id: user.clone(),
					message_ids,
				},
				Some(caller),
			)
			.await;
	}

	/// Apply one reaction op and broadcast the updated reactions map.
	pub async fn react(
		&self,
		user: &UserId,
		message_id: &MessageId,
		emoji: &str,
		add: bool,
	) -> Result<(), ReactError> {
		let updated = self
			.messages
			.apply_reaction(message_id, emoji, user, add)
			.await
			.map_err(|e| {
				warn!(message = %message_id, error = %e, "reaction update failed");
				ReactError::Internal(e)
			})?
			.ok_or(ReactError::NotFound)?;

		metrics::counter!("huddle_server_reactions_total").increment(1);

		self.broadcaster
			.broadcast(
				&updated.room,
				&ServerEvent::MessageReactionUpdate {
					message_id: message_id.clone(),
					reactions: updated.reactions,
				},
				None,
			)
			.await;

		Ok(())
	}
}
