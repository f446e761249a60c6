#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::{Message, User, UserId};
use huddle_protocol::MessagePayload;
use huddle_store::{Cache, FileRepo, UserRepo, cache_get_json, cache_set_json, keys};
use tracing::debug;

/// Resolved-user cache TTL.
const USER_CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolves stored messages into wire payloads (sender and file refs
/// expanded). Resolution failures degrade to `None` fields; a message is
/// never withheld because a lookup failed.
#[derive(Clone)]
pub struct PayloadResolver {
	users: Arc<dyn UserRepo>,
	files: Arc<dyn FileRepo>,
	cache: Arc<dyn Cache>,
}

impl PayloadResolver {
	pub fn new(users: Arc<dyn UserRepo>, files: Arc<dyn FileRepo>, cache: Arc<dyn Cache>) -> Self {
		Self { users, files, cache }
	}

	pub async fn resolve(&self, message: &Message) -> MessagePayload {
		let sender = match &message.sender {
			Some(user_id) => self.resolve_user(user_id).await,
			None => None,
		};

		let file = match &message.file {
			Some(file_id) => match self.files.get(file_id).await {
				Ok(file) => file,
				Err(e) => {
					debug!(file = %file_id, error = %e, "file resolution failed");
					None
				}
			},
			None => None,
		};

		MessagePayload {
			id: message.id.clone(),
			room: message.room.clone(),
			sender,
			content: message.content.clone(),
			kind: message.kind,
			file,
			ai_model: message.ai_model.clone(),
			timestamp: message.timestamp,
			readers: message.readers.clone(),
			reactions: message.reactions.clone(),
		}
	}

	pub async fn resolve_many(&self, messages: &[Message]) -> Vec<MessagePayload> {
		let mut out = Vec::with_capacity(messages.len());
		for message in messages {
			out.push(self.resolve(message).await);
		}
		out
	}

	/// Resolve one user, preferring the short-TTL cache entry.
	pub async fn resolve_user(&self, user_id: &UserId) -> Option<User> {
		let key = keys::user(user_id);
		if let Some(user) = cache_get_json::<User>(self.cache.as_ref(), &key).await {
			return Some(user);
		}

		match self.users.get(user_id).await {
			Ok(Some(user)) => {
				cache_set_json(self.cache.as_ref(), &key, &user, USER_CACHE_TTL).await;
				Some(user)
			}
			Ok(None) => None,
			Err(e) => {
				debug!(user = %user_id, error = %e, "user resolution failed");
				None
			}
		}
	}

	/// Resolve a participant list; unknown ids are skipped.
	pub async fn resolve_users(&self, ids: &[UserId]) -> Vec<User> {
		match self.users.get_many(ids).await {
			Ok(users) => users,
			Err(e) => {
				debug!(error = %e, "participant resolution failed");
				Vec::new()
			}
		}
	}
}
