#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown message kind: {0}")]
	UnknownKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! string_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty identifier.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Stable user identifier.
	UserId
);
string_id!(
	/// Stable room identifier.
	RoomId
);
string_id!(
	/// Auth-subsystem session identifier.
	SessionId
);
string_id!(
	/// Durable message identifier.
	MessageId
);
string_id!(
	/// Stored file identifier.
	FileId
);
string_id!(
	/// AI streaming session identifier.
	StreamId
);

impl MessageId {
	/// Mint a fresh message id.
	pub fn mint() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}
}

impl StreamId {
	/// Mint a fresh streaming-session id.
	pub fn mint() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}
}

/// Topic helpers for per-room bus subscriptions.
pub struct RoomTopic;

impl RoomTopic {
	/// Prefix for room topics.
	pub const PREFIX: &'static str = "room:";

	/// Format a room topic (e.g. `room:r1`).
	pub fn format(room: &RoomId) -> String {
		format!("{}{}", Self::PREFIX, room.as_str())
	}

	/// Parse a room topic of the form `room:<roomId>`.
	pub fn parse(s: &str) -> Result<RoomId, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let rest = s
			.strip_prefix(Self::PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat("expected room:<roomId>".into()))?;
		RoomId::new(rest.to_string())
	}
}

/// Message kinds carried on the wire as `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
	Text,
	File,
	System,
	Ai,
}

impl MessageKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::File => "file",
			MessageKind::System => "system",
			MessageKind::Ai => "ai",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"text" => Ok(MessageKind::Text),
			"file" => Ok(MessageKind::File),
			"system" => Ok(MessageKind::System),
			"ai" => Ok(MessageKind::Ai),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Client presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
	Online,
	Away,
	Busy,
	Offline,
}

/// User record. Read-only to the realtime core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	#[serde(rename = "_id")]
	pub id: UserId,
	pub name: String,
	pub email: String,
	#[serde(rename = "profileImage", skip_serializing_if = "Option::is_none")]
	pub profile_image: Option<String>,
}

/// Room record. The core mutates only `participants`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	#[serde(rename = "_id")]
	pub id: RoomId,
	pub name: String,
	/// Never leaves the backend; rooms are not client-facing documents.
	#[serde(default)]
	pub password_hash: Option<String>,
	pub creator: UserId,
	pub participants: Vec<UserId>,
	#[serde(rename = "createdAt")]
	pub created_at: i64,
}

impl Room {
	pub fn has_participant(&self, user: &UserId) -> bool {
		self.participants.iter().any(|p| p == user)
	}
}

/// Stored file reference attached to `file`-kind messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
	#[serde(rename = "_id")]
	pub id: FileId,
	pub filename: String,
	pub originalname: String,
	pub mimetype: String,
	pub size: u64,
}

/// Read receipt entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reader {
	#[serde(rename = "userId")]
	pub user_id: UserId,
	#[serde(rename = "readAt")]
	pub read_at: i64,
}

/// Durable chat message. Immutable except `readers`, `reactions`, `deleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	#[serde(rename = "_id")]
	pub id: MessageId,
	pub room: RoomId,
	/// `None` for system and AI messages.
	pub sender: Option<UserId>,
	pub content: String,
	#[serde(rename = "type")]
	pub kind: MessageKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file: Option<FileId>,
	#[serde(rename = "aiType", skip_serializing_if = "Option::is_none")]
	pub ai_model: Option<String>,
	pub timestamp: i64,
	#[serde(default)]
	pub readers: Vec<Reader>,
	/// emoji -> user ids, kept sorted for stable wire output.
	#[serde(default)]
	pub reactions: BTreeMap<String, Vec<UserId>>,
	#[serde(default)]
	pub deleted: bool,
}

impl Message {
	/// New message with empty receipts/reactions.
	pub fn new(room: RoomId, sender: Option<UserId>, content: impl Into<String>, kind: MessageKind, timestamp: i64) -> Self {
		Self {
			id: MessageId::mint(),
			room,
			sender,
			content: content.into(),
			kind,
			file: None,
			ai_model: None,
			timestamp,
			readers: Vec::new(),
			reactions: BTreeMap::new(),
			deleted: false,
		}
	}

	/// Add a read receipt unless the user already has one.
	///
	/// Returns whether the readers set changed.
	pub fn mark_read(&mut self, user: &UserId, read_at: i64) -> bool {
		if self.readers.iter().any(|r| &r.user_id == user) {
			return false;
		}
		self.readers.push(Reader {
			user_id: user.clone(),
			read_at,
		});
		true
	}

	/// Apply a reaction op. Last writer wins per `(emoji, user)`.
	pub fn apply_reaction(&mut self, emoji: &str, user: &UserId, add: bool) {
		if add {
			let entry = self.reactions.entry(emoji.to_string()).or_default();
			if !entry.iter().any(|u| u == user) {
				entry.push(user.clone());
			}
		} else if let Some(entry) = self.reactions.get_mut(emoji) {
			entry.retain(|u| u != user);
			if entry.is_empty() {
				self.reactions.remove(emoji);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_reject_empty() {
		assert_eq!(UserId::new("").unwrap_err(), ParseIdError::Empty);
		assert_eq!(RoomId::new("   ").unwrap_err(), ParseIdError::Empty);
		assert!("".parse::<SessionId>().is_err());
	}

	#[test]
	fn room_topic_roundtrip() {
		let room = RoomId::new("general").unwrap();
		let topic = RoomTopic::format(&room);
		assert_eq!(topic, "room:general");
		assert_eq!(RoomTopic::parse(&topic).unwrap(), room);
		assert!(RoomTopic::parse("rooms:general").is_err());
	}

	#[test]
	fn message_kind_parse_and_display() {
		assert_eq!("text".parse::<MessageKind>().unwrap(), MessageKind::Text);
		assert_eq!("AI".parse::<MessageKind>().unwrap(), MessageKind::Ai);
		assert_eq!(MessageKind::System.to_string(), "system");
		assert!("voice".parse::<MessageKind>().is_err());
	}

	#[test]
	fn mark_read_is_idempotent() {
		let room = RoomId::new("r1").unwrap();
		let user = UserId::new("u1").unwrap();
		let mut msg = Message::new(room, None, "hi", MessageKind::System, 1);

		assert!(msg.mark_read(&user, 10));
		assert!(!msg.mark_read(&user, 20));
		assert_eq!(msg.readers.len(), 1);
		assert_eq!(msg.readers[0].read_at, 10);
	}

	#[test]
	fn reaction_add_then_remove_clears_user() {
		let room = RoomId::new("r1").unwrap();
		let user = UserId::new("u1").unwrap();
		let mut msg = Message::new(room, Some(user.clone()), "hi", MessageKind::Text, 1);

		msg.apply_reaction("👍", &user, true);
		msg.apply_reaction("👍", &user, true);
		assert_eq!(msg.reactions.get("👍").map(Vec::len), Some(1));

		msg.apply_reaction("👍", &user, false);
		assert!(!msg.reactions.contains_key("👍"));

		msg.apply_reaction("👍", &user, false);
		msg.apply_reaction("👍", &user, true);
		assert_eq!(msg.reactions.get("👍").map(Vec::len), Some(1));
	}

	#[test]
	fn message_wire_shape() {
		let room = RoomId::new("r1").unwrap();
		let user = UserId::new("u1").unwrap();
		let mut msg = Message::new(room, Some(user), "hello", MessageKind::Text, 42);
		msg.ai_model = None;

		let v = serde_json::to_value(&msg).unwrap();
		assert!(v.get("_id").is_some());
		assert_eq!(v["type"], "text");
		assert_eq!(v["timestamp"], 42);
		assert!(v.get("aiType").is_none());
		assert!(v.get("file").is_none());
	}
}
