#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use huddle_domain::{FileId, FileRef, MessageId, MessageKind, Reader, RoomId, SessionId, User, UserId, UserStatus};
use serde::{Deserialize, Serialize};

/// Reaction operation carried as `type` on `messageReaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionOp {
	Add,
	Remove,
}

/// Fully-resolved message document as it travels to clients.
///
/// `sender` and `file` are resolved references; `huddle_domain::Message`
/// stores the bare ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
	#[serde(rename = "_id")]
	pub id: MessageId,
	pub room: RoomId,
	pub sender: Option<User>,
	pub content: String,
	#[serde(rename = "type")]
	pub kind: MessageKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file: Option<FileRef>,
	#[serde(rename = "aiType", default, skip_serializing_if = "Option::is_none")]
	pub ai_model: Option<String>,
	pub timestamp: i64,
	#[serde(default)]
	pub readers: Vec<Reader>,
	#[serde(default)]
	pub reactions: BTreeMap<String, Vec<UserId>>,
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
	/// Opening handshake; must be the first frame on a connection.
	#[serde(rename = "auth")]
	Auth {
		token: String,
		#[serde(rename = "sessionId")]
		session_id: SessionId,
		/// Client self-description, echoed in `duplicate_login` warnings.
		#[serde(rename = "deviceInfo", default, skip_serializing_if = "Option::is_none")]
		device_info: Option<String>,
	},

	#[serde(rename = "joinRoom")]
	JoinRoom {
		#[serde(rename = "roomId")]
		room_id: RoomId,
	},

	#[serde(rename = "chatMessage")]
	ChatMessage {
		room: RoomId,
		content: String,
		#[serde(rename = "type", default)]
		kind: Option<MessageKind>,
		#[serde(rename = "fileData", default)]
		file_data: Option<FileId>,
	},

	#[serde(rename = "fetchPreviousMessages")]
	FetchPreviousMessages {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		#[serde(default)]
		before: Option<i64>,
	},

	#[serde(rename = "markMessagesAsRead")]
	MarkMessagesAsRead {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		#[serde(rename = "messageIds")]
		message_ids: Vec<MessageId>,
	},

	#[serde(rename = "messageReaction")]
	MessageReaction {
		#[serde(rename = "messageId")]
		message_id: MessageId,
		reaction: String,
		#[serde(rename = "type")]
		op: ReactionOp,
	},

	#[serde(rename = "typing")]
	Typing {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		#[serde(rename = "isTyping")]
		is_typing: bool,
	},

	#[serde(rename = "updateUserStatus")]
	UpdateUserStatus {
		status: UserStatus,
	},

	/// Server-initiated termination of another session of the same user.
	#[serde(rename = "force_login")]
	ForceLogin {
		token: String,
	},

	#[serde(rename = "ping")]
	Ping {
		#[serde(rename = "clientTime", default)]
		client_time: Option<i64>,
	},
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
	#[serde(rename = "authSuccess")]
	AuthSuccess {
		user: User,
	},

	#[serde(rename = "message")]
	Message {
		message: MessagePayload,
	},

	#[serde(rename = "messageLoadStart")]
	MessageLoadStart {
		#[serde(rename = "roomId")]
		room_id: RoomId,
	},

	#[serde(rename = "previousMessagesLoaded")]
	PreviousMessagesLoaded {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		messages: Vec<MessagePayload>,
		#[serde(rename = "hasMore")]
		has_more: bool,
		#[serde(rename = "oldestTimestamp", default, skip_serializing_if = "Option::is_none")]
		oldest_timestamp: Option<i64>,
	},

	#[serde(rename = "joinRoomSuccess")]
	JoinRoomSuccess {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		#[serde(rename = "roomName")]
		room_name: String,
		participants: Vec<User>,
		messages: Vec<MessagePayload>,
		#[serde(rename = "hasMore")]
		has_more: bool,
		#[serde(rename = "oldestTimestamp", default, skip_serializing_if = "Option::is_none")]
		oldest_timestamp: Option<i64>,
	},

	#[serde(rename = "joinRoomError")]
	JoinRoomError {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		message: String,
	},

	#[serde(rename = "participantsUpdate")]
	ParticipantsUpdate {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		participants: Vec<User>,
	},

	#[serde(rename = "userJoined")]
	UserJoined {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		user: User,
	},

	#[serde(rename = "userLeft")]
	UserLeft {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		#[serde(rename = "userId")]
		user_id: UserId,
	},

	#[serde(rename = "messagesRead")]
	MessagesRead {
		#[serde(rename = "userId")]
		user_id: UserId,
		#[serde(rename = "messageIds")]
		message_ids: Vec<MessageId>,
	},

	#[serde(rename = "messageReactionUpdate")]
	MessageReactionUpdate {
		#[serde(rename = "messageId")]
		message_id: MessageId,
		reactions: BTreeMap<String, Vec<UserId>>,
	},

	#[serde(rename = "userTyping")]
	UserTyping {
		#[serde(rename = "roomId")]
		room_id: RoomId,
		#[serde(rename = "userId")]
		user_id: UserId,
		#[serde(rename = "isTyping")]
		is_typing: bool,
	},

	#[serde(rename = "userStatusUpdate")]
	UserStatusUpdate {
		#[serde(rename = "userId")]
		user_id: UserId,
		status: UserStatus,
	},

	#[serde(rename = "duplicate_login")]
	DuplicateLogin {
		#[serde(rename = "deviceInfo")]
		device_info: String,
		#[serde(rename = "ipAddress")]
		ip_address: String,
		timestamp: i64,
	},

	#[serde(rename = "session_ended")]
	SessionEnded {
		reason: String,
	},

	#[serde(rename = "aiMessageStart")]
	AiMessageStart {
		sid: String,
		model: String,
		timestamp: i64,
	},

	#[serde(rename = "aiMessageChunk")]
	AiMessageChunk {
		sid: String,
		chunk: String,
		#[serde(rename = "fullContent")]
		full_content: String,
	},

	#[serde(rename = "aiMessageComplete")]
	AiMessageComplete {
		sid: String,
		message: MessagePayload,
	},

	#[serde(rename = "aiMessageError")]
	AiMessageError {
		sid: String,
	},

	#[serde(rename = "pong")]
	Pong {
		#[serde(rename = "serverTime")]
		server_time: i64,
	},

	#[serde(rename = "error")]
	Error {
		code: String,
		message: String,
	},
}

impl ServerEvent {
	/// Wire name of the event; doubles as the bus envelope `kind`.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::AuthSuccess { .. } => "authSuccess",
			Self::Message { .. } => "message",
			Self::MessageLoadStart { .. } => "messageLoadStart",
			Self::PreviousMessagesLoaded { .. } => "previousMessagesLoaded",
			Self::JoinRoomSuccess { .. } => "joinRoomSuccess",
			Self::JoinRoomError { .. } => "joinRoomError",
			Self::ParticipantsUpdate { .. } => "participantsUpdate",
			Self::UserJoined { .. } => "userJoined",
			Self::UserLeft { .. } => "userLeft",
			Self::MessagesRead { .. } => "messagesRead",
			Self::MessageReactionUpdate { .. } => "messageReactionUpdate",
			Self::UserTyping { .. } => "userTyping",
			Self::UserStatusUpdate { .. } => "userStatusUpdate",
			Self::DuplicateLogin { .. } => "duplicate_login",
			Self::SessionEnded { .. } => "session_ended",
			Self::AiMessageStart { .. } => "aiMessageStart",
			Self::AiMessageChunk { .. } => "aiMessageChunk",
			Self::AiMessageComplete { .. } => "aiMessageComplete",
			Self::AiMessageError { .. } => "aiMessageError",
			Self::Pong { .. } => "pong",
			Self::Error { .. } => "error",
		}
	}
}

/// Cross-instance bus envelope published on `room:<roomId>` topics.
///
/// `origin` carries the publishing instance id so subscribers can drop
/// events they already delivered locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
	pub kind: String,
	pub payload: serde_json::Value,
	pub origin: String,
}

impl BusEnvelope {
	/// Wrap a server event for publication.
	pub fn new(origin: impl Into<String>, event: &ServerEvent) -> Result<Self, serde_json::Error> {
		Ok(Self {
			kind: event.kind().to_string(),
			payload: serde_json::to_value(event)?,
			origin: origin.into(),
		})
	}

	/// Recover the typed event; `None` when the payload does not parse
	/// (e.g. an envelope from a newer instance revision).
	pub fn into_event(self) -> Option<ServerEvent> {
		serde_json::from_value(self.payload).ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_event_wire_names() {
		let ev: ClientEvent = serde_json::from_str(r#"{"event":"joinRoom","roomId":"r1"}"#).unwrap();
		assert_eq!(
			ev,
			ClientEvent::JoinRoom {
				room_id: RoomId::new("r1").unwrap()
			}
		);

		let ev: ClientEvent =
			serde_json::from_str(r#"{"event":"chatMessage","room":"r1","content":"hi"}"#).unwrap();
		match ev {
			ClientEvent::ChatMessage { room, content, kind, file_data } => {
				assert_eq!(room.as_str(), "r1");
				assert_eq!(content, "hi");
				assert!(kind.is_none());
				assert!(file_data.is_none());
			}
			other => panic!("unexpected event: {other:?}"),
		}

		let ev: ClientEvent =
			serde_json::from_str(r#"{"event":"messageReaction","messageId":"m1","reaction":"👍","type":"add"}"#).unwrap();
		match ev {
			ClientEvent::MessageReaction { op, .. } => assert_eq!(op, ReactionOp::Add),
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[test]
	fn server_event_roundtrip_and_kind() {
		let ev = ServerEvent::SessionEnded {
			reason: "duplicate_login".to_string(),
		};
		assert_eq!(ev.kind(), "session_ended");

		let raw = serde_json::to_string(&ev).unwrap();
		assert!(raw.contains(r#""event":"session_ended""#));
		let back: ServerEvent = serde_json::from_str(&raw).unwrap();
		assert_eq!(back, ev);
	}

	#[test]
	fn bus_envelope_roundtrip() {
		let ev = ServerEvent::MessagesRead {
			user_id: UserId::new("u2").unwrap(),
			message_ids: vec![MessageId::new("m1").unwrap()],
		};

		let env = BusEnvelope::new("instance-a", &ev).unwrap();
		assert_eq!(env.kind, "messagesRead");
		assert_eq!(env.origin, "instance-a");
		assert_eq!(env.into_event().unwrap(), ev);
	}
}
