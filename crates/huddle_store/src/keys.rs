#![forbid(unsafe_code)]

//! Cache key conventions shared by the core and its tests.

use huddle_domain::{RoomId, UserId};

/// `messages:<roomId>:<before|latest>:<limit>`: cached history page.
pub fn history(room: &RoomId, before: Option<i64>, limit: usize) -> String {
	match before {
		Some(ts) => format!("messages:{}:{}:{}", room.as_str(), ts, limit),
		None => format!("messages:{}:latest:{}", room.as_str(), limit),
	}
}

/// `room_access:<roomId>:<userId>`: positive participant check.
pub fn room_access(room: &RoomId, user: &UserId) -> String {
	format!("room_access:{}:{}", room.as_str(), user.as_str())
}

/// `user:<userId>`: resolved user record.
pub fn user(user: &UserId) -> String {
	format!("user:{}", user.as_str())
}

/// `<userId>:<windowIndex>`: rate bucket counter.
pub fn rate_bucket(user: &UserId, window: i64) -> String {
	format!("{}:{}", user.as_str(), window)
}
