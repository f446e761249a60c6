#![forbid(unsafe_code)]

//! Durable document store over sqlx (SQLite or Postgres, chosen by URL).
//!
//! Records are stored as canonical JSON documents with the columns the
//! core queries on (room, timestamp, deleted) denormalised for indexing.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use huddle_domain::{FileId, FileRef, Message, MessageId, Room, RoomId, User, UserId};

use crate::{FileRepo, MessageRepo, RoomRepo, UserRepo};

#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	async fn fetch_doc(&self, table: &'static str, id: &str) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(&format!("SELECT doc FROM {table} WHERE id = ?"))
					.bind(id)
					.fetch_optional(pool)
					.await
					.with_context(|| format!("select {table} doc (sqlite)"))?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(&format!("SELECT doc FROM {table} WHERE id = $1"))
					.bind(id)
					.fetch_optional(pool)
					.await
					.with_context(|| format!("select {table} doc (postgres)"))?
			}
		};
		Ok(row.map(|(doc,)| doc))
	}

	async fn store_message_doc(&self, message: &Message) -> anyhow::Result<()> {
		let doc = serde_json::to_string(message).context("encode message doc")?;
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room, timestamp, deleted, doc) VALUES (?, ?, ?, ?, ?) \
					ON CONFLICT(id) DO UPDATE SET deleted = excluded.deleted, doc = excluded.doc",
				)
				.bind(message.id.as_str())
				.bind(message.room.as_str())
				.bind(message.timestamp)
				.bind(message.deleted)
				.bind(doc)
				.execute(pool)
				.await
				.context("upsert message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room, timestamp, deleted, doc) VALUES ($1, $2, $3, $4, $5) \
					ON CONFLICT (id) DO UPDATE SET deleted = EXCLUDED.deleted, doc = EXCLUDED.doc",
				)
				.bind(message.id.as_str())
				.bind(message.room.as_str())
				.bind(message.timestamp)
				.bind(message.deleted)
				.bind(doc)
				.execute(pool)
				.await
				.context("upsert message (postgres)")?;
			}
		}
		Ok(())
	}

	/// Read-modify-write of one message document.
	async fn update_message<F>(&self, id: &MessageId, mutate: F) -> anyhow::Result<Option<Message>>
	where
		F: FnOnce(&mut Message) -> bool,
	{
		let Some(doc) = self.fetch_doc("messages", id.as_str()).await? else {
			return Ok(None);
		};
		let mut message: Message = serde_json::from_str(&doc).context("decode message doc")?;
		if mutate(&mut message) {
			self.store_message_doc(&message).await?;
		}
		Ok(Some(message))
	}
}

fn decode_doc<T: serde::de::DeserializeOwned>(doc: &str, what: &'static str) -> anyhow::Result<T> {
	serde_json::from_str(doc).with_context(|| format!("decode {what} doc"))
}

#[async_trait]
impl MessageRepo for SqlStore {
	async fn create(&self, message: &Message) -> anyhow::Result<()> {
		self.store_message_doc(message).await
	}

	async fn get(&self, id: &MessageId) -> anyhow::Result<Option<Message>> {
		match self.fetch_doc("messages", id.as_str()).await? {
			Some(doc) => Ok(Some(decode_doc(&doc, "message")?)),
			None => Ok(None),
		}
	}

	async fn find_before(&self, room: &RoomId, before: Option<i64>, limit: usize) -> anyhow::Result<Vec<Message>> {
		let rows: Vec<(String,)> = match (&self.backend, before) {
			(SqlBackend::Sqlite(pool), Some(ts)) => {
				sqlx::query_as(
					"SELECT doc FROM messages WHERE room = ? AND timestamp < ? AND deleted = FALSE \
					ORDER BY timestamp DESC, id DESC LIMIT ?",
				)
				.bind(room.as_str())
				.bind(ts)
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select history page (sqlite)")?
			}
			(SqlBackend::Sqlite(pool), None) => {
				sqlx::query_as(
					"SELECT doc FROM messages WHERE room = ? AND deleted = FALSE \
					ORDER BY timestamp DESC, id DESC LIMIT ?",
				)
				.bind(room.as_str())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select history page (sqlite)")?
			}
			(SqlBackend::Postgres(pool), Some(ts)) => {
				sqlx::query_as(
					"SELECT doc FROM messages WHERE room = $1 AND timestamp < $2 AND deleted = FALSE \
					ORDER BY timestamp DESC, id DESC LIMIT $3",
				)
				.bind(room.as_str())
				.bind(ts)
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select history page (postgres)")?
			}
			(SqlBackend::Postgres(pool), None) => {
				sqlx::query_as(
					"SELECT doc FROM messages WHERE room = $1 AND deleted = FALSE \
					ORDER BY timestamp DESC, id DESC LIMIT $2",
				)
				.bind(room.as_str())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select history page (postgres)")?
			}
		};

		let mut out = Vec::with_capacity(rows.len());
		for (doc,) in rows {
			out.push(decode_doc(&doc, "message")?);
		}
		Ok(out)
	}

	async fn mark_read(&self, user: &UserId, ids: &[MessageId], read_at: i64) -> anyhow::Result<()> {
		for id in ids {
			self.update_message(id, |m| m.mark_read(user, read_at)).await?;
		}
		Ok(())
	}

	async fn apply_reaction(
		&self,
		id: &MessageId,
		emoji: &str,
		user: &UserId,
		add: bool,
	) -> anyhow::Result<Option<Message>> {
		self.update_message(id, |m| {
			m.apply_reaction(emoji, user, add);
			true
		})
		.await
	}
}

#[async_trait]
impl RoomRepo for SqlStore {
	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<Room>> {
		match self.fetch_doc("rooms", id.as_str()).await? {
			Some(doc) => Ok(Some(decode_doc(&doc, "room")?)),
			None => Ok(None),
		}
	}

	async fn add_participant(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Vec<UserId>>> {
		self.update_room(room, |r| {
			if r.has_participant(user) {
				false
			} else {
				r.participants.push(user.clone());
				true
			}
		})
		.await
	}

	async fn remove_participant(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Vec<UserId>>> {
		self.update_room(room, |r| {
			let before = r.participants.len();
			r.participants.retain(|p| p != user);
			r.participants.len() != before
		})
		.await
	}
}

impl SqlStore {
	async fn update_room<F>(&self, id: &RoomId, mutate: F) -> anyhow::Result<Option<Vec<UserId>>>
	where
		F: FnOnce(&mut Room) -> bool,
	{
		let Some(doc) = self.fetch_doc("rooms", id.as_str()).await? else {
			return Ok(None);
		};
		let mut room: Room = decode_doc(&doc, "room")?;
		if mutate(&mut room) {
			let doc = serde_json::to_string(&room).context("encode room doc")?;
			match &self.backend {
				SqlBackend::Sqlite(pool) => {
					sqlx::query("UPDATE rooms SET doc = ? WHERE id = ?")
						.bind(doc)
						.bind(room.id.as_str())
						.execute(pool)
						.await
						.context("update room (sqlite)")?;
				}
				SqlBackend::Postgres(pool) => {
					sqlx::query("UPDATE rooms SET doc = $1 WHERE id = $2")
						.bind(doc)
						.bind(room.id.as_str())
						.execute(pool)
						.await
						.context("update room (postgres)")?;
				}
			}
		}
		Ok(Some(room.participants))
	}
}

#[async_trait]
impl UserRepo for SqlStore {
	async fn get(&self, id: &UserId) -> anyhow::Result<Option<User>> {
		match self.fetch_doc("users", id.as_str()).await? {
			Some(doc) => Ok(Some(decode_doc(&doc, "user")?)),
			None => Ok(None),
		}
	}

	async fn get_many(&self, ids: &[UserId]) -> anyhow::Result<Vec<User>> {
		let mut out = Vec::with_capacity(ids.len());
		for id in ids {
			if let Some(user) = UserRepo::get(self, id).await? {
				out.push(user);
			}
		}
		Ok(out)
	}
}

#[async_trait]
impl FileRepo for SqlStore {
	async fn get(&self, id: &FileId) -> anyhow::Result<Option<FileRef>> {
		match self.fetch_doc("files", id.as_str()).await? {
			Some(doc) => Ok(Some(decode_doc(&doc, "file")?)),
			None => Ok(None),
		}
	}
}
