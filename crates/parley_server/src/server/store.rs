#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, anyhow};
use parley_domain::{ChannelError, ConversationKey, Message, MessageBody, MessageId, ParticipantId};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// Errors from the durable message store.
///
/// Validation and authorization failures are separate variants so the
/// gateway can report them distinctly; `Backend` covers infrastructure
/// failures underneath.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("invalid conversation: {0}")]
	InvalidConversation(#[from] ChannelError),

	#[error("no message with id {0}")]
	NotFound(MessageId),

	#[error("message {0} was not received by the caller")]
	NotReceiver(MessageId),

	#[error("corrupt message row: {0}")]
	Corrupt(String),

	#[error("storage backend error: {0}")]
	Backend(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait MessageBackend: Send + Sync {
	async fn append(
		&self,
		sender: ParticipantId,
		receiver: ParticipantId,
		body: MessageBody,
		sent_at_unix_ms: i64,
	) -> Result<Message, StoreError>;

	async fn history(&self, key: ConversationKey) -> Result<Vec<Message>, StoreError>;

	async fn mark_read(&self, message_id: MessageId, reader: ParticipantId) -> Result<bool, StoreError>;

	async fn recent_unread_received(&self, receiver: ParticipantId, limit: usize) -> Result<Vec<Message>, StoreError>;
}

/// Process-local message rows, used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
	next_id: i64,
	rows: Vec<Message>,
}

impl MemoryMessageStore {
	fn append(
		&mut self,
		sender: ParticipantId,
		receiver: ParticipantId,
		body: MessageBody,
		sent_at_unix_ms: i64,
	) -> Message {
		self.next_id += 1;
		let msg = Message {
			id: MessageId(self.next_id),
			sender,
			receiver,
			body,
			sent_at_unix_ms,
			read: false,
		};
		self.rows.push(msg.clone());
		msg
	}

	fn history(&self, key: ConversationKey) -> Vec<Message> {
		let mut out: Vec<Message> = self
			.rows
			.iter()
			.filter(|m| key.includes(m.sender) && key.includes(m.receiver))
			.cloned()
			.collect();
		out.sort_by_key(|m| (m.sent_at_unix_ms, m.id));
		out
	}

	fn mark_read(&mut self, message_id: MessageId, reader: ParticipantId) -> Result<bool, StoreError> {
		let Some(row) = self.rows.iter_mut().find(|m| m.id == message_id) else {
			return Err(StoreError::NotFound(message_id));
		};
		if row.receiver != reader {
			return Err(StoreError::NotReceiver(message_id));
		}
		if row.read {
			return Ok(false);
		}
		row.read = true;
		Ok(true)
	}

	fn recent_unread_received(&self, receiver: ParticipantId, limit: usize) -> Vec<Message> {
		let mut out: Vec<Message> = self
			.rows
			.iter()
			.filter(|m| m.receiver == receiver && !m.read)
			.cloned()
			.collect();
		out.sort_by(|a, b| (b.sent_at_unix_ms, b.id).cmp(&(a.sent_at_unix_ms, a.id)));
		out.truncate(limit);
		out
	}
}

#[derive(Debug, Default)]
pub struct InMemoryMessageBackend {
	inner: Mutex<MemoryMessageStore>,
}

#[async_trait::async_trait]
impl MessageBackend for InMemoryMessageBackend {
	async fn append(
		&self,
		sender: ParticipantId,
		receiver: ParticipantId,
		body: MessageBody,
		sent_at_unix_ms: i64,
	) -> Result<Message, StoreError> {
		let mut guard = self.inner.lock().await;
		Ok(guard.append(sender, receiver, body, sent_at_unix_ms))
	}

	async fn history(&self, key: ConversationKey) -> Result<Vec<Message>, StoreError> {
		let guard = self.inner.lock().await;
		Ok(guard.history(key))
	}

	async fn mark_read(&self, message_id: MessageId, reader: ParticipantId) -> Result<bool, StoreError> {
		let mut guard = self.inner.lock().await;
		guard.mark_read(message_id, reader)
	}

	async fn recent_unread_received(&self, receiver: ParticipantId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let guard = self.inner.lock().await;
		Ok(guard.recent_unread_received(receiver, limit))
	}
}

/// Message and social rows in sqlite or postgres, selected by the database
/// URL scheme. One pool serves both the message store and the social
/// directory.
#[derive(Clone)]
pub struct SqlStore {
	pub(crate) backend: SqlBackend,
}

#[derive(Clone)]
pub(crate) enum SqlBackend {
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
}

fn row_to_message(
	id: i64,
	sender_id: i64,
	receiver_id: i64,
	text: Option<String>,
	attachment_ref: Option<String>,
	sent_at_unix_ms: i64,
	read: bool,
) -> Result<Message, StoreError> {
	let sender = ParticipantId::new(sender_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
	let receiver = ParticipantId::new(receiver_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
	let body = MessageBody::new(text, attachment_ref).map_err(|e| StoreError::Corrupt(e.to_string()))?;
	Ok(Message {
		id: MessageId(id),
		sender,
		receiver,
		body,
		sent_at_unix_ms,
		read,
	})
}

#[async_trait::async_trait]
impl MessageBackend for SqlStore {
	async fn append(
		&self,
		sender: ParticipantId,
		receiver: ParticipantId,
		body: MessageBody,
		sent_at_unix_ms: i64,
	) -> Result<Message, StoreError> {
		let id: i64 = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (sender_id, receiver_id, text, attachment_ref, sent_at_unix_ms, read_flag) \
					VALUES (?, ?, ?, ?, ?, 0) RETURNING id",
				)
				.bind(sender.get())
				.bind(receiver.get())
				.bind(body.text())
				.bind(body.attachment_ref())
				.bind(sent_at_unix_ms)
				.fetch_one(pool)
				.await
				.context("insert message (sqlite)")?;
				id
			}
			SqlBackend::Postgres(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (sender_id, receiver_id, text, attachment_ref, sent_at_unix_ms, read_flag) \
					VALUES ($1, $2, $3, $4, $5, FALSE) RETURNING id",
				)
				.bind(sender.get())
				.bind(receiver.get())
				.bind(body.text())
				.bind(body.attachment_ref())
				.bind(sent_at_unix_ms)
				.fetch_one(pool)
				.await
				.context("insert message (postgres)")?;
				id
			}
		};

		Ok(Message {
			id: MessageId(id),
			sender,
			receiver,
			body,
			sent_at_unix_ms,
			read: false,
		})
	}

	async fn history(&self, key: ConversationKey) -> Result<Vec<Message>, StoreError> {
		let (low, high) = key.participants();

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let rows = sqlx::query_as::<_, (i64, i64, i64, Option<String>, Option<String>, i64, i64)>(
					"SELECT id, sender_id, receiver_id, text, attachment_ref, sent_at_unix_ms, read_flag \
					FROM messages \
					WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?) \
					ORDER BY sent_at_unix_ms ASC, id ASC",
				)
				.bind(low.get())
				.bind(high.get())
				.bind(high.get())
				.bind(low.get())
				.fetch_all(pool)
				.await
				.context("select history (sqlite)")?;

				rows.into_iter()
					.map(|(id, s, r, text, att, at, read)| row_to_message(id, s, r, text, att, at, read != 0))
					.collect()
			}
			SqlBackend::Postgres(pool) => {
				let rows = sqlx::query_as::<_, (i64, i64, i64, Option<String>, Option<String>, i64, bool)>(
					"SELECT id, sender_id, receiver_id, text, attachment_ref, sent_at_unix_ms, read_flag \
					FROM messages \
					WHERE (sender_id = $1 AND receiver_id = $2) OR (sender_id = $3 AND receiver_id = $4) \
					ORDER BY sent_at_unix_ms ASC, id ASC",
				)
				.bind(low.get())
				.bind(high.get())
				.bind(high.get())
				.bind(low.get())
				.fetch_all(pool)
				.await
				.context("select history (postgres)")?;

				rows.into_iter()
					.map(|(id, s, r, text, att, at, read)| row_to_message(id, s, r, text, att, at, read))
					.collect()
			}
		}
	}

	async fn mark_read(&self, message_id: MessageId, reader: ParticipantId) -> Result<bool, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;

				let row: Option<(i64, i64)> = sqlx::query_as("SELECT receiver_id, read_flag FROM messages WHERE id = ?")
					.bind(message_id.0)
					.fetch_optional(&mut *tx)
					.await
					.context("select message (sqlite)")?;

				let Some((receiver_id, read_flag)) = row else {
					return Err(StoreError::NotFound(message_id));
				};
				if receiver_id != reader.get() {
					return Err(StoreError::NotReceiver(message_id));
				}
				if read_flag != 0 {
					return Ok(false);
				}

				sqlx::query("UPDATE messages SET read_flag = 1 WHERE id = ?")
					.bind(message_id.0)
					.execute(&mut *tx)
					.await
					.context("update read flag (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				Ok(true)
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;

				let row: Option<(i64, bool)> =
					sqlx::query_as("SELECT receiver_id, read_flag FROM messages WHERE id = $1 FOR UPDATE")
						.bind(message_id.0)
						.fetch_optional(&mut *tx)
						.await
						.context("select message (postgres)")?;

				let Some((receiver_id, read_flag)) = row else {
					return Err(StoreError::NotFound(message_id));
				};
				if receiver_id != reader.get() {
					return Err(StoreError::NotReceiver(message_id));
				}
				if read_flag {
					return Ok(false);
				}

				sqlx::query("UPDATE messages SET read_flag = TRUE WHERE id = $1")
					.bind(message_id.0)
					.execute(&mut *tx)
					.await
					.context("update read flag (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				Ok(true)
			}
		}
	}

	async fn recent_unread_received(&self, receiver: ParticipantId, limit: usize) -> Result<Vec<Message>, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let rows = sqlx::query_as::<_, (i64, i64, i64, Option<String>, Option<String>, i64, i64)>(
					"SELECT id, sender_id, receiver_id, text, attachment_ref, sent_at_unix_ms, read_flag \
					FROM messages WHERE receiver_id = ? AND read_flag = 0 \
					ORDER BY sent_at_unix_ms DESC, id DESC LIMIT ?",
				)
				.bind(receiver.get())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select unread (sqlite)")?;

				rows.into_iter()
					.map(|(id, s, r, text, att, at, read)| row_to_message(id, s, r, text, att, at, read != 0))
					.collect()
			}
			SqlBackend::Postgres(pool) => {
				let rows = sqlx::query_as::<_, (i64, i64, i64, Option<String>, Option<String>, i64, bool)>(
					"SELECT id, sender_id, receiver_id, text, attachment_ref, sent_at_unix_ms, read_flag \
					FROM messages WHERE receiver_id = $1 AND read_flag = FALSE \
					ORDER BY sent_at_unix_ms DESC, id DESC LIMIT $2",
				)
				.bind(receiver.get())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select unread (postgres)")?;

				rows.into_iter()
					.map(|(id, s, r, text, att, at, read)| row_to_message(id, s, r, text, att, at, read))
					.collect()
			}
		}
	}
}

/// Durable message store used by the delivery gateway.
///
/// `append` validates the participant pair and assigns the server-side
/// timestamp; a message only reaches the fan-out hub after the backend has
/// accepted it.
#[derive(Clone)]
pub struct MessageStore {
	backend: Arc<dyn MessageBackend>,
}

impl MessageStore {
	pub fn in_memory() -> Self {
		Self {
			backend: Arc::new(InMemoryMessageBackend::default()),
		}
	}

	pub fn new_persistent(backend: SqlStore) -> Self {
		Self {
			backend: Arc::new(backend),
		}
	}

	#[cfg(test)]
	pub fn with_backend(backend: Arc<dyn MessageBackend>) -> Self {
		Self { backend }
	}

	/// Append one message. Self-conversations are rejected before any write.
	pub async fn append(
		&self,
		sender: ParticipantId,
		receiver: ParticipantId,
		body: MessageBody,
	) -> Result<Message, StoreError> {
		ConversationKey::between(sender, receiver)?;
		self.backend.append(sender, receiver, body, unix_ms_now()).await
	}

	/// Full conversation between the key's two participants, oldest first.
	pub async fn history(&self, key: ConversationKey) -> Result<Vec<Message>, StoreError> {
		self.backend.history(key).await
	}

	/// Mark one received message as read.
	///
	/// Returns whether this call made the transition; marking an already
	/// read message is a no-op, and only the receiver may mark it.
	pub async fn mark_read(&self, message_id: MessageId, reader: ParticipantId) -> Result<bool, StoreError> {
		self.backend.mark_read(message_id, reader).await
	}

	/// Most recent unread messages received by `receiver`, newest first.
	pub async fn recent_unread_received(
		&self,
		receiver: ParticipantId,
		limit: usize,
	) -> Result<Vec<Message>, StoreError> {
		self.backend.recent_unread_received(receiver, limit).await
	}
}
