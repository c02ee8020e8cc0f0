#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use parley_domain::ParticipantId;
use tokio::sync::Mutex;

use super::store::{SqlBackend, SqlStore, StoreError};

/// A friend request that has not been accepted or declined yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRequest {
	pub from: ParticipantId,
	pub requested_at_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follower {
	pub follower: ParticipantId,
	pub followed_at_unix_ms: i64,
}

/// Read-only view of the social graph, consumed by the alert aggregator.
#[async_trait::async_trait]
pub trait SocialBackend: Send + Sync {
	async fn pending_friend_requests(&self, to: ParticipantId) -> Result<Vec<FriendRequest>, StoreError>;

	async fn recent_followers(&self, of: ParticipantId, limit: usize) -> Result<Vec<Follower>, StoreError>;
}

#[derive(Debug, Default)]
struct SocialRows {
	// (addressee, request) and (followed, follower row)
	friend_requests: Vec<(ParticipantId, FriendRequest)>,
	follows: Vec<(ParticipantId, Follower)>,
}

#[derive(Debug, Default)]
pub struct InMemorySocialBackend {
	inner: Mutex<SocialRows>,
}

impl InMemorySocialBackend {
	pub async fn add_friend_request(&self, from: ParticipantId, to: ParticipantId, requested_at_unix_ms: i64) {
		let mut guard = self.inner.lock().await;
		guard.friend_requests.push((
			to,
			FriendRequest {
				from,
				requested_at_unix_ms,
			},
		));
	}

	pub async fn add_follower(&self, follower: ParticipantId, followed: ParticipantId, followed_at_unix_ms: i64) {
		let mut guard = self.inner.lock().await;
		guard.follows.push((
			followed,
			Follower {
				follower,
				followed_at_unix_ms,
			},
		));
	}
}

#[async_trait::async_trait]
impl SocialBackend for InMemorySocialBackend {
	async fn pending_friend_requests(&self, to: ParticipantId) -> Result<Vec<FriendRequest>, StoreError> {
		let guard = self.inner.lock().await;
		let mut out: Vec<FriendRequest> = guard
			.friend_requests
			.iter()
			.filter(|(addressee, _)| *addressee == to)
			.map(|(_, req)| req.clone())
			.collect();
		out.sort_by(|a, b| {
			(b.requested_at_unix_ms, b.from.get()).cmp(&(a.requested_at_unix_ms, a.from.get()))
		});
		Ok(out)
	}

	async fn recent_followers(&self, of: ParticipantId, limit: usize) -> Result<Vec<Follower>, StoreError> {
		let guard = self.inner.lock().await;
		let mut out: Vec<Follower> = guard
			.follows
			.iter()
			.filter(|(followed, _)| *followed == of)
			.map(|(_, row)| row.clone())
			.collect();
		out.sort_by(|a, b| {
			(b.followed_at_unix_ms, b.follower.get()).cmp(&(a.followed_at_unix_ms, a.follower.get()))
		});
		out.truncate(limit);
		Ok(out)
	}
}

#[async_trait::async_trait]
impl SocialBackend for SqlStore {
	async fn pending_friend_requests(&self, to: ParticipantId) -> Result<Vec<FriendRequest>, StoreError> {
		let rows: Vec<(i64, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT from_id, requested_at_unix_ms FROM friend_requests \
					WHERE to_id = ? AND pending = 1 \
					ORDER BY requested_at_unix_ms DESC, id DESC",
				)
				.bind(to.get())
				.fetch_all(pool)
				.await
				.context("select friend requests (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT from_id, requested_at_unix_ms FROM friend_requests \
					WHERE to_id = $1 AND pending = TRUE \
					ORDER BY requested_at_unix_ms DESC, id DESC",
				)
				.bind(to.get())
				.fetch_all(pool)
				.await
				.context("select friend requests (postgres)")?
			}
		};

		rows.into_iter()
			.map(|(from_id, requested_at_unix_ms)| {
				let from = ParticipantId::new(from_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
				Ok(FriendRequest {
					from,
					requested_at_unix_ms,
				})
			})
			.collect()
	}

	async fn recent_followers(&self, of: ParticipantId, limit: usize) -> Result<Vec<Follower>, StoreError> {
		let rows: Vec<(i64, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT follower_id, followed_at_unix_ms FROM follows \
					WHERE followed_id = ? \
					ORDER BY followed_at_unix_ms DESC, follower_id DESC LIMIT ?",
				)
				.bind(of.get())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select followers (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT follower_id, followed_at_unix_ms FROM follows \
					WHERE followed_id = $1 \
					ORDER BY followed_at_unix_ms DESC, follower_id DESC LIMIT $2",
				)
				.bind(of.get())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.context("select followers (postgres)")?
			}
		};

		rows.into_iter()
			.map(|(follower_id, followed_at_unix_ms)| {
				let follower = ParticipantId::new(follower_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
				Ok(Follower {
					follower,
					followed_at_unix_ms,
				})
			})
			.collect()
	}
}

/// Social graph reads behind one handle, mirroring [`super::store::MessageStore`].
#[derive(Clone)]
pub struct SocialDirectory {
	backend: Arc<dyn SocialBackend>,
}

impl SocialDirectory {
	pub fn in_memory() -> Self {
		Self {
			backend: Arc::new(InMemorySocialBackend::default()),
		}
	}

	pub fn new_persistent(backend: SqlStore) -> Self {
		Self {
			backend: Arc::new(backend),
		}
	}

	#[cfg(test)]
	pub fn with_backend(backend: Arc<dyn SocialBackend>) -> Self {
		Self { backend }
	}

	pub async fn pending_friend_requests(&self, to: ParticipantId) -> Result<Vec<FriendRequest>, StoreError> {
		self.backend.pending_friend_requests(to).await
	}

	pub async fn recent_followers(&self, of: ParticipantId, limit: usize) -> Result<Vec<Follower>, StoreError> {
		self.backend.recent_followers(of, limit).await
	}
}
