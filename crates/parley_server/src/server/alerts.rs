#![forbid(unsafe_code)]

use parley_domain::{Message, ParticipantId};
use tracing::warn;

use super::social::{Follower, FriendRequest, SocialDirectory};
use super::store::{MessageStore, StoreError};

pub const DEFAULT_RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct AlertsConfig {
	/// Cap on the unread-message and follower sections. Pending friend
	/// requests are always returned in full.
	pub recent_limit: usize,
}

impl Default for AlertsConfig {
	fn default() -> Self {
		Self {
			recent_limit: DEFAULT_RECENT_LIMIT,
		}
	}
}

/// One pull-based alert snapshot for a participant.
///
/// A section that could not be read is left empty and named in
/// `failed_sections`; an empty section with no entry there genuinely has
/// nothing to show.
#[derive(Debug, Clone, Default)]
pub struct AlertBundle {
	pub friend_requests: Vec<FriendRequest>,
	pub unread_messages: Vec<Message>,
	pub recent_followers: Vec<Follower>,
	pub failed_sections: Vec<String>,
}

#[derive(Clone)]
pub struct AlertAggregator {
	store: MessageStore,
	social: SocialDirectory,
	config: AlertsConfig,
}

impl AlertAggregator {
	pub fn new(store: MessageStore, social: SocialDirectory, config: AlertsConfig) -> Self {
		Self { store, social, config }
	}

	/// Assemble the bundle for one participant. Sections are fetched
	/// concurrently and a failing section never sinks the others.
	pub async fn assemble(&self, for_participant: ParticipantId) -> AlertBundle {
		let (requests, unread, followers) = tokio::join!(
			self.social.pending_friend_requests(for_participant),
			self.store.recent_unread_received(for_participant, self.config.recent_limit),
			self.social.recent_followers(for_participant, self.config.recent_limit),
		);

		let mut failed_sections = Vec::new();
		let friend_requests = section("friend_requests", requests, &mut failed_sections);
		let unread_messages = section("unread_messages", unread, &mut failed_sections);
		let recent_followers = section("recent_followers", followers, &mut failed_sections);

		AlertBundle {
			friend_requests,
			unread_messages,
			recent_followers,
			failed_sections,
		}
	}
}

fn section<T>(name: &str, result: Result<Vec<T>, StoreError>, failed_sections: &mut Vec<String>) -> Vec<T> {
	match result {
		Ok(rows) => rows,
		Err(error) => {
			warn!(%error, section = name, "alert section failed");
			failed_sections.push(name.to_string());
			Vec::new()
		}
	}
}
