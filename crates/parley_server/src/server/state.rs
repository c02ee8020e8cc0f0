#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use parley_domain::ConversationKey;

/// Which conversation channels each live session has joined.
///
/// The delivery hub owns the actual subscriber queues; this registry is the
/// control-plane record used for idempotent joins and for sweeping a
/// session's subscriptions when its connection goes away.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	channels_by_session: HashMap<u64, HashSet<ConversationKey>>,
}

impl SessionRegistry {
	/// Record a join. Returns `false` when the session had already joined.
	pub fn record_join(&mut self, session_id: u64, key: ConversationKey) -> bool {
		self.channels_by_session.entry(session_id).or_default().insert(key)
	}

	/// Record a leave. Returns `false` when the session was not joined.
	pub fn record_leave(&mut self, session_id: u64, key: &ConversationKey) -> bool {
		let Some(set) = self.channels_by_session.get_mut(&session_id) else {
			return false;
		};
		let removed = set.remove(key);
		if set.is_empty() {
			self.channels_by_session.remove(&session_id);
		}
		removed
	}

	/// Remove all state for a session, returning the channels it had joined.
	pub fn remove_session(&mut self, session_id: u64) -> Vec<ConversationKey> {
		self.channels_by_session
			.remove(&session_id)
			.map(|set| set.into_iter().collect())
			.unwrap_or_default()
	}

	/// Total number of live (session, channel) subscriptions.
	pub fn subscription_count(&self) -> usize {
		self.channels_by_session.values().map(HashSet::len).sum()
	}
}
