#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::anyhow;
use parley_domain::{MessageBody, ParticipantId};

use super::alerts::{AlertAggregator, AlertsConfig};
use super::social::{Follower, FriendRequest, InMemorySocialBackend, SocialBackend, SocialDirectory};
use super::store::{MessageStore, StoreError};

fn pid(id: i64) -> ParticipantId {
	ParticipantId::new(id).unwrap()
}

fn body(text: &str) -> MessageBody {
	MessageBody::from_text(text).unwrap()
}

struct FailingSocialBackend;

#[async_trait::async_trait]
impl SocialBackend for FailingSocialBackend {
	async fn pending_friend_requests(&self, _to: ParticipantId) -> Result<Vec<FriendRequest>, StoreError> {
		Err(StoreError::Backend(anyhow!("social graph offline")))
	}

	async fn recent_followers(&self, _of: ParticipantId, _limit: usize) -> Result<Vec<Follower>, StoreError> {
		Err(StoreError::Backend(anyhow!("social graph offline")))
	}
}

#[tokio::test]
async fn assemble_bundles_every_section() {
	let store = MessageStore::in_memory();
	store.append(pid(3), pid(1), body("first")).await.unwrap();
	store.append(pid(3), pid(1), body("second")).await.unwrap();
	store.append(pid(4), pid(1), body("third")).await.unwrap();

	let social_backend = Arc::new(InMemorySocialBackend::default());
	social_backend.add_friend_request(pid(5), pid(1), 1_000).await;
	social_backend.add_friend_request(pid(6), pid(1), 2_000).await;
	let social = SocialDirectory::with_backend(social_backend);

	let aggregator = AlertAggregator::new(store, social, AlertsConfig::default());
	let bundle = aggregator.assemble(pid(1)).await;

	assert!(bundle.failed_sections.is_empty());

	let requesters: Vec<i64> = bundle.friend_requests.iter().map(|r| r.from.get()).collect();
	assert_eq!(requesters, vec![6, 5]);

	let texts: Vec<&str> = bundle.unread_messages.iter().filter_map(|m| m.body.text()).collect();
	assert_eq!(texts, vec!["third", "second", "first"]);

	assert!(bundle.recent_followers.is_empty());
}

#[tokio::test]
async fn a_failed_section_does_not_sink_the_rest() {
	let store = MessageStore::in_memory();
	store.append(pid(2), pid(1), body("still here")).await.unwrap();

	let social = SocialDirectory::with_backend(Arc::new(FailingSocialBackend));

	let aggregator = AlertAggregator::new(store, social, AlertsConfig::default());
	let bundle = aggregator.assemble(pid(1)).await;

	assert_eq!(bundle.failed_sections, vec!["friend_requests", "recent_followers"]);
	assert!(bundle.friend_requests.is_empty());
	assert!(bundle.recent_followers.is_empty());

	assert_eq!(bundle.unread_messages.len(), 1);
	assert_eq!(bundle.unread_messages[0].body.text(), Some("still here"));
}

#[tokio::test]
async fn recent_limit_caps_unread_and_followers_but_not_requests() {
	let store = MessageStore::in_memory();
	for text in ["a", "b", "c"] {
		store.append(pid(9), pid(1), body(text)).await.unwrap();
	}

	let social_backend = Arc::new(InMemorySocialBackend::default());
	for (follower, at) in [(11, 100), (12, 200), (13, 300)] {
		social_backend.add_follower(pid(follower), pid(1), at).await;
	}
	for (from, at) in [(21, 100), (22, 200), (23, 300)] {
		social_backend.add_friend_request(pid(from), pid(1), at).await;
	}
	let social = SocialDirectory::with_backend(social_backend);

	let aggregator = AlertAggregator::new(store, social, AlertsConfig { recent_limit: 2 });
	let bundle = aggregator.assemble(pid(1)).await;

	assert_eq!(bundle.unread_messages.len(), 2);
	assert_eq!(bundle.unread_messages[0].body.text(), Some("c"));

	let followers: Vec<i64> = bundle.recent_followers.iter().map(|f| f.follower.get()).collect();
	assert_eq!(followers, vec![13, 12]);

	assert_eq!(bundle.friend_requests.len(), 3);
}
