#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::{ConversationKey, Message};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Per-conversation hub that fans out stored messages to live subscribers.
///
/// Delivery is at-most-once: there is no buffering for sessions that are not
/// subscribed at publish time, and a subscriber whose queue is full loses the
/// item and later gets a `Lagged` marker instead.
#[derive(Debug, Clone)]
pub struct ChannelHub {
	inner: Arc<Mutex<Inner>>,
	cfg: ChannelHubConfig,
}

/// Configuration for `ChannelHub`.
#[derive(Debug, Clone)]
pub struct ChannelHubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for ChannelHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum ChannelItem {
	Message(Box<Message>),

	/// Indicates the subscriber was lagging and items were dropped.
	Lagged {
		dropped: u64,
	},
}

impl ChannelHub {
	pub fn new(cfg: ChannelHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe a session to a conversation channel.
	///
	/// Subscribing the same session again replaces its queue, so the old
	/// receiver closes and at most one queue per session exists per channel.
	pub async fn subscribe(&self, channel: ConversationKey, session_id: u64) -> mpsc::Receiver<ChannelItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.channels.entry(channel).or_default();

		prune_closed_subscribers(entry);

		entry.subscribers.insert(session_id, Subscriber { tx, pending_lag: 0 });

		if self.cfg.debug_logs {
			debug!(channel = %channel, subs = entry.subscribers.len(), "channel hub: subscribed");
		}

		rx
	}

	/// Drop one session's subscription to a channel.
	pub async fn unsubscribe(&self, channel: ConversationKey, session_id: u64) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.channels.get_mut(&channel) {
			entry.subscribers.remove(&session_id);
			prune_closed_subscribers(entry);

			if entry.subscribers.is_empty() {
				inner.channels.remove(&channel);
			}
		}
	}

	/// Drop every subscription belonging to `session_id`.
	pub async fn remove_session(&self, session_id: u64) {
		let mut inner = self.inner.lock().await;
		inner.channels.retain(|_, entry| {
			entry.subscribers.remove(&session_id);
			prune_closed_subscribers(entry);
			!entry.subscribers.is_empty()
		});
	}

	/// Publish a stored message to a channel's subscribers.
	///
	/// `exclude` skips one session, used so a sender does not get its own
	/// message echoed back on the session that produced it. Each remaining
	/// subscriber is offered the item exactly once.
	pub async fn publish(&self, channel: ConversationKey, message: Message, exclude: Option<u64>) {
		let item = ChannelItem::Message(Box::new(message));

		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.channels.get_mut(&channel) else {
			return;
		};

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.channels.remove(&channel);
			return;
		}

		let mut dropped_total: u64 = 0;

		for (session_id, sub) in entry.subscribers.iter_mut() {
			if Some(*session_id) == exclude {
				continue;
			}

			match sub.tx.try_send(item.clone()) {
				Ok(()) => {
					if sub.pending_lag > 0
						&& sub.tx.try_send(ChannelItem::Lagged { dropped: sub.pending_lag }).is_ok()
					{
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.channels.remove(&channel);
		}

		if self.cfg.debug_logs && dropped_total > 0 {
			debug!(
				channel = %channel,
				dropped = dropped_total,
				"channel hub: dropped due to full subscriber queues"
			);
		}
	}

	/// Get a snapshot of open subscriber counts per channel.
	#[allow(dead_code)]
	pub async fn channel_subscriber_counts(&self) -> HashMap<ConversationKey, usize> {
		let inner = self.inner.lock().await;
		inner
			.channels
			.iter()
			.map(|(k, v)| (*k, v.subscribers.values().filter(|s| !s.tx.is_closed()).count()))
			.collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	channels: HashMap<ConversationKey, ChannelEntry>,
}

#[derive(Debug, Default)]
struct ChannelEntry {
	subscribers: HashMap<u64, Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	tx: mpsc::Sender<ChannelItem>,

	/// Items dropped since the last lag marker this subscriber saw.
	pending_lag: u64,
}

fn prune_closed_subscribers(entry: &mut ChannelEntry) {
	entry.subscribers.retain(|_, sub| !sub.tx.is_closed());
}
