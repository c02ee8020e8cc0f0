#![forbid(unsafe_code)]

pub mod comments;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for validating participants and conversation channels.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
	#[error("empty value")]
	Empty,
	#[error("participant id must be positive, got {0}")]
	NonPositiveId(i64),
	#[error("conversation needs two distinct participants, got {0} twice")]
	SelfConversation(i64),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Account-assigned user identifier. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(i64);

impl ParticipantId {
	/// Create a `ParticipantId`, rejecting zero and negatives.
	pub fn new(id: i64) -> Result<Self, ChannelError> {
		if id <= 0 {
			return Err(ChannelError::NonPositiveId(id));
		}
		Ok(Self(id))
	}

	pub const fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for ParticipantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ParticipantId {
	type Err = ChannelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ChannelError::Empty);
		}
		let id: i64 = s
			.parse()
			.map_err(|_| ChannelError::InvalidFormat(format!("not a numeric id: {s}")))?;
		ParticipantId::new(id)
	}
}

/// Canonical identity of a two-party conversation.
///
/// The same two participants always map to the same key regardless of
/// argument order. The channel form is `chat.<low>.<high>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
	low: ParticipantId,
	high: ParticipantId,
}

impl ConversationKey {
	/// Prefix for conversation channels.
	pub const PREFIX: &'static str = "chat.";

	/// Canonical key for the conversation between `a` and `b`.
	pub fn between(a: ParticipantId, b: ParticipantId) -> Result<Self, ChannelError> {
		if a == b {
			return Err(ChannelError::SelfConversation(a.get()));
		}
		let (low, high) = if a.get() < b.get() { (a, b) } else { (b, a) };
		Ok(Self { low, high })
	}

	/// Parse a channel string of the form `chat.<low>.<high>`.
	///
	/// Only the canonical spelling is accepted: ids are bare decimal digits
	/// in ascending order, so `chat.2.1` is rejected even though it names
	/// the same pair as `chat.1.2`.
	pub fn parse(s: &str) -> Result<Self, ChannelError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ChannelError::Empty);
		}

		let rest = s
			.strip_prefix(Self::PREFIX)
			.ok_or_else(|| ChannelError::InvalidFormat("expected chat.<low>.<high>".into()))?;
		let (low_s, high_s) = rest
			.split_once('.')
			.ok_or_else(|| ChannelError::InvalidFormat("expected chat.<low>.<high>".into()))?;

		let low = parse_channel_id(low_s)?;
		let high = parse_channel_id(high_s)?;
		if low == high {
			return Err(ChannelError::SelfConversation(low.get()));
		}
		if low.get() > high.get() {
			return Err(ChannelError::InvalidFormat(format!(
				"ids must be in ascending order: {} before {}",
				high.get(),
				low.get()
			)));
		}
		Ok(Self { low, high })
	}

	/// Canonical channel string, `chat.<low>.<high>`.
	pub fn channel(&self) -> String {
		self.to_string()
	}

	/// Whether `p` is one of the two participants.
	pub const fn includes(&self, p: ParticipantId) -> bool {
		self.low.get() == p.get() || self.high.get() == p.get()
	}

	/// The other participant, if `p` is part of this conversation.
	pub fn peer_of(&self, p: ParticipantId) -> Option<ParticipantId> {
		if p == self.low {
			Some(self.high)
		} else if p == self.high {
			Some(self.low)
		} else {
			None
		}
	}

	/// Both participants in ascending id order.
	pub const fn participants(&self) -> (ParticipantId, ParticipantId) {
		(self.low, self.high)
	}
}

fn parse_channel_id(s: &str) -> Result<ParticipantId, ChannelError> {
	if s.is_empty() {
		return Err(ChannelError::InvalidFormat("expected chat.<low>.<high>".into()));
	}
	// Bare decimal digits only: signs, whitespace and leading zeros are all
	// non-canonical spellings.
	if !s.bytes().all(|b| b.is_ascii_digit()) || (s.len() > 1 && s.starts_with('0')) {
		return Err(ChannelError::InvalidFormat(format!("not a canonical id: {s}")));
	}
	let id: i64 = s
		.parse()
		.map_err(|_| ChannelError::InvalidFormat(format!("id out of range: {s}")))?;
	ParticipantId::new(id)
}

impl fmt::Display for ConversationKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{}.{}", Self::PREFIX, self.low, self.high)
	}
}

impl FromStr for ConversationKey {
	type Err = ChannelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConversationKey::parse(s)
	}
}

/// Store-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Error for message bodies with no content.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("message body needs text or an attachment")]
pub struct EmptyBody;

/// Content of a direct message: text, an attachment reference, or both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
	text: Option<String>,
	attachment_ref: Option<String>,
}

impl MessageBody {
	/// Build a body from optional parts, requiring at least one of them.
	///
	/// Whitespace-only parts count as absent.
	pub fn new(text: Option<String>, attachment_ref: Option<String>) -> Result<Self, EmptyBody> {
		let text = text.filter(|s| !s.trim().is_empty());
		let attachment_ref = attachment_ref.filter(|s| !s.trim().is_empty());
		if text.is_none() && attachment_ref.is_none() {
			return Err(EmptyBody);
		}
		Ok(Self { text, attachment_ref })
	}

	/// Text-only body.
	pub fn from_text(text: impl Into<String>) -> Result<Self, EmptyBody> {
		Self::new(Some(text.into()), None)
	}

	pub fn text(&self) -> Option<&str> {
		self.text.as_deref()
	}

	pub fn attachment_ref(&self) -> Option<&str> {
		self.attachment_ref.as_deref()
	}
}

/// A stored direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub sender: ParticipantId,
	pub receiver: ParticipantId,
	pub body: MessageBody,
	pub sent_at_unix_ms: i64,
	pub read: bool,
}
