#![forbid(unsafe_code)]
#![allow(clippy::large_enum_variant)]

//! Wire types for `parley.v1`.
//!
//! Written out as prost derive structs rather than generated from a schema
//! file so the crate builds without a protoc toolchain. Field tags are the
//! wire contract; never renumber or reuse them.
//!
//! String fields use the empty string for "absent". Mapping empties to
//! `Option` happens at the gateway and client boundaries, not here.

/// Top-level control frame exchanged on the control stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	/// Protocol version, `(major << 16) | minor`.
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Client-chosen correlation id, echoed on the response.
	#[prost(string, tag = "2")]
	pub request_id: String,
	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27"
	)]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Join(super::Join),
		#[prost(message, tag = "13")]
		JoinResult(super::JoinResult),
		#[prost(message, tag = "14")]
		Leave(super::Leave),
		#[prost(message, tag = "15")]
		LeaveResult(super::LeaveResult),
		#[prost(message, tag = "16")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "17")]
		SendResult(super::SendResult),
		#[prost(message, tag = "18")]
		FetchHistory(super::FetchHistory),
		#[prost(message, tag = "19")]
		History(super::History),
		#[prost(message, tag = "20")]
		MarkRead(super::MarkRead),
		#[prost(message, tag = "21")]
		MarkReadResult(super::MarkReadResult),
		#[prost(message, tag = "22")]
		FetchAlerts(super::FetchAlerts),
		#[prost(message, tag = "23")]
		Alerts(super::Alerts),
		#[prost(message, tag = "24")]
		Ping(super::Ping),
		#[prost(message, tag = "25")]
		Pong(super::Pong),
		#[prost(message, tag = "26")]
		Event(super::EventEnvelope),
		#[prost(message, tag = "27")]
		Error(super::Error),
	}
}

/// First frame a client sends on the control stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub client_name: String,
	#[prost(string, tag = "2")]
	pub client_instance_id: String,
	/// Signed auth token. Required when the gateway has an HMAC secret.
	#[prost(string, tag = "3")]
	pub auth_token: String,
	/// Claimed identity for development gateways without a secret.
	#[prost(int64, tag = "4")]
	pub participant_id: i64,
}

/// Server reply to a valid `Hello`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: String,
	#[prost(string, tag = "2")]
	pub server_instance_id: String,
	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "4")]
	pub max_frame_bytes: u32,
	/// Identity the gateway authenticated this session as.
	#[prost(int64, tag = "5")]
	pub participant_id: i64,
}

/// Subscribe this session to a conversation channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
	#[prost(string, tag = "1")]
	pub channel: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinResult {
	#[prost(string, tag = "1")]
	pub channel: String,
	#[prost(enumeration = "join_result::Status", tag = "2")]
	pub status: i32,
	#[prost(string, tag = "3")]
	pub detail: String,
}

pub mod join_result {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Status {
		Unspecified = 0,
		Ok = 1,
		AlreadyJoined = 2,
		InvalidChannel = 3,
		NotAuthorized = 4,
	}
}

/// Drop this session's subscription to a conversation channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Leave {
	#[prost(string, tag = "1")]
	pub channel: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaveResult {
	#[prost(string, tag = "1")]
	pub channel: String,
	#[prost(enumeration = "leave_result::Status", tag = "2")]
	pub status: i32,
	#[prost(string, tag = "3")]
	pub detail: String,
}

pub mod leave_result {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Status {
		Unspecified = 0,
		Ok = 1,
		NotJoined = 2,
		InvalidChannel = 3,
	}
}

/// Send a direct message to another participant.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(int64, tag = "1")]
	pub to: i64,
	#[prost(string, tag = "2")]
	pub text: String,
	#[prost(string, tag = "3")]
	pub attachment_ref: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendResult {
	#[prost(enumeration = "send_result::Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub detail: String,
	/// The stored message on success, with its assigned id and timestamp.
	#[prost(message, optional, tag = "3")]
	pub message: Option<Message>,
}

pub mod send_result {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Status {
		Unspecified = 0,
		Ok = 1,
		InvalidMessage = 2,
		RateLimited = 3,
		StorageError = 4,
	}
}

/// A stored direct message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
	#[prost(int64, tag = "1")]
	pub id: i64,
	#[prost(int64, tag = "2")]
	pub sender_id: i64,
	#[prost(int64, tag = "3")]
	pub receiver_id: i64,
	#[prost(string, tag = "4")]
	pub text: String,
	#[prost(string, tag = "5")]
	pub attachment_ref: String,
	#[prost(int64, tag = "6")]
	pub sent_at_unix_ms: i64,
	#[prost(bool, tag = "7")]
	pub read: bool,
}

/// Fetch the full conversation with one other participant.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchHistory {
	#[prost(int64, tag = "1")]
	pub with_participant_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct History {
	#[prost(enumeration = "history::Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub detail: String,
	/// Chronological, oldest first.
	#[prost(message, repeated, tag = "3")]
	pub messages: Vec<Message>,
}

pub mod history {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Status {
		Unspecified = 0,
		Ok = 1,
		InvalidParticipant = 2,
		StorageError = 3,
	}
}

/// Mark one received message as read.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkRead {
	#[prost(int64, tag = "1")]
	pub message_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkReadResult {
	#[prost(enumeration = "mark_read_result::Status", tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub detail: String,
	/// Whether this call transitioned the message to read.
	#[prost(bool, tag = "3")]
	pub updated: bool,
}

pub mod mark_read_result {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Status {
		Unspecified = 0,
		Ok = 1,
		NotFound = 2,
		NotAuthorized = 3,
		StorageError = 4,
	}
}

/// Pull the caller's pending alerts.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchAlerts {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Alerts {
	#[prost(message, repeated, tag = "1")]
	pub friend_requests: Vec<FriendRequestAlert>,
	/// Most recent unread messages, newest first.
	#[prost(message, repeated, tag = "2")]
	pub unread_messages: Vec<Message>,
	/// Most recent new followers, newest first.
	#[prost(message, repeated, tag = "3")]
	pub recent_followers: Vec<FollowerAlert>,
	/// Sections that could not be loaded; the rest of the bundle is intact.
	#[prost(string, repeated, tag = "4")]
	pub failed_sections: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FriendRequestAlert {
	#[prost(int64, tag = "1")]
	pub from_participant_id: i64,
	#[prost(int64, tag = "2")]
	pub requested_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FollowerAlert {
	#[prost(int64, tag = "1")]
	pub follower_id: i64,
	#[prost(int64, tag = "2")]
	pub followed_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

/// A pushed event on the events stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventEnvelope {
	/// Conversation channel this event belongs to.
	#[prost(string, tag = "1")]
	pub channel: String,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
	#[prost(oneof = "event_envelope::Event", tags = "10, 11")]
	pub event: Option<event_envelope::Event>,
}

pub mod event_envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "10")]
		MessageDelivered(super::MessageDelivered),
		#[prost(message, tag = "11")]
		ChannelLagged(super::ChannelLagged),
	}
}

/// A message delivered live to the other side of a conversation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageDelivered {
	#[prost(message, optional, tag = "1")]
	pub message: Option<Message>,
}

/// This session's queue overflowed and `dropped` events were discarded.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelLagged {
	#[prost(uint64, tag = "1")]
	pub dropped: u64,
	#[prost(string, tag = "2")]
	pub detail: String,
}

/// Protocol-level failure on the control stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: String,
	#[prost(string, tag = "2")]
	pub message: String,
}
