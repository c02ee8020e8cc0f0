#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow};
use parley_domain::{ConversationKey, Message, MessageBody, MessageId, ParticipantId};
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use parley_protocol::{pb, version};
use parley_util::SecretString;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::server::alerts::{AlertAggregator, AlertBundle};
use crate::server::auth::verify_hmac_token;
use crate::server::channel_hub::{ChannelHub, ChannelItem};
use crate::server::state::SessionRegistry;
use crate::server::store::{MessageStore, StoreError};
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	pub fan_in_channel_capacity: usize,

	/// When set, every session must present a valid signed token; without
	/// it the gateway trusts the identity claimed in `Hello` (dev mode).
	pub auth_hmac_secret: Option<SecretString>,

	pub send_rate_limit_per_conn_burst: u32,
	pub send_rate_limit_per_conn_per_minute: u32,
	pub send_rate_limit_per_channel_burst: u32,
	pub send_rate_limit_per_channel_per_minute: u32,

	pub server_instance_id: String,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			fan_in_channel_capacity: 1024,
			auth_hmac_secret: None,
			send_rate_limit_per_conn_burst: 0,
			send_rate_limit_per_conn_per_minute: 0,
			send_rate_limit_per_channel_burst: 0,
			send_rate_limit_per_channel_per_minute: 0,
			server_instance_id: uuid::Uuid::new_v4().to_string(),
		}
	}
}

/// Shared services a connection operates against. Created once at startup
/// and cloned per connection, so every session sees the same hub and store.
#[derive(Clone)]
pub struct GatewayServices {
	pub registry: Arc<RwLock<SessionRegistry>>,
	pub hub: ChannelHub,
	pub store: MessageStore,
	pub alerts: AlertAggregator,
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

#[derive(Debug)]
struct SendRateLimiter {
	per_connection: Option<TokenBucket>,
	per_channel: HashMap<ConversationKey, TokenBucket>,
	per_channel_burst: u32,
	per_channel_per_minute: u32,
	max_channels: usize,
}

impl SendRateLimiter {
	fn new(settings: &ConnectionSettings) -> Self {
		Self {
			per_connection: TokenBucket::new(
				settings.send_rate_limit_per_conn_burst,
				settings.send_rate_limit_per_conn_per_minute,
			),
			per_channel: HashMap::new(),
			per_channel_burst: settings.send_rate_limit_per_channel_burst,
			per_channel_per_minute: settings.send_rate_limit_per_channel_per_minute,
			max_channels: 1024,
		}
	}

	fn allow_connection(&mut self) -> bool {
		match self.per_connection.as_mut() {
			Some(bucket) => bucket.allow(),
			None => true,
		}
	}

	fn allow_channel(&mut self, key: ConversationKey) -> bool {
		let Some(bucket) = TokenBucket::new(self.per_channel_burst, self.per_channel_per_minute) else {
			return true;
		};

		if self.per_channel.len() >= self.max_channels {
			self.per_channel.clear();
		}

		let entry = self.per_channel.entry(key).or_insert(bucket);
		entry.allow()
	}
}

fn envelope(request_id: String, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: version::PROTOCOL_VERSION_U32,
		request_id,
		msg: Some(msg),
	}
}

fn message_to_pb(msg: &Message) -> pb::Message {
	pb::Message {
		id: msg.id.0,
		sender_id: msg.sender.get(),
		receiver_id: msg.receiver.get(),
		text: msg.body.text().unwrap_or_default().to_string(),
		attachment_ref: msg.body.attachment_ref().unwrap_or_default().to_string(),
		sent_at_unix_ms: msg.sent_at_unix_ms,
		read: msg.read,
	}
}

fn alerts_to_pb(bundle: AlertBundle) -> pb::Alerts {
	pb::Alerts {
		friend_requests: bundle
			.friend_requests
			.into_iter()
			.map(|req| pb::FriendRequestAlert {
				from_participant_id: req.from.get(),
				requested_at_unix_ms: req.requested_at_unix_ms,
			})
			.collect(),
		unread_messages: bundle.unread_messages.iter().map(message_to_pb).collect(),
		recent_followers: bundle
			.recent_followers
			.into_iter()
			.map(|f| pb::FollowerAlert {
				follower_id: f.follower.get(),
				followed_at_unix_ms: f.followed_at_unix_ms,
			})
			.collect(),
		failed_sections: bundle.failed_sections,
	}
}

fn event_envelope_frame(event: pb::EventEnvelope) -> anyhow::Result<Vec<u8>> {
	let env = envelope(String::new(), pb::envelope::Msg::Event(event));
	encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))
}

pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	services: GatewayServices,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("parley_server_control_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match parley_protocol::decode_frame::<pb::Envelope>(&buf, DEFAULT_MAX_FRAME_SIZE) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("parley_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(parley_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("parley_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let (hello_version, hello) = wait_for_hello(&mut ctrl_rx).await?;

	if version::major_of(hello_version) != version::PROTOCOL_MAJOR {
		warn!(conn_id, client_version = hello_version, "unsupported protocol version");
		send_refusal(
			&mut control_send,
			"UNSUPPORTED_VERSION",
			format!("server speaks protocol {}.x", version::PROTOCOL_MAJOR),
		)
		.await;
		return Ok(());
	}

	let Some(participant) = authenticate(conn_id, &settings, &hello) else {
		send_refusal(
			&mut control_send,
			"UNAUTHENTICATED",
			"missing or invalid credentials".to_string(),
		)
		.await;
		return Ok(());
	};

	let client_instance_id = if hello.client_instance_id.trim().is_empty() {
		format!("conn-{conn_id}")
	} else {
		hello.client_instance_id.clone()
	};

	info!(
		conn_id,
		participant = %participant,
		client_name = %hello.client_name,
		client_instance_id = %client_instance_id,
		"session authenticated"
	);
	metrics::counter!("parley_server_hello_total").increment(1);

	let welcome = pb::Welcome {
		server_name: format!("parley-server/{}", env!("CARGO_PKG_VERSION")),
		server_instance_id: settings.server_instance_id.clone(),
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: settings.max_frame_bytes,
		participant_id: participant.get(),
	};

	send_envelope(
		&mut control_send,
		envelope(String::new(), pb::envelope::Msg::Welcome(welcome)),
	)
	.await
	.context("send Welcome")?;

	// The events stream is client-opened after the first successful Join;
	// anything fanned in before that is buffered and flushed on open.
	let events_send: Arc<Mutex<Option<quinn::SendStream>>> = Arc::new(Mutex::new(None));
	let pending_events: Arc<Mutex<Vec<pb::EventEnvelope>>> = Arc::new(Mutex::new(Vec::new()));

	let (fan_in_tx, mut fan_in_rx) = mpsc::channel::<(ConversationKey, ChannelItem)>(settings.fan_in_channel_capacity);

	let events_send_for_task = Arc::clone(&events_send);
	let pending_for_task = Arc::clone(&pending_events);

	let events_task = tokio::spawn(async move {
		loop {
			let Some((channel, item)) = fan_in_rx.recv().await else {
				return Ok::<(), anyhow::Error>(());
			};

			let event = match item {
				ChannelItem::Message(message) => pb::EventEnvelope {
					channel: channel.channel(),
					server_time_unix_ms: unix_ms_now(),
					event: Some(pb::event_envelope::Event::MessageDelivered(pb::MessageDelivered {
						message: Some(message_to_pb(&message)),
					})),
				},
				ChannelItem::Lagged { dropped } => {
					warn!(conn_id, channel = %channel, dropped, "subscriber queue overflowed; deliveries were dropped");
					metrics::counter!("parley_server_events_dropped_total").increment(dropped);
					pb::EventEnvelope {
						channel: channel.channel(),
						server_time_unix_ms: unix_ms_now(),
						event: Some(pb::event_envelope::Event::ChannelLagged(pb::ChannelLagged {
							dropped,
							detail: "subscriber queue full".to_string(),
						})),
					}
				}
			};

			let mut guard = events_send_for_task.lock().await;
			let Some(send) = guard.as_mut() else {
				pending_for_task.lock().await.push(event);
				continue;
			};

			{
				let mut pending = pending_for_task.lock().await;
				for earlier in pending.drain(..) {
					let frame = event_envelope_frame(earlier)?;
					metrics::counter!("parley_server_events_out_total").increment(1);
					send.write_all(&frame).await.context("events stream write (buffered)")?;
				}
			}

			let frame = event_envelope_frame(event)?;
			metrics::counter!("parley_server_events_out_total").increment(1);
			send.write_all(&frame).await.context("events stream write")?;
		}
	});

	let mut rate_limiter = SendRateLimiter::new(&settings);
	let mut channel_tasks: HashMap<ConversationKey, tokio::task::JoinHandle<()>> = HashMap::new();

	let loop_result = async {
		while let Some(env) = ctrl_rx.recv().await {
			let Some(msg) = env.msg else { continue };

			match msg {
				pb::envelope::Msg::Ping(ping) => {
					let pong = pb::Pong {
						client_time_unix_ms: ping.client_time_unix_ms,
						server_time_unix_ms: unix_ms_now(),
					};

					send_envelope(&mut control_send, envelope(env.request_id, pb::envelope::Msg::Pong(pong))).await?;
				}

				pb::envelope::Msg::Join(join) => {
					metrics::counter!("parley_server_join_requests_total").increment(1);

					let result = match ConversationKey::parse(&join.channel) {
						Err(e) => pb::JoinResult {
							channel: join.channel.clone(),
							status: pb::join_result::Status::InvalidChannel as i32,
							detail: e.to_string(),
						},
						Ok(key) if !key.includes(participant) => {
							warn!(conn_id, participant = %participant, channel = %key, "join refused");
							pb::JoinResult {
								channel: join.channel.clone(),
								status: pb::join_result::Status::NotAuthorized as i32,
								detail: "not authorized for this channel".to_string(),
							}
						}
						Ok(key) => {
							let newly_joined = services.registry.write().await.record_join(conn_id, key);
							if newly_joined {
								let mut rx = services.hub.subscribe(key, conn_id).await;
								let tx = fan_in_tx.clone();
								let handle = tokio::spawn(async move {
									while let Some(item) = rx.recv().await {
										if tx.send((key, item)).await.is_err() {
											break;
										}
									}
								});
								if let Some(old) = channel_tasks.insert(key, handle) {
									old.abort();
								}

								debug!(conn_id, channel = %key, "joined channel");
								pb::JoinResult {
									channel: join.channel.clone(),
									status: pb::join_result::Status::Ok as i32,
									detail: String::new(),
								}
							} else {
								pb::JoinResult {
									channel: join.channel.clone(),
									status: pb::join_result::Status::AlreadyJoined as i32,
									detail: "already joined".to_string(),
								}
							}
						}
					};

					let joined_ok = result.status == pb::join_result::Status::Ok as i32;
					send_envelope(
						&mut control_send,
						envelope(env.request_id, pb::envelope::Msg::JoinResult(result)),
					)
					.await?;

					if joined_ok {
						let mut guard = events_send.lock().await;
						if guard.is_none() {
							info!(conn_id, "waiting to accept events bidirectional stream (client-opened; after JoinResult)");
							let (send, _recv) = connection.accept_bi().await.context("accept events bidirectional stream")?;
							info!(conn_id, "accepted events bidirectional stream (server will only write)");
							*guard = Some(send);
						}

						if let Some(send) = guard.as_mut() {
							let mut pending = pending_events.lock().await;
							for event in pending.drain(..) {
								let frame = event_envelope_frame(event)?;
								metrics::counter!("parley_server_events_out_total").increment(1);
								send.write_all(&frame).await.context("events stream write (on open)")?;
							}
						}
					}
				}

				pb::envelope::Msg::Leave(leave) => {
					metrics::counter!("parley_server_leave_requests_total").increment(1);

					let result = match ConversationKey::parse(&leave.channel) {
						Err(e) => pb::LeaveResult {
							channel: leave.channel.clone(),
							status: pb::leave_result::Status::InvalidChannel as i32,
							detail: e.to_string(),
						},
						Ok(key) => {
							let was_joined = services.registry.write().await.record_leave(conn_id, &key);

							// Hub and forwarder cleanup are unconditional;
							// NotJoined only reflects the registry.
							services.hub.unsubscribe(key, conn_id).await;
							if let Some(handle) = channel_tasks.remove(&key) {
								handle.abort();
							}

							if was_joined {
								debug!(conn_id, channel = %key, "left channel");
								pb::LeaveResult {
									channel: leave.channel.clone(),
									status: pb::leave_result::Status::Ok as i32,
									detail: String::new(),
								}
							} else {
								pb::LeaveResult {
									channel: leave.channel.clone(),
									status: pb::leave_result::Status::NotJoined as i32,
									detail: "not joined".to_string(),
								}
							}
						}
					};

					send_envelope(
						&mut control_send,
						envelope(env.request_id, pb::envelope::Msg::LeaveResult(result)),
					)
					.await?;
				}

				pb::envelope::Msg::SendMessage(send_msg) => {
					let result = handle_send_message(conn_id, participant, send_msg, &services, &mut rate_limiter).await;
					send_envelope(
						&mut control_send,
						envelope(env.request_id, pb::envelope::Msg::SendResult(result)),
					)
					.await?;
				}

				pb::envelope::Msg::FetchHistory(fetch) => {
					let result = handle_fetch_history(conn_id, participant, fetch, &services.store).await;
					send_envelope(
						&mut control_send,
						envelope(env.request_id, pb::envelope::Msg::History(result)),
					)
					.await?;
				}

				pb::envelope::Msg::MarkRead(mark) => {
					let result = handle_mark_read(conn_id, participant, mark, &services.store).await;
					send_envelope(
						&mut control_send,
						envelope(env.request_id, pb::envelope::Msg::MarkReadResult(result)),
					)
					.await?;
				}

				pb::envelope::Msg::FetchAlerts(_) => {
					metrics::counter!("parley_server_alert_requests_total").increment(1);
					let bundle = services.alerts.assemble(participant).await;
					send_envelope(
						&mut control_send,
						envelope(env.request_id, pb::envelope::Msg::Alerts(alerts_to_pb(bundle))),
					)
					.await?;
				}

				pb::envelope::Msg::Hello(_) => {
					debug!(conn_id, "ignoring duplicate Hello");
				}

				other => {
					warn!(conn_id, "unhandled control message: {:?}", other);
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	{
		let (removed, remaining) = {
			let mut registry = services.registry.write().await;
			let removed = registry.remove_session(conn_id);
			(removed, registry.subscription_count())
		};
		if !removed.is_empty() {
			debug!(
				conn_id,
				channels = removed.len(),
				remaining,
				"connection closing, dropping subscriptions"
			);
		}
		services.hub.remove_session(conn_id).await;
	}

	for (_, handle) in channel_tasks.drain() {
		handle.abort();
	}
	drop(fan_in_tx);

	let _ = reader_task.await;
	let _ = events_task.await;

	loop_result
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<(u32, pb::Hello)> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let pb::envelope::Msg::Hello(hello) = msg {
			return Ok((env.version, hello));
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

fn authenticate(conn_id: u64, settings: &ConnectionSettings, hello: &pb::Hello) -> Option<ParticipantId> {
	if let Some(secret) = settings.auth_hmac_secret.as_ref() {
		let token = hello.auth_token.trim();
		if token.is_empty() {
			warn!(conn_id, "unauthenticated: no auth token provided");
			return None;
		}

		let claims = match verify_hmac_token(token, secret.expose()) {
			Ok(claims) => claims,
			Err(error) => {
				warn!(conn_id, %error, "auth token rejected");
				return None;
			}
		};

		match claims.sub.parse::<ParticipantId>() {
			Ok(participant) => Some(participant),
			Err(error) => {
				warn!(conn_id, %error, sub = %claims.sub, "auth token subject is not a participant id");
				None
			}
		}
	} else {
		match ParticipantId::new(hello.participant_id) {
			Ok(participant) => Some(participant),
			Err(error) => {
				warn!(conn_id, %error, "hello carried no usable participant id");
				None
			}
		}
	}
}

async fn handle_send_message(
	conn_id: u64,
	sender: ParticipantId,
	cmd: pb::SendMessage,
	services: &GatewayServices,
	rate_limiter: &mut SendRateLimiter,
) -> pb::SendResult {
	metrics::counter!("parley_server_send_requests_total").increment(1);

	if !rate_limiter.allow_connection() {
		metrics::counter!("parley_server_sends_rate_limited_total").increment(1);
		metrics::counter!("parley_server_sends_rate_limited_connection_total").increment(1);
		return pb::SendResult {
			status: pb::send_result::Status::RateLimited as i32,
			detail: "rate limited".to_string(),
			message: None,
		};
	}

	let receiver = match ParticipantId::new(cmd.to) {
		Ok(receiver) => receiver,
		Err(e) => {
			metrics::counter!("parley_server_sends_invalid_total").increment(1);
			return pb::SendResult {
				status: pb::send_result::Status::InvalidMessage as i32,
				detail: e.to_string(),
				message: None,
			};
		}
	};

	let key = match ConversationKey::between(sender, receiver) {
		Ok(key) => key,
		Err(e) => {
			metrics::counter!("parley_server_sends_invalid_total").increment(1);
			return pb::SendResult {
				status: pb::send_result::Status::InvalidMessage as i32,
				detail: e.to_string(),
				message: None,
			};
		}
	};

	if !rate_limiter.allow_channel(key) {
		metrics::counter!("parley_server_sends_rate_limited_total").increment(1);
		metrics::counter!("parley_server_sends_rate_limited_channel_total").increment(1);
		return pb::SendResult {
			status: pb::send_result::Status::RateLimited as i32,
			detail: "rate limited".to_string(),
			message: None,
		};
	}

	let body = match MessageBody::new(Some(cmd.text), Some(cmd.attachment_ref)) {
		Ok(body) => body,
		Err(e) => {
			metrics::counter!("parley_server_sends_invalid_total").increment(1);
			return pb::SendResult {
				status: pb::send_result::Status::InvalidMessage as i32,
				detail: e.to_string(),
				message: None,
			};
		}
	};

	// Fan-out happens only once the store has accepted the message, so a
	// delivered event always refers to a durable row.
	let stored = match services.store.append(sender, receiver, body).await {
		Ok(stored) => stored,
		Err(StoreError::InvalidConversation(e)) => {
			metrics::counter!("parley_server_sends_invalid_total").increment(1);
			return pb::SendResult {
				status: pb::send_result::Status::InvalidMessage as i32,
				detail: e.to_string(),
				message: None,
			};
		}
		Err(error) => {
			error!(conn_id, %error, "message append failed");
			metrics::counter!("parley_server_storage_errors_total").increment(1);
			return pb::SendResult {
				status: pb::send_result::Status::StorageError as i32,
				detail: "storage unavailable".to_string(),
				message: None,
			};
		}
	};

	services.hub.publish(key, stored.clone(), Some(conn_id)).await;
	metrics::counter!("parley_server_messages_sent_total").increment(1);

	pb::SendResult {
		status: pb::send_result::Status::Ok as i32,
		detail: String::new(),
		message: Some(message_to_pb(&stored)),
	}
}

async fn handle_fetch_history(
	conn_id: u64,
	caller: ParticipantId,
	fetch: pb::FetchHistory,
	store: &MessageStore,
) -> pb::History {
	metrics::counter!("parley_server_history_requests_total").increment(1);

	let other = match ParticipantId::new(fetch.with_participant_id) {
		Ok(other) => other,
		Err(e) => {
			return pb::History {
				status: pb::history::Status::InvalidParticipant as i32,
				detail: e.to_string(),
				messages: Vec::new(),
			};
		}
	};

	let key = match ConversationKey::between(caller, other) {
		Ok(key) => key,
		Err(e) => {
			return pb::History {
				status: pb::history::Status::InvalidParticipant as i32,
				detail: e.to_string(),
				messages: Vec::new(),
			};
		}
	};

	match store.history(key).await {
		Ok(messages) => pb::History {
			status: pb::history::Status::Ok as i32,
			detail: String::new(),
			messages: messages.iter().map(message_to_pb).collect(),
		},
		Err(error) => {
			error!(conn_id, %error, channel = %key, "history fetch failed");
			metrics::counter!("parley_server_storage_errors_total").increment(1);
			pb::History {
				status: pb::history::Status::StorageError as i32,
				detail: "storage unavailable".to_string(),
				messages: Vec::new(),
			}
		}
	}
}

async fn handle_mark_read(
	conn_id: u64,
	caller: ParticipantId,
	mark: pb::MarkRead,
	store: &MessageStore,
) -> pb::MarkReadResult {
	metrics::counter!("parley_server_mark_read_requests_total").increment(1);

	match store.mark_read(MessageId(mark.message_id), caller).await {
		Ok(updated) => pb::MarkReadResult {
			status: pb::mark_read_result::Status::Ok as i32,
			detail: String::new(),
			updated,
		},
		Err(StoreError::NotFound(_)) => pb::MarkReadResult {
			status: pb::mark_read_result::Status::NotFound as i32,
			detail: "no such message".to_string(),
			updated: false,
		},
		Err(StoreError::NotReceiver(_)) => pb::MarkReadResult {
			status: pb::mark_read_result::Status::NotAuthorized as i32,
			detail: "only the receiver can mark a message read".to_string(),
			updated: false,
		},
		Err(error) => {
			error!(conn_id, %error, message_id = mark.message_id, "mark-read failed");
			metrics::counter!("parley_server_storage_errors_total").increment(1);
			pb::MarkReadResult {
				status: pb::mark_read_result::Status::StorageError as i32,
				detail: "storage unavailable".to_string(),
				updated: false,
			}
		}
	}
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("parley_server_envelopes_out_total").increment(1);
	metrics::counter!("parley_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

/// Sends a terminal protocol error and holds the stream open until the peer
/// has it. The caller drops the connection right after, which would discard
/// an unacknowledged frame.
async fn send_refusal(send: &mut quinn::SendStream, code: &str, message: String) {
	let refusal = envelope(
		String::new(),
		pb::envelope::Msg::Error(pb::Error {
			code: code.to_string(),
			message,
		}),
	);

	if send_envelope(send, refusal).await.is_err() {
		return;
	}

	let _ = send.finish();
	let _ = tokio::time::timeout(Duration::from_secs(2), send.stopped()).await;
}
