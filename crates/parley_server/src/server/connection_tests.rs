#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_client_core::{ClientConfigV1, SessionControl, channel_with};
use parley_domain::ParticipantId;
use parley_protocol::pb;
use parley_util::SecretString;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, warn};

use crate::quic::config::QuicServerConfig;
use crate::server::alerts::{AlertAggregator, AlertsConfig};
use crate::server::auth::mint_hmac_token;
use crate::server::channel_hub::{ChannelHub, ChannelHubConfig};
use crate::server::connection::{ConnectionSettings, GatewayServices, handle_connection};
use crate::server::social::{InMemorySocialBackend, SocialDirectory};
use crate::server::state::SessionRegistry;
use crate::server::store::MessageStore;
use crate::util::time::unix_secs_now;

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());
}

fn pid(id: i64) -> ParticipantId {
	ParticipantId::new(id).expect("valid participant id")
}

fn test_services(social: SocialDirectory) -> GatewayServices {
	let store = MessageStore::in_memory();
	GatewayServices {
		registry: Arc::new(RwLock::new(SessionRegistry::default())),
		hub: ChannelHub::new(ChannelHubConfig::default()),
		store: store.clone(),
		alerts: AlertAggregator::new(store, social, AlertsConfig::default()),
	}
}

async fn run_gateway(
	endpoint: quinn::Endpoint,
	ready_tx: oneshot::Sender<SocketAddr>,
	services: GatewayServices,
	settings: ConnectionSettings,
	max_connections: usize,
) -> anyhow::Result<()> {
	let local_addr = endpoint.local_addr().context("server local_addr")?;
	let _ = ready_tx.send(local_addr);

	let mut handles = Vec::with_capacity(max_connections);

	for idx in 0..max_connections {
		let conn_id = (idx + 1) as u64;
		debug!(conn_id, "waiting for quic connection");
		let Some(connecting) = endpoint.accept().await else {
			return Err(anyhow!("server endpoint closed before accept"));
		};

		let connection = connecting.await.context("accept quic connection")?;
		debug!(conn_id, "accepted quic connection");
		let services = services.clone();
		let settings = settings.clone();

		handles.push((
			conn_id,
			tokio::spawn(async move {
				debug!(conn_id, "connection task started");
				handle_connection(conn_id, connection, services, settings).await
			}),
		));
	}

	let join_timeout = Duration::from_secs(5);
	for (conn_id, mut handle) in handles {
		debug!(conn_id, "joining connection task");
		match tokio::time::timeout(join_timeout, &mut handle).await {
			Ok(join_res) => match join_res {
				Ok(Ok(())) => debug!(conn_id, "connection task finished"),
				Ok(Err(e)) => {
					return Err(e).context(format!("connection task failed (conn_id={conn_id})"));
				}
				Err(e) => {
					return Err(anyhow!(e)).context(format!("connection task panicked (conn_id={conn_id})"));
				}
			},
			Err(_) => {
				warn!(conn_id, "connection task join timed out; aborting");
				handle.abort();
			}
		}
	}

	Ok(())
}

fn client_cfg(server_addr: SocketAddr, instance_id: &str, participant_id: i64) -> ClientConfigV1 {
	ClientConfigV1 {
		server_host: "localhost".to_string(),
		server_port: server_addr.port(),
		server_addr: Some(server_addr),
		client_name: "parley-test-client".to_string(),
		client_instance_id: instance_id.to_string(),
		participant_id,
		..ClientConfigV1::default()
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delivery_reaches_the_peer_but_never_echoes_the_sender() -> anyhow::Result<()> {
	init_rustls_crypto_provider();

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let (endpoint, _cert_der) = quic_cfg.bind_dev_endpoint()?;

	let services = test_services(SocialDirectory::in_memory());

	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();
	let server_task =
		tokio::spawn(async move { run_gateway(endpoint, ready_tx, services, ConnectionSettings::default(), 2).await });

	let mut server_addr = ready_rx.await.context("server ready")?;
	if server_addr.ip().is_unspecified() {
		server_addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
	}

	let channel = channel_with(1, 2)?;

	let (mut receiver, welcome) = SessionControl::connect(client_cfg(server_addr, "receiver", 1))
		.await
		.context("receiver connect")?;
	assert_eq!(welcome.participant_id, 1);

	let joined = receiver.join(&channel).await.context("receiver join")?;
	assert_eq!(joined.status, pb::join_result::Status::Ok as i32);

	let mut receiver_events = receiver.open_events_stream().await.context("receiver events stream")?;
	let (recv_tx, mut recv_rx) = mpsc::channel::<pb::EventEnvelope>(8);
	let receiver_events_task = tokio::spawn(async move {
		receiver_events
			.run_events_loop(|ev| {
				let _ = recv_tx.try_send(ev);
			})
			.await
	});

	let (mut sender, _welcome) = SessionControl::connect(client_cfg(server_addr, "sender", 2))
		.await
		.context("sender connect")?;

	let joined = sender.join(&channel).await.context("sender join")?;
	assert_eq!(joined.status, pb::join_result::Status::Ok as i32);

	let mut sender_events = sender.open_events_stream().await.context("sender events stream")?;
	let (send_tx, mut send_rx) = mpsc::channel::<pb::EventEnvelope>(8);
	let sender_events_task = tokio::spawn(async move {
		sender_events
			.run_events_loop(|ev| {
				let _ = send_tx.try_send(ev);
			})
			.await
	});

	let sent = sender.send_message(1, "hello over there", None).await.context("send")?;
	assert_eq!(sent.status, pb::send_result::Status::Ok as i32, "send failed: {}", sent.detail);
	let stored = sent.message.context("send result carries the stored message")?;
	assert!(stored.id > 0);
	assert_eq!(stored.sender_id, 2);
	assert_eq!(stored.receiver_id, 1);

	let ev = tokio::time::timeout(Duration::from_secs(5), recv_rx.recv())
		.await
		.context("timeout waiting for delivery")?
		.context("events channel closed")?;

	assert_eq!(ev.channel, channel);
	match ev.event {
		Some(pb::event_envelope::Event::MessageDelivered(d)) => {
			let msg = d.message.context("delivered event carries the message")?;
			assert_eq!(msg.id, stored.id);
			assert_eq!(msg.sender_id, 2);
			assert_eq!(msg.text, "hello over there");
		}
		other => anyhow::bail!("expected MessageDelivered, got: {other:?}"),
	}

	// The producing session gets the SendResult only, never a delivery echo.
	let echo = tokio::time::timeout(Duration::from_millis(300), send_rx.recv()).await;
	assert!(echo.is_err(), "sender session saw its own message: {echo:?}");

	receiver_events_task.abort();
	sender_events_task.abort();
	let _ = receiver_events_task.await;
	let _ = sender_events_task.await;

	receiver.close(0, "test done");
	sender.close(0, "test done");
	drop(receiver);
	drop(sender);

	let server_res = server_task.await.context("server join")?;
	server_res.context("server run")?;

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_and_leave_enforce_membership_and_canonical_channels() -> anyhow::Result<()> {
	init_rustls_crypto_provider();

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let (endpoint, _cert_der) = quic_cfg.bind_dev_endpoint()?;

	let services = test_services(SocialDirectory::in_memory());

	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();
	let server_task =
		tokio::spawn(async move { run_gateway(endpoint, ready_tx, services, ConnectionSettings::default(), 1).await });

	let mut server_addr = ready_rx.await.context("server ready")?;
	if server_addr.ip().is_unspecified() {
		server_addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
	}

	let (mut control, _welcome) = SessionControl::connect(client_cfg(server_addr, "outsider", 3))
		.await
		.context("connect")?;

	// Not a participant of chat.1.2; the refusal must not say whether the
	// conversation exists.
	let refused = control.join("chat.1.2").await.context("join other conversation")?;
	assert_eq!(refused.status, pb::join_result::Status::NotAuthorized as i32);
	assert_eq!(refused.detail, "not authorized for this channel");

	// Non-canonical ordering is a parse failure, not a reordering.
	let bad_order = control.join("chat.8.3").await.context("join non-canonical")?;
	assert_eq!(bad_order.status, pb::join_result::Status::InvalidChannel as i32);

	let bad_prefix = control.join("room.3.8").await.context("join bad prefix")?;
	assert_eq!(bad_prefix.status, pb::join_result::Status::InvalidChannel as i32);

	let own = channel_with(3, 8)?;
	let joined = control.join(&own).await.context("join own conversation")?;
	assert_eq!(joined.status, pb::join_result::Status::Ok as i32);

	let events = control.open_events_stream().await.context("open events stream")?;

	let again = control.join(&own).await.context("join twice")?;
	assert_eq!(again.status, pb::join_result::Status::AlreadyJoined as i32);

	let left = control.leave(&own).await.context("leave")?;
	assert_eq!(left.status, pb::leave_result::Status::Ok as i32);

	let left_again = control.leave(&own).await.context("leave twice")?;
	assert_eq!(left_again.status, pb::leave_result::Status::NotJoined as i32);

	drop(events);
	control.close(0, "test done");
	drop(control);

	let server_res = server_task.await.context("server join")?;
	server_res.context("server run")?;

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn history_mark_read_and_alerts_flow() -> anyhow::Result<()> {
	init_rustls_crypto_provider();

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let (endpoint, _cert_der) = quic_cfg.bind_dev_endpoint()?;

	let social_backend = Arc::new(InMemorySocialBackend::default());
	social_backend.add_friend_request(pid(5), pid(2), 111).await;
	social_backend.add_follower(pid(9), pid(2), 222).await;
	let services = test_services(SocialDirectory::with_backend(social_backend));

	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();
	let server_task =
		tokio::spawn(async move { run_gateway(endpoint, ready_tx, services, ConnectionSettings::default(), 2).await });

	let mut server_addr = ready_rx.await.context("server ready")?;
	if server_addr.ip().is_unspecified() {
		server_addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
	}

	let (mut writer, _welcome) = SessionControl::connect(client_cfg(server_addr, "writer", 1))
		.await
		.context("writer connect")?;

	let first = writer.send_message(2, "first", None).await.context("send first")?;
	assert_eq!(first.status, pb::send_result::Status::Ok as i32);
	let first_id = first.message.context("first stored")?.id;

	let second = writer
		.send_message(2, "second", Some("attach://photo-1"))
		.await
		.context("send second")?;
	assert_eq!(second.status, pb::send_result::Status::Ok as i32);

	// Whitespace-only text with no attachment is refused before any write;
	// the history below must still hold exactly two messages.
	let blank = writer.send_message(2, "   ", None).await.context("send blank")?;
	assert_eq!(blank.status, pb::send_result::Status::InvalidMessage as i32);
	assert!(blank.message.is_none());

	let history = writer.fetch_history(2).await.context("fetch history")?;
	assert_eq!(history.status, pb::history::Status::Ok as i32);
	let texts: Vec<&str> = history.messages.iter().map(|m| m.text.as_str()).collect();
	assert_eq!(texts, vec!["first", "second"]);
	assert_eq!(history.messages[1].attachment_ref, "attach://photo-1");

	let self_history = writer.fetch_history(1).await.context("fetch history with self")?;
	assert_eq!(self_history.status, pb::history::Status::InvalidParticipant as i32);

	// Senders cannot mark their own outgoing messages read.
	let not_mine = writer.mark_read(first_id).await.context("mark own message")?;
	assert_eq!(not_mine.status, pb::mark_read_result::Status::NotAuthorized as i32);

	writer.close(0, "writer done");
	drop(writer);

	let (mut reader, _welcome) = SessionControl::connect(client_cfg(server_addr, "reader", 2))
		.await
		.context("reader connect")?;

	let alerts = reader.fetch_alerts().await.context("fetch alerts")?;
	assert!(alerts.failed_sections.is_empty(), "failed sections: {:?}", alerts.failed_sections);
	let unread: Vec<&str> = alerts.unread_messages.iter().map(|m| m.text.as_str()).collect();
	assert_eq!(unread, vec!["second", "first"]);
	assert_eq!(alerts.friend_requests.len(), 1);
	assert_eq!(alerts.friend_requests[0].from_participant_id, 5);
	assert_eq!(alerts.recent_followers.len(), 1);
	assert_eq!(alerts.recent_followers[0].follower_id, 9);

	let marked = reader.mark_read(first_id).await.context("mark read")?;
	assert_eq!(marked.status, pb::mark_read_result::Status::Ok as i32);
	assert!(marked.updated);

	let marked_again = reader.mark_read(first_id).await.context("mark read twice")?;
	assert_eq!(marked_again.status, pb::mark_read_result::Status::Ok as i32);
	assert!(!marked_again.updated);

	let missing = reader.mark_read(9_999).await.context("mark read missing")?;
	assert_eq!(missing.status, pb::mark_read_result::Status::NotFound as i32);

	let alerts = reader.fetch_alerts().await.context("fetch alerts again")?;
	let unread: Vec<&str> = alerts.unread_messages.iter().map(|m| m.text.as_str()).collect();
	assert_eq!(unread, vec!["second"]);

	reader.close(0, "reader done");
	drop(reader);

	let server_res = server_task.await.context("server join")?;
	server_res.context("server run")?;

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hmac_auth_gates_sessions() -> anyhow::Result<()> {
	init_rustls_crypto_provider();

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let (endpoint, _cert_der) = quic_cfg.bind_dev_endpoint()?;

	let services = test_services(SocialDirectory::in_memory());
	let settings = ConnectionSettings {
		auth_hmac_secret: Some(SecretString::new("test-secret")),
		..ConnectionSettings::default()
	};

	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();
	let server_task = tokio::spawn(async move { run_gateway(endpoint, ready_tx, services, settings, 3).await });

	let mut server_addr = ready_rx.await.context("server ready")?;
	if server_addr.ip().is_unspecified() {
		server_addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
	}

	// A valid token authenticates as the token's subject, regardless of the
	// participant id claimed in Hello.
	let token = mint_hmac_token("7", unix_secs_now() + 60, "test-secret");
	let cfg = ClientConfigV1 {
		auth_token: Some(token),
		..client_cfg(server_addr, "token-client", 1)
	};
	let (control, welcome) = SessionControl::connect(cfg).await.context("token connect")?;
	assert_eq!(welcome.participant_id, 7);
	control.close(0, "test done");
	drop(control);

	let err = SessionControl::connect(client_cfg(server_addr, "tokenless", 7))
		.await
		.err()
		.context("tokenless connect must fail")?;
	assert!(err.to_string().contains("UNAUTHENTICATED"), "unexpected error: {err}");

	let cfg = ClientConfigV1 {
		auth_token: Some("v1.bogus.bogus".to_string()),
		..client_cfg(server_addr, "bad-token", 7)
	};
	let err = SessionControl::connect(cfg).await.err().context("bad token must fail")?;
	assert!(err.to_string().contains("UNAUTHENTICATED"), "unexpected error: {err}");

	let server_res = server_task.await.context("server join")?;
	server_res.context("server run")?;

	Ok(())
}
