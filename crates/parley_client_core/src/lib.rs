#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use parley_domain::{ConversationKey, ParticipantId};
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use parley_protocol::{pb, version};
use parley_util::endpoint::{DEFAULT_PORT, QuicEndpoint};
use quinn::{ClientConfig, Endpoint, TransportConfig, VarInt};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info, warn};

/// Default server endpoint for the standalone client.
pub const DEFAULT_SERVER_ENDPOINT_QUIC: &str = "quic://127.0.0.1:18403";

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfigV1 {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Client identifier.
	pub client_name: String,

	/// Client instance id.
	pub client_instance_id: String,

	/// Signed auth token; required against gateways that verify identity.
	pub auth_token: Option<String>,

	/// Identity to claim against a dev gateway with no token verification.
	pub participant_id: i64,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfigV1 {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok((e.host, e.port))
	}

	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfigV1 {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: DEFAULT_PORT,
			server_addr: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT)),
			client_name: format!("parley-client-core/{}", env!("CARGO_PKG_VERSION")),
			client_instance_id: uuid::Uuid::new_v4().to_string(),
			auth_token: None,
			participant_id: 0,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Canonical conversation channel id between two participants, as accepted
/// by the gateway's Join operation.
pub fn channel_with(me: i64, peer: i64) -> Result<String, ClientCoreError> {
	let me = ParticipantId::new(me).map_err(|e| ClientCoreError::Protocol(e.to_string()))?;
	let peer = ParticipantId::new(peer).map_err(|e| ClientCoreError::Protocol(e.to_string()))?;
	let key = ConversationKey::between(me, peer).map_err(|e| ClientCoreError::Protocol(e.to_string()))?;
	Ok(key.channel())
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types, server refusal).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Control half of a session (join/leave, sends, fetches, close).
pub struct SessionControl {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	control_recv: quinn::RecvStream,
	max_frame_bytes: usize,
	request_seq: u64,
	events_opened: bool,
}

/// Events reader half of a session.
pub struct SessionEvents {
	events_recv: quinn::RecvStream,
	// Keep the send half alive so the peer doesn't see an immediate FIN.
	_events_send_keepalive: quinn::SendStream,
	max_frame_bytes: usize,
}

impl SessionControl {
	/// Connect and perform the v1 handshake.
	pub async fn connect(cfg: ClientConfigV1) -> Result<(Self, pb::Welcome), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;

		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?;

				let addrs: Vec<SocketAddr> = addrs.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (mut control_send, mut control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		let hello = pb::Hello {
			client_name: cfg.client_name,
			client_instance_id: cfg.client_instance_id,
			auth_token: cfg.auth_token.unwrap_or_default(),
			participant_id: cfg.participant_id,
		};
		let env = pb::Envelope {
			version: version::PROTOCOL_VERSION_U32,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::Hello(hello)),
		};
		write_envelope(&mut control_send, &env, cfg.max_frame_bytes)
			.await
			.map_err(|e| ClientCoreError::Io(format!("send Hello failed: {e}")))?;

		let welcome_env = tokio::time::timeout(connect_timeout, read_one_envelope(&mut control_recv, cfg.max_frame_bytes))
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match welcome_env.msg {
			Some(pb::envelope::Msg::Welcome(w)) => w,
			other => return Err(unexpected("Welcome", other)),
		};

		debug!(
			server_name = %welcome.server_name,
			server_instance_id = %welcome.server_instance_id,
			participant_id = welcome.participant_id,
			max_frame_bytes = welcome.max_frame_bytes,
			"received Welcome"
		);

		let control = Self {
			conn,
			control_send,
			control_recv,
			max_frame_bytes: (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes),
			request_seq: 0,
			events_opened: false,
		};

		Ok((control, welcome))
	}

	/// Join a conversation channel (`chat.<low>.<high>`).
	pub async fn join(&mut self, channel: &str) -> Result<pb::JoinResult, ClientCoreError> {
		debug!(channel, "sending join");
		let resp = self
			.request(pb::envelope::Msg::Join(pb::Join {
				channel: channel.to_string(),
			}))
			.await?;

		match resp.msg {
			Some(pb::envelope::Msg::JoinResult(r)) => Ok(r),
			other => Err(unexpected("JoinResult", other)),
		}
	}

	/// Leave a conversation channel.
	pub async fn leave(&mut self, channel: &str) -> Result<pb::LeaveResult, ClientCoreError> {
		debug!(channel, "sending leave");
		let resp = self
			.request(pb::envelope::Msg::Leave(pb::Leave {
				channel: channel.to_string(),
			}))
			.await?;

		match resp.msg {
			Some(pb::envelope::Msg::LeaveResult(r)) => Ok(r),
			other => Err(unexpected("LeaveResult", other)),
		}
	}

	/// Send a direct message to another participant.
	pub async fn send_message(
		&mut self,
		to: i64,
		text: &str,
		attachment_ref: Option<&str>,
	) -> Result<pb::SendResult, ClientCoreError> {
		let resp = self
			.request(pb::envelope::Msg::SendMessage(pb::SendMessage {
				to,
				text: text.to_string(),
				attachment_ref: attachment_ref.unwrap_or_default().to_string(),
			}))
			.await?;

		match resp.msg {
			Some(pb::envelope::Msg::SendResult(r)) => Ok(r),
			other => Err(unexpected("SendResult", other)),
		}
	}

	/// Fetch the stored conversation with one other participant.
	pub async fn fetch_history(&mut self, with_participant_id: i64) -> Result<pb::History, ClientCoreError> {
		let resp = self
			.request(pb::envelope::Msg::FetchHistory(pb::FetchHistory { with_participant_id }))
			.await?;

		match resp.msg {
			Some(pb::envelope::Msg::History(h)) => Ok(h),
			other => Err(unexpected("History", other)),
		}
	}

	/// Mark one received message as read.
	pub async fn mark_read(&mut self, message_id: i64) -> Result<pb::MarkReadResult, ClientCoreError> {
		let resp = self
			.request(pb::envelope::Msg::MarkRead(pb::MarkRead { message_id }))
			.await?;

		match resp.msg {
			Some(pb::envelope::Msg::MarkReadResult(r)) => Ok(r),
			other => Err(unexpected("MarkReadResult", other)),
		}
	}

	/// Pull the current alert bundle for this session's participant.
	pub async fn fetch_alerts(&mut self) -> Result<pb::Alerts, ClientCoreError> {
		let resp = self.request(pb::envelope::Msg::FetchAlerts(pb::FetchAlerts {})).await?;

		match resp.msg {
			Some(pb::envelope::Msg::Alerts(a)) => Ok(a),
			other => Err(unexpected("Alerts", other)),
		}
	}

	/// Send a keepalive ping and await the pong response.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<pb::Pong, ClientCoreError> {
		let resp = self
			.request(pb::envelope::Msg::Ping(pb::Ping { client_time_unix_ms }))
			.await?;

		match resp.msg {
			Some(pb::envelope::Msg::Pong(p)) => Ok(p),
			other => Err(unexpected("Pong", other)),
		}
	}

	async fn request(&mut self, msg: pb::envelope::Msg) -> Result<pb::Envelope, ClientCoreError> {
		self.request_seq += 1;
		let env = pb::Envelope {
			version: version::PROTOCOL_VERSION_U32,
			request_id: self.request_seq.to_string(),
			msg: Some(msg),
		};

		write_envelope(&mut self.control_send, &env, self.max_frame_bytes).await?;
		read_one_envelope(&mut self.control_recv, self.max_frame_bytes).await
	}

	/// Open the events stream after the first successful join.
	pub async fn open_events_stream(&mut self) -> Result<SessionEvents, ClientCoreError> {
		if self.events_opened {
			return Err(ClientCoreError::Protocol(
				"events stream already opened; reuse the existing SessionEvents".to_string(),
			));
		}

		debug!("open_events_stream(): opening events stream (client open_bi)");
		let (mut send, recv) = self
			.conn
			.open_bi()
			.await
			.map_err(|e| ClientCoreError::Io(format!("open_bi(events) failed: {e}")))?;
		debug!("open_events_stream(): opened events stream (client open_bi succeeded)");

		// Force a STREAM frame so the server observes the stream promptly.
		send.write_all(&[0u8])
			.await
			.map_err(|e| ClientCoreError::Io(format!("failed to write events stream activation byte: {e}")))?;
		send.flush()
			.await
			.map_err(|e| ClientCoreError::Io(format!("failed to flush events stream activation byte: {e}")))?;

		self.events_opened = true;

		Ok(SessionEvents {
			events_recv: recv,
			_events_send_keepalive: send,
			max_frame_bytes: self.max_frame_bytes,
		})
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(quinn::VarInt::from_u32(code), reason.as_bytes());
	}
}

impl SessionEvents {
	/// Run the events loop until EOF or error.
	pub async fn run_events_loop<F>(&mut self, mut on_event: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(pb::EventEnvelope),
	{
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match self.events_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					info!("events stream closed");
					return Ok(());
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			};

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, self.max_frame_bytes) {
					Ok(Some(env)) => {
						if let Some(msg) = env.msg {
							match msg {
								pb::envelope::Msg::Event(ev) => {
									debug!(
										channel = %ev.channel,
										event_kind = %event_kind(&ev),
										"events stream decoded"
									);
									on_event(ev)
								}
								other => warn!("unexpected message on events stream: {:?}", other),
							}
						}
					}
					Ok(None) => break,
					Err(e) => return Err(ClientCoreError::Framing(e)),
				}
			}
		}
	}
}

fn unexpected(expected: &str, got: Option<pb::envelope::Msg>) -> ClientCoreError {
	match got {
		Some(pb::envelope::Msg::Error(e)) => {
			ClientCoreError::Protocol(format!("server error {}: {}", e.code, e.message))
		}
		other => ClientCoreError::Protocol(format!("expected {expected}, got {other:?}")),
	}
}

async fn write_envelope(
	send: &mut quinn::SendStream,
	env: &pb::Envelope,
	max_frame_bytes: usize,
) -> Result<(), ClientCoreError> {
	let frame = encode_frame(env, max_frame_bytes).map_err(ClientCoreError::Framing)?;
	send.write_all(&frame).await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	send.flush().await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	Ok(())
}

fn event_kind(ev: &pb::EventEnvelope) -> &'static str {
	match ev.event.as_ref() {
		Some(pb::event_envelope::Event::MessageDelivered(_)) => "message_delivered",
		Some(pb::event_envelope::Event::ChannelLagged(_)) => "channel_lagged",
		None => "empty",
	}
}

async fn read_one_envelope(recv: &mut quinn::RecvStream, max_frame_bytes: usize) -> Result<pb::Envelope, ClientCoreError> {
	let mut buf = BytesMut::with_capacity(8 * 1024);
	let mut tmp = [0u8; 8192];

	loop {
		// Try decoding first in case buffer already has a full frame.
		match try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, max_frame_bytes) {
			Ok(Some(env)) => return Ok(env),
			Ok(None) => {}
			Err(e) => return Err(ClientCoreError::Framing(e)),
		}

		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => {
				return Err(ClientCoreError::Protocol(
					"stream closed before receiving full message".to_string(),
				));
			}
			Err(e) => return Err(ClientCoreError::Io(e.to_string())),
		};

		buf.extend_from_slice(&tmp[..n]);
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = "0.0.0.0:0".parse().context("parse client bind addr")?;
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![b"parley-v1".to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = ClientConfig::new(Arc::new(quic_tls));

	// Allow multiple streams (control + events at minimum).
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(64));
	transport.max_concurrent_uni_streams(VarInt::from_u32(64));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientConfigV1::default();
		assert_eq!(cfg.server_host, "localhost");
		assert_eq!(cfg.server_port, DEFAULT_PORT);
		assert!(cfg.max_frame_bytes > 0);
		assert!(!cfg.client_instance_id.is_empty());
	}

	#[test]
	fn channel_with_is_commutative() {
		assert_eq!(channel_with(8, 3).unwrap(), "chat.3.8");
		assert_eq!(channel_with(3, 8).unwrap(), "chat.3.8");
		assert!(channel_with(5, 5).is_err());
		assert!(channel_with(0, 7).is_err());
	}
}
