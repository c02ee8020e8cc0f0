#![forbid(unsafe_code)]

use std::net::SocketAddr;

use parley_client_core::{ClientConfigV1, DEFAULT_SERVER_ENDPOINT_QUIC, SessionControl, channel_with};
use parley_protocol::pb;
use tokio::io::AsyncBufReadExt as _;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_client --me <id> --peer <id> [--connect quic://host:port] [--addr ip:port] [--sni name] [--token tok]\n\
\n\
Options:\n\
	--me        Own participant id (positive integer; required)\n\
	--peer      Conversation partner's participant id (required)\n\
	--connect   Server endpoint (alias: --endpoint) (default: {DEFAULT_SERVER_ENDPOINT_QUIC})\n\
	            Format: quic://host:port\n\
	--endpoint  Alias for --connect\n\
	--addr      Server SocketAddr (overrides DNS resolution from --connect)\n\
	            Default: derived from --connect (or the default endpoint)\n\
	--sni       TLS server name/SNI (overrides the host from --connect)\n\
	            Default: derived from --connect host\n\
	--token     Signed auth token (default: PARLEY_CLIENT_AUTH_TOKEN env var)\n\
	--help      Show this help\n\
\n\
Notes:\n\
	Delivered messages arrive over a second bidirectional QUIC stream.\n\
	Typed lines are sent to the peer; commands: /history /alerts /read <id> /quit\n\
\n\
Examples:\n\
	parley_client --me 3 --peer 8 --connect quic://127.0.0.1:18403\n\
	parley_client --me 3 --peer 8 --connect quic://parley.example.net:443 --token v1.abc.def\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	addr: SocketAddr,
	sni: String,
	me: i64,
	peer: i64,
	token: Option<String>,
}

fn parse_args() -> Args {
	let mut endpoint: String = DEFAULT_SERVER_ENDPOINT_QUIC.to_string();

	let mut addr_override: Option<SocketAddr> = None;
	let mut sni_override: Option<String> = None;

	let mut me: Option<i64> = None;
	let mut peer: Option<i64> = None;
	let mut token: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: SocketAddr = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				});
				addr_override = Some(parsed);
			}
			"--sni" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--sni must be non-empty");
					usage_and_exit();
				}
				sni_override = Some(v);
			}
			"--me" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: i64 = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --me value (expected a positive integer): {v}");
					usage_and_exit()
				});
				me = Some(parsed);
			}
			"--peer" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: i64 = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --peer value (expected a positive integer): {v}");
					usage_and_exit()
				});
				peer = Some(parsed);
			}
			"--token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--token must be non-empty");
					usage_and_exit();
				}
				token = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(me) = me else {
		eprintln!("--me is required");
		usage_and_exit();
	};
	let Some(peer) = peer else {
		eprintln!("--peer is required");
		usage_and_exit();
	};

	let (host, port) = ClientConfigV1::parse_quic_endpoint(&endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --endpoint value: {endpoint}\n{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = addr_override.unwrap_or_else(|| {
		// Placeholder when host isn't an IP literal; DNS resolves during connect.
		let ip_try: Result<SocketAddr, _> = format!("{host}:{port}").parse();
		ip_try.unwrap_or_else(|_| "0.0.0.0:0".parse().expect("valid placeholder addr"))
	});

	let sni: String = sni_override.unwrap_or(host);

	Args {
		addr,
		sni,
		me,
		peer,
		token,
	}
}

fn print_message(prefix: &str, m: &pb::Message) {
	let flag = if m.read { "read" } else { "unread" };
	if m.attachment_ref.is_empty() {
		println!("{prefix}#{} {} -> {} [{flag}] {}", m.id, m.sender_id, m.receiver_id, m.text);
	} else {
		println!(
			"{prefix}#{} {} -> {} [{flag}] {} (attachment: {})",
			m.id, m.sender_id, m.receiver_id, m.text, m.attachment_ref
		);
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfigV1 {
		server_host: args.sni.clone(),
		server_port: args.addr.port(),
		server_addr: if args.addr.ip().is_unspecified() && args.addr.port() == 0 {
			None
		} else {
			Some(args.addr)
		},
		client_name: format!("parley-client-cli/{}", env!("CARGO_PKG_VERSION")),
		client_instance_id: format!("cli-{}", std::process::id()),
		auth_token: args.token.or_else(|| {
			std::env::var("PARLEY_CLIENT_AUTH_TOKEN").ok().and_then(|v| {
				let v = v.trim().to_string();
				(!v.is_empty()).then_some(v)
			})
		}),
		participant_id: args.me,
		..ClientConfigV1::default()
	};

	let resolved = cfg.server_addr.map(|a| a.to_string()).unwrap_or_else(|| "<dns>".to_string());
	info!(server = %resolved, sni = %cfg.server_host, me = args.me, peer = args.peer, "connecting");

	let channel = channel_with(args.me, args.peer)?;

	let (mut control, welcome) = SessionControl::connect(cfg).await?;
	info!(participant_id = welcome.participant_id, channel = %channel, "authenticated; joining");

	let joined = control.join(&channel).await?;
	if joined.status != (pb::join_result::Status::Ok as i32) {
		control.close(0, "join refused");
		anyhow::bail!("join refused for {channel}: {}", joined.detail);
	}

	let mut events = control.open_events_stream().await?;
	let events_task = tokio::spawn(async move {
		let result = events
			.run_events_loop(|ev| match ev.event {
				Some(pb::event_envelope::Event::MessageDelivered(d)) => {
					if let Some(m) = d.message.as_ref() {
						print_message(&format!("[{}] ", ev.channel), m);
					}
				}
				Some(pb::event_envelope::Event::ChannelLagged(l)) => {
					warn!(channel = %ev.channel, dropped = l.dropped, "events lagged: {}", l.detail);
				}
				None => {}
			})
			.await;
		if let Err(e) = result {
			warn!("events loop ended: {e:#}");
		}
	});

	println!("joined {channel}; type a message, or /history /alerts /read <id> /quit");

	let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await? {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		if line == "/quit" {
			break;
		}

		if line == "/history" {
			let h = control.fetch_history(args.peer).await?;
			if h.status != (pb::history::Status::Ok as i32) {
				warn!("history failed: {}", h.detail);
				continue;
			}
			for m in &h.messages {
				print_message("  ", m);
			}
			continue;
		}

		if line == "/alerts" {
			let a = control.fetch_alerts().await?;
			for fr in &a.friend_requests {
				println!("  friend request from {} at {}", fr.from_participant_id, fr.requested_at_unix_ms);
			}
			for m in &a.unread_messages {
				print_message("  unread ", m);
			}
			for f in &a.recent_followers {
				println!("  new follower {} at {}", f.follower_id, f.followed_at_unix_ms);
			}
			if !a.failed_sections.is_empty() {
				warn!("alert sections unavailable: {}", a.failed_sections.join(", "));
			}
			continue;
		}

		if let Some(rest) = line.strip_prefix("/read ") {
			let Ok(message_id) = rest.trim().parse::<i64>() else {
				eprintln!("usage: /read <message id>");
				continue;
			};
			let r = control.mark_read(message_id).await?;
			if r.status == (pb::mark_read_result::Status::Ok as i32) {
				println!("  marked #{message_id} read (updated: {})", r.updated);
			} else {
				warn!("mark read failed: {}", r.detail);
			}
			continue;
		}

		let sent = control.send_message(args.peer, line, None).await?;
		if sent.status == (pb::send_result::Status::Ok as i32) {
			if let Some(m) = sent.message.as_ref() {
				print_message("sent ", m);
			}
		} else {
			warn!("send failed: {}", sent.detail);
		}
	}

	control.close(0, "client exit");
	events_task.abort();
	let _ = events_task.await;

	Ok(())
}
