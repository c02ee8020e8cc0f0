use bytes::BytesMut;
use parley_protocol::pb;
use parley_protocol::version::PROTOCOL_VERSION_U32;
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, decode_frame, encode_frame_default, try_decode_frame_from_buffer};
use proptest::prelude::*;

fn envelope(msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION_U32,
		request_id: String::new(),
		msg: Some(msg),
	}
}

#[test]
fn control_messages_roundtrip() {
	let cases = vec![
		envelope(pb::envelope::Msg::Hello(pb::Hello {
			client_name: "parley-client".to_string(),
			client_instance_id: "it-1".to_string(),
			auth_token: String::new(),
			participant_id: 7,
		})),
		envelope(pb::envelope::Msg::Join(pb::Join {
			channel: "chat.3.7".to_string(),
		})),
		envelope(pb::envelope::Msg::SendResult(pb::SendResult {
			status: pb::send_result::Status::Ok as i32,
			detail: String::new(),
			message: Some(pb::Message {
				id: 12,
				sender_id: 7,
				receiver_id: 3,
				text: "hello there".to_string(),
				attachment_ref: String::new(),
				sent_at_unix_ms: 1_700_000_000_000,
				read: false,
			}),
		})),
		envelope(pb::envelope::Msg::Alerts(pb::Alerts {
			friend_requests: vec![pb::FriendRequestAlert {
				from_participant_id: 9,
				requested_at_unix_ms: 5,
			}],
			unread_messages: Vec::new(),
			recent_followers: vec![pb::FollowerAlert {
				follower_id: 4,
				followed_at_unix_ms: 6,
			}],
			failed_sections: vec!["unread_messages".to_string()],
		})),
	];

	for env in cases {
		let frame = encode_frame_default(&env).expect("encode");
		let (decoded, used) = decode_frame::<pb::Envelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert_eq!(used, frame.len());
		assert_eq!(decoded, env);
	}
}

#[test]
fn event_envelope_roundtrips() {
	let ev = pb::EventEnvelope {
		channel: "chat.1.2".to_string(),
		server_time_unix_ms: 1_700_000_000_123,
		event: Some(pb::event_envelope::Event::MessageDelivered(pb::MessageDelivered {
			message: Some(pb::Message {
				id: 1,
				sender_id: 1,
				receiver_id: 2,
				text: "ping".to_string(),
				attachment_ref: String::new(),
				sent_at_unix_ms: 1_700_000_000_000,
				read: false,
			}),
		})),
	};

	let frame = encode_frame_default(&ev).expect("encode");
	let (decoded, _) = decode_frame::<pb::EventEnvelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(decoded, ev);
}

proptest! {
	#[test]
	fn chunked_stream_decodes_to_original_sequence(
		texts in proptest::collection::vec("[ -~]{0,40}", 1..6),
		step in 1usize..9,
	) {
		let envs: Vec<pb::Envelope> = texts
			.iter()
			.enumerate()
			.map(|(i, t)| {
				envelope(pb::envelope::Msg::SendMessage(pb::SendMessage {
					to: (i + 2) as i64,
					text: t.clone(),
					attachment_ref: String::new(),
				}))
			})
			.collect();

		let mut stream = Vec::new();
		for env in &envs {
			stream.extend_from_slice(&encode_frame_default(env).unwrap());
		}

		let mut buf = BytesMut::new();
		let mut decoded = Vec::new();
		for chunk in stream.chunks(step) {
			buf.extend_from_slice(chunk);
			while let Some(env) = try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
				decoded.push(env);
			}
		}

		prop_assert_eq!(decoded, envs);
		prop_assert!(buf.is_empty());
	}
}
