fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chathub_protocol::handshake::{encode_handshake, parse_handshake};
    use chathub_protocol::{
        ChatMessage, DecodeError, HandshakeRequest, HandshakeResponse, HubMessage, MessageType,
        decode, decode_frame, encode,
    };
    use serde_json::{Value, json};

    const RS: u8 = 0x1e;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Reads a fixture as raw bytes with surrounding whitespace trimmed.
    fn load_record(name: &str) -> Vec<u8> {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        data.trim().as_bytes().to_vec()
    }

    fn load_fixture(name: &str) -> Value {
        serde_json::from_slice(&load_record(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Decodes the fixture into `expected`, then encodes `expected` and
    /// compares the JSON (key order independent).
    fn wire_test(name: &str, expected: HubMessage) {
        let decoded =
            decode(&load_record(name)).unwrap_or_else(|e| panic!("failed to decode {name}: {e}"));
        assert_eq!(decoded, expected, "decode mismatch for {name}");

        let encoded = encode(&expected).unwrap();
        assert_eq!(encoded.last(), Some(&RS), "{name}: missing record separator");
        let reencoded: Value = serde_json::from_slice(&encoded[..encoded.len() - 1]).unwrap();
        assert_eq!(
            reencoded,
            load_fixture(name),
            "encode mismatch for {name}"
        );
    }

    fn alice() -> Value {
        serde_json::to_value(ChatMessage::new("Alice", "hi")).unwrap()
    }

    // --- Message kinds ---

    #[test]
    fn fixture_broadcast_send() {
        wire_test(
            "invocation_broadcast.json",
            HubMessage::send("Broadcast", vec![alice()]),
        );
    }

    #[test]
    fn fixture_new_message_push() {
        wire_test(
            "push_new_message.json",
            HubMessage::send("NewMessage", vec![alice()]),
        );
    }

    #[test]
    fn fixture_dad_joke_invocation() {
        wire_test(
            "invocation_dad_joke.json",
            HubMessage::invocation("1", "DadJoke", vec![]),
        );
    }

    #[test]
    fn fixture_completions() {
        wire_test(
            "completion_result.json",
            HubMessage::completion(
                "1",
                Some(json!("How do celebrities stay cool? They have many fans")),
            ),
        );
        wire_test("completion_void.json", HubMessage::completion("2", None));
        wire_test(
            "completion_null.json",
            HubMessage::completion("4", Some(Value::Null)),
        );
        wire_test(
            "completion_error.json",
            HubMessage::completion_error("3", "count must be between 0 and 10000"),
        );
    }

    #[test]
    fn fixture_stream_messages() {
        wire_test(
            "stream_invocation_countdown.json",
            HubMessage::StreamInvocation {
                invocation_id: "2".into(),
                target: "CountDown".into(),
                arguments: vec![json!(10)],
            },
        );
        wire_test(
            "stream_item.json",
            HubMessage::StreamItem {
                invocation_id: "2".into(),
                item: json!(10),
            },
        );
        wire_test(
            "cancel_invocation.json",
            HubMessage::CancelInvocation {
                invocation_id: "2".into(),
            },
        );
    }

    #[test]
    fn fixture_control_messages() {
        wire_test("ping.json", HubMessage::Ping);
        wire_test(
            "close.json",
            HubMessage::Close {
                error: None,
                allow_reconnect: false,
            },
        );
        wire_test(
            "close_reconnect.json",
            HubMessage::Close {
                error: Some("Server is shutting down".into()),
                allow_reconnect: true,
            },
        );
    }

    #[test]
    fn fixture_type_tags() {
        for (name, tag) in [
            ("invocation_broadcast.json", MessageType::Invocation),
            ("stream_item.json", MessageType::StreamItem),
            ("completion_void.json", MessageType::Completion),
            ("stream_invocation_countdown.json", MessageType::StreamInvocation),
            ("cancel_invocation.json", MessageType::CancelInvocation),
            ("ping.json", MessageType::Ping),
            ("close.json", MessageType::Close),
        ] {
            assert_eq!(load_fixture(name)["type"], json!(tag as u8), "{name}");
        }
    }

    // --- Handshake ---

    #[test]
    fn fixture_handshake_request() {
        let mut frame = load_record("handshake_request.json");
        frame.push(RS);
        let (request, rest) = parse_handshake::<HandshakeRequest>(&frame).unwrap();
        assert_eq!(request, HandshakeRequest::default());
        assert!(rest.is_empty());

        let encoded = encode_handshake(&HandshakeRequest::default()).unwrap();
        let value: Value = serde_json::from_slice(&encoded[..encoded.len() - 1]).unwrap();
        assert_eq!(value, load_fixture("handshake_request.json"));
    }

    #[test]
    fn fixture_handshake_responses() {
        let encoded = encode_handshake(&HandshakeResponse::ok()).unwrap();
        let value: Value = serde_json::from_slice(&encoded[..encoded.len() - 1]).unwrap();
        assert_eq!(value, load_fixture("handshake_response_ok.json"));

        let mut frame = load_record("handshake_response_error.json");
        frame.push(RS);
        let (response, _) = parse_handshake::<HandshakeResponse>(&frame).unwrap();
        assert_eq!(
            response,
            HandshakeResponse::error("The protocol 'messagepack' is not supported.")
        );

        let rejected = HandshakeRequest {
            protocol: "messagepack".into(),
            version: 1,
        };
        assert_eq!(response.error, rejected.validate().err());
    }

    #[test]
    fn handshake_response_followed_by_records() {
        let mut frame = load_record("handshake_response_ok.json");
        frame.push(RS);
        frame.extend(load_record("push_new_message.json"));
        frame.push(RS);

        let (response, rest) = parse_handshake::<HandshakeResponse>(&frame).unwrap();
        assert_eq!(response, HandshakeResponse::ok());
        assert_eq!(
            decode_frame(rest).remove(0).unwrap(),
            HubMessage::send("NewMessage", vec![alice()])
        );
    }

    // --- Framing ---

    #[test]
    fn multi_record_frame_keeps_order() {
        let mut frame = Vec::new();
        for name in ["stream_item.json", "ping.json", "completion_void.json"] {
            frame.extend(load_record(name));
            frame.push(RS);
        }

        let messages: Vec<HubMessage> = decode_frame(&frame)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            messages,
            vec![
                HubMessage::StreamItem {
                    invocation_id: "2".into(),
                    item: json!(10),
                },
                HubMessage::Ping,
                HubMessage::completion("2", None),
            ]
        );
    }

    // --- Rejected records ---

    #[test]
    fn fixture_invalid_records() {
        let decode_invalid = |name: &str| decode(&load_record(&format!("invalid/{name}")));

        assert!(matches!(
            decode_invalid("stream_item_without_id.json"),
            Err(DecodeError::MissingInvocationId(MessageType::StreamItem))
        ));
        assert!(matches!(
            decode_invalid("stream_invocation_without_id.json"),
            Err(DecodeError::MissingInvocationId(MessageType::StreamInvocation))
        ));
        assert!(matches!(
            decode_invalid("unknown_type.json"),
            Err(DecodeError::UnknownType(42))
        ));
        assert!(matches!(
            decode_invalid("completion_result_and_error.json"),
            Err(DecodeError::ConflictingCompletion)
        ));
        assert!(matches!(
            decode_invalid("invocation_without_target.json"),
            Err(DecodeError::MissingField { field: "target", .. })
        ));
    }

    #[test]
    fn invalid_record_does_not_poison_frame() {
        let mut frame = load_record("invalid/unknown_type.json");
        frame.push(RS);
        frame.extend(load_record("ping.json"));
        frame.push(RS);

        let results = decode_frame(&frame);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap(), &HubMessage::Ping);
    }
}
