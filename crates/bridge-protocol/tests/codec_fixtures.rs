use bridge_protocol::message::{Kind, Message, MessageBody};
use bridge_protocol::wire::{emit_json, emit_xml, parse_json, parse_xml};
use bridge_protocol::{codec, WireForm};

fn parse(line: &str) -> Message {
    codec::parse(line.as_bytes()).unwrap_or_else(|| panic!("expected {line:?} to parse"))
}

#[test]
fn parses_event_line() {
    let msg = parse("event|2026-07-28T10:00:00|host1|ping|CRITICAL|no reply");
    assert_eq!(msg.kind, Kind::Event);
    match msg.body {
        MessageBody::Event { ref host, ref service, ref state, .. } => {
            assert_eq!(host, "host1");
            assert_eq!(service, "ping");
            assert_eq!(state, "CRITICAL");
        }
        _ => panic!("wrong body variant"),
    }
}

#[test]
fn parses_perf_line() {
    let msg = parse("perf|2026-07-28T10:00:00|host1|load|0.42");
    assert_eq!(msg.kind, Kind::Perf);
    match msg.body {
        MessageBody::Perf { ref datasource, ref value, .. } => {
            assert_eq!(datasource, "load");
            assert_eq!(value, "0.42");
        }
        _ => panic!("wrong body variant"),
    }
}

#[test]
fn parses_downtime_line() {
    let msg = parse("downtime|2026-07-28T10:00:00|host1|ping|start|alice|planned maintenance");
    assert_eq!(msg.kind, Kind::Downtime);
}

#[test]
fn parses_command_line_with_embedded_pipes() {
    let msg = parse("command|nagios|SCHEDULE_HOST_DOWNTIME|host1|0|1|0|3600|alice|maint");
    match msg.body {
        MessageBody::Command { ref command_type, ref body } => {
            assert_eq!(command_type, "nagios");
            assert_eq!(body, "SCHEDULE_HOST_DOWNTIME|host1|0|1|0|3600|alice|maint");
        }
        _ => panic!("wrong body variant"),
    }
}

#[test]
fn rejects_event_with_wrong_field_count() {
    assert!(codec::parse(b"event|2026-07-28T10:00:00|host1|ping").is_none());
}

#[test]
fn rejects_unknown_kind() {
    assert!(codec::parse(b"bogus|a|b|c").is_none());
}

#[test]
fn ignores_empty_and_whitespace_lines() {
    assert!(codec::parse(b"").is_none());
    assert!(codec::parse(b"   \t  ").is_none());
}

#[test]
fn falls_back_to_iso_8859_15_when_not_valid_utf8() {
    // 0xE9 in ISO-8859-15 is 'é'; not valid as a UTF-8 continuation on its own.
    let mut line = b"event|2026-07-28T10:00:00|host1|ping|CRITICAL|probl\xE8me".to_vec();
    line.extend_from_slice(b"");
    let msg = codec::parse(&line).expect("should decode via ISO-8859-15 fallback");
    match msg.body {
        MessageBody::Event { ref message, .. } => assert!(message.contains('\u{e8}')),
        _ => panic!("wrong body variant"),
    }
}

#[test]
fn parses_one_to_one_wrapping_a_nested_message() {
    let msg = parse("oneToOne|peer@bus.example|perf|2026-07-28T10:00:00|host1|load|0.1");
    assert_eq!(msg.kind, Kind::OneToOne);
    assert_eq!(msg.recipient.as_deref(), Some("peer@bus.example"));
    assert!(msg.is_push_only());
    match msg.body {
        MessageBody::Nested(inner) => assert_eq!(inner.kind, Kind::Perf),
        _ => panic!("wrong body variant"),
    }
}

#[test]
fn rejects_malformed_one_to_one_missing_nested_message() {
    assert!(codec::parse(b"oneToOne|peer@bus.example").is_none());
}

#[test]
fn emits_xml_event_in_event1_namespace() {
    let msg = parse("event|2026-07-28T10:00:00|host1|ping|CRITICAL|no reply");
    let xml = codec::emit(&msg, WireForm::Xmpp);
    let text = String::from_utf8(xml).unwrap();
    assert!(text.contains("http://www.projet-vigilo.org/xmlns/event1"));
    assert!(text.contains("host1"));
}

#[test]
fn emits_json_perf_with_routing_key_default() {
    let msg = parse("perf|2026-07-28T10:00:00|host1|load|0.42");
    let json = codec::emit(&msg, WireForm::Amqp);
    let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(value["type"], "perf");
    assert_eq!(value["routing_key"], "perf");
    assert_eq!(value["persistent"], true);
}

#[test]
fn emits_json_one_to_one_with_recipient_as_routing_key() {
    let msg = parse("oneToOne|peer@bus.example|event|2026-07-28T10:00:00|host1|ping|CRITICAL|down");
    let json = codec::emit(&msg, WireForm::Amqp);
    let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(value["routing_key"], "peer@bus.example");
}

#[test]
fn emits_json_batch_typed_as_perf_not_perfs() {
    let a = parse("perf|2026-07-28T10:00:00|host1|load|0.1");
    let b = parse("perf|2026-07-28T10:00:01|host1|load|0.2");
    let batch = Message {
        kind: Kind::Perfs,
        routing_key: None,
        persistent: true,
        recipient: None,
        body: MessageBody::Batch(vec![a, b]),
    };
    let json = codec::emit(&batch, WireForm::Amqp);
    let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(value["type"], "perf");
    assert_eq!(value["messages"].as_array().unwrap().len(), 2);
}

#[test]
fn emits_xml_batch_as_perfs_element_in_perf1_namespace() {
    let a = parse("perf|2026-07-28T10:00:00|host1|load|0.1");
    let batch = Message {
        kind: Kind::Perfs,
        routing_key: None,
        persistent: true,
        recipient: None,
        body: MessageBody::Batch(vec![a]),
    };
    let xml = codec::emit(&batch, WireForm::Xmpp);
    let text = String::from_utf8(xml).unwrap();
    assert!(text.starts_with("<perfs"));
    assert!(text.contains("perf1"));
}

#[test]
fn xml_round_trip_preserves_kind_and_body_for_perf() {
    let original = parse("perf|2026-07-28T10:00:00|host1|load|0.42");
    let round_tripped = parse_xml(&emit_xml(&original)).expect("emitted xml should parse back");
    assert_eq!(round_tripped.kind, Kind::Perf);
    match (&original.body, &round_tripped.body) {
        (
            MessageBody::Perf { timestamp: t1, host: h1, datasource: d1, value: v1 },
            MessageBody::Perf { timestamp: t2, host: h2, datasource: d2, value: v2 },
        ) => {
            assert_eq!(t1, t2);
            assert_eq!(h1, h2);
            assert_eq!(d1, d2);
            assert_eq!(v1, v2);
        }
        _ => panic!("wrong body variant after round trip"),
    }
}

#[test]
fn xml_round_trip_preserves_kind_and_body_for_event() {
    let original = parse("event|2026-07-28T10:00:00|host1|ping|CRITICAL|no reply");
    let round_tripped = parse_xml(&emit_xml(&original)).expect("emitted xml should parse back");
    assert_eq!(round_tripped.kind, Kind::Event);
    match round_tripped.body {
        MessageBody::Event { ref host, ref service, ref state, ref message, .. } => {
            assert_eq!(host, "host1");
            assert_eq!(service, "ping");
            assert_eq!(state, "CRITICAL");
            assert_eq!(message, "no reply");
        }
        _ => panic!("wrong body variant after round trip"),
    }
}

#[test]
fn json_round_trip_preserves_kind_routing_key_and_body_for_perf() {
    let original = parse("perf|2026-07-28T10:00:00|host1|load|0.42");
    let round_tripped = parse_json(&emit_json(&original)).expect("emitted json should parse back");
    assert_eq!(round_tripped.kind, Kind::Perf);
    assert_eq!(round_tripped.routing_key(), original.routing_key());
    assert_eq!(round_tripped.persistent, original.persistent);
    match round_tripped.body {
        MessageBody::Perf { ref datasource, ref value, .. } => {
            assert_eq!(datasource, "load");
            assert_eq!(value, "0.42");
        }
        _ => panic!("wrong body variant after round trip"),
    }
}

#[test]
fn json_round_trip_preserves_perfs_batch() {
    let a = parse("perf|2026-07-28T10:00:00|host1|load|0.1");
    let b = parse("perf|2026-07-28T10:00:01|host1|load|0.2");
    let batch =
        Message { kind: Kind::Perfs, routing_key: None, persistent: true, recipient: None, body: MessageBody::Batch(vec![a, b]) };
    let round_tripped = parse_json(&emit_json(&batch)).expect("emitted json should parse back");
    assert_eq!(round_tripped.kind, Kind::Perfs);
    match round_tripped.body {
        MessageBody::Batch(ref items) => {
            assert_eq!(items.len(), 2);
            assert_eq!(items[0].kind, Kind::Perf);
        }
        _ => panic!("wrong body variant after round trip"),
    }
}

#[test]
fn passes_through_already_structured_xml_lines() {
    let msg = codec::parse(br#"<state xmlns="http://www.projet-vigilo.org/xmlns/state1"><host>h</host></state>"#)
        .expect("should parse as structured");
    match msg.body {
        MessageBody::Structured(_) => {}
        _ => panic!("wrong body variant"),
    }
}
