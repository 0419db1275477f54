//! Stateless converter between line-delimited text and structured messages
//! (spec.md §4.1).

use crate::message::{Kind, Message, MessageBody};
use crate::wire::WireForm;
use tracing::warn;

/// Decode a raw line as UTF-8; on failure, retry as ISO-8859-15 before
/// giving up (spec.md §4.1, "Character encoding").
fn decode_line(raw: &[u8]) -> Option<String> {
    if let Ok(s) = std::str::from_utf8(raw) {
        return Some(s.to_owned());
    }
    let (cow, _encoding, had_errors) = encoding_rs::ISO_8859_15.decode(raw);
    if had_errors {
        None
    } else {
        Some(cow.into_owned())
    }
}

/// Parse a single line into a [`Message`].
///
/// Empty lines are ignored. Lines starting with `<` are parsed as
/// already-serialized XML. Non-conforming input yields `None` with a
/// warning-level log event — never a panic.
pub fn parse(raw: &[u8]) -> Option<Message> {
    let text = match decode_line(raw) {
        Some(t) => t,
        None => {
            warn!("line is neither valid UTF-8 nor ISO-8859-15; discarding");
            return None;
        }
    };
    let line = text.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with('<') {
        return match line.parse::<minidom::Element>() {
            Ok(el) => Some(structured_message(el)),
            Err(e) => {
                warn!(error = %e, "failed to parse already-structured XML line");
                None
            }
        };
    }

    parse_pipe_line(line)
}

fn structured_message(el: minidom::Element) -> Message {
    let kind = Kind::from_str(el.name()).unwrap_or(Kind::Event);
    Message {
        kind,
        routing_key: None,
        persistent: true,
        recipient: None,
        body: MessageBody::Structured(el),
    }
}

fn parse_pipe_line(line: &str) -> Option<Message> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.is_empty() || fields[0].is_empty() {
        warn!("unknown/malformed message: empty kind tag");
        return None;
    }

    if fields[0] == "oneToOne" {
        return parse_one_to_one(&fields);
    }

    build_plain_message(&fields)
}

fn parse_one_to_one(fields: &[&str]) -> Option<Message> {
    if fields.len() < 3 {
        warn!("malformed oneToOne message: expected recipient and a nested message");
        return None;
    }
    let recipient = fields[1].to_owned();
    let nested = build_plain_message(&fields[2..])?;
    Some(Message {
        kind: Kind::OneToOne,
        routing_key: None,
        persistent: true,
        recipient: Some(recipient),
        body: MessageBody::Nested(Box::new(nested)),
    })
}

fn build_plain_message(fields: &[&str]) -> Option<Message> {
    let kind_tag = fields[0];
    let rest = &fields[1..];
    let body = match kind_tag {
        "event" => {
            if rest.len() != 5 {
                warn!(kind = kind_tag, "wrong field count for event");
                return None;
            }
            MessageBody::Event {
                timestamp: rest[0].to_owned(),
                host: rest[1].to_owned(),
                service: rest[2].to_owned(),
                state: rest[3].to_owned(),
                message: rest[4].to_owned(),
            }
        }
        "perf" => {
            if rest.len() != 4 {
                warn!(kind = kind_tag, "wrong field count for perf");
                return None;
            }
            MessageBody::Perf {
                timestamp: rest[0].to_owned(),
                host: rest[1].to_owned(),
                datasource: rest[2].to_owned(),
                value: rest[3].to_owned(),
            }
        }
        "downtime" => {
            if rest.len() != 6 {
                warn!(kind = kind_tag, "wrong field count for downtime");
                return None;
            }
            MessageBody::Downtime {
                timestamp: rest[0].to_owned(),
                host: rest[1].to_owned(),
                service: rest[2].to_owned(),
                downtime_type: rest[3].to_owned(),
                author: rest[4].to_owned(),
                comment: rest[5].to_owned(),
            }
        }
        "command" => {
            if rest.is_empty() {
                warn!(kind = kind_tag, "command requires at least a type field");
                return None;
            }
            MessageBody::Command {
                command_type: rest[0].to_owned(),
                body: rest[1..].join("|"),
            }
        }
        other => {
            warn!(kind = other, "unknown/malformed message type");
            return None;
        }
    };
    let kind = Kind::from_str(kind_tag)?;
    Some(Message {
        kind,
        routing_key: None,
        persistent: true,
        recipient: None,
        body,
    })
}

/// Serialize a [`Message`] to the wire form of the destination bus.
///
/// The emitted form is always UTF-8.
pub fn emit(msg: &Message, form: WireForm) -> Vec<u8> {
    match form {
        WireForm::Xmpp => crate::wire::emit_xml(msg),
        WireForm::Amqp => crate::wire::emit_json(msg),
        WireForm::Line => crate::wire::emit_line(msg),
    }
}

/// Parse bytes received from the bus (or replayed from the `RetryStore`)
/// back into a [`Message`], dispatching on the wire form they arrived in.
/// Used by the bus subscriber adapter; the local-socket side uses [`parse`].
pub fn parse_wire(bytes: &[u8], form: WireForm) -> Option<Message> {
    match form {
        WireForm::Xmpp => crate::wire::parse_xml(bytes),
        WireForm::Amqp => crate::wire::parse_json(bytes),
        WireForm::Line => parse(bytes),
    }
}
