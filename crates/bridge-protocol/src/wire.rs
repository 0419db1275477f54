//! Wire-form emission: XML (XMPP/PubSub) and JSON (AMQP) (spec.md §6).

use crate::message::{Kind, Message, MessageBody};
use minidom::Element;
use serde_json::{Map, Value};

/// Which wire form to emit toward. `Line` is the pipe-delimited text grammar
/// used on the local socket, the inverse of `codec::parse` (spec.md §6,
/// "Line protocol"); `Xmpp`/`Amqp` are the two bus transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireForm {
    Xmpp,
    Amqp,
    Line,
}

// ---------------------------------------------------------------------------
// XMPP/PubSub XML form
// ---------------------------------------------------------------------------

pub fn emit_xml(msg: &Message) -> Vec<u8> {
    let element = to_xml_element(msg);
    let mut buf = Vec::new();
    element
        .write_to(&mut buf)
        .expect("writing to an in-memory buffer never fails");
    buf
}

fn to_xml_element(msg: &Message) -> Element {
    match &msg.body {
        MessageBody::Structured(el) => el.clone(),
        MessageBody::Nested(inner) => wrap_one_to_one(msg, inner),
        MessageBody::Batch(items) => {
            let ns = Kind::Perf.xmpp_namespace().expect("perf has a namespace");
            let mut builder = Element::builder("perfs", ns);
            for item in items {
                builder = builder.append(to_xml_element(item));
            }
            builder.build()
        }
        MessageBody::Event { timestamp, host, service, state, message } => {
            let ns = msg.kind.xmpp_namespace().expect("event has a namespace");
            Element::builder("event", ns)
                .append(text_child("timestamp", ns, timestamp))
                .append(text_child("host", ns, host))
                .append(text_child("service", ns, service))
                .append(text_child("state", ns, state))
                .append(text_child("message", ns, message))
                .build()
        }
        MessageBody::Perf { timestamp, host, datasource, value } => {
            let ns = msg.kind.xmpp_namespace().expect("perf has a namespace");
            Element::builder("perf", ns)
                .append(text_child("timestamp", ns, timestamp))
                .append(text_child("host", ns, host))
                .append(text_child("datasource", ns, datasource))
                .append(text_child("value", ns, value))
                .build()
        }
        MessageBody::Downtime { timestamp, host, service, downtime_type, author, comment } => {
            let ns = msg.kind.xmpp_namespace().expect("downtime has a namespace");
            Element::builder("downtime", ns)
                .append(text_child("timestamp", ns, timestamp))
                .append(text_child("host", ns, host))
                .append(text_child("service", ns, service))
                .append(text_child("type", ns, downtime_type))
                .append(text_child("author", ns, author))
                .append(text_child("comment", ns, comment))
                .build()
        }
        MessageBody::Command { command_type, body } => {
            let ns = msg.kind.xmpp_namespace().expect("command has a namespace");
            Element::builder("command", ns)
                .attr("type", command_type.as_str())
                .append(body.as_str())
                .build()
        }
    }
}

fn text_child(name: &str, ns: &str, content: &str) -> Element {
    Element::builder(name, ns).append(content).build()
}

/// Wrap the nested message inside a `message type='chat'` stanza addressed
/// to `recipient` (spec.md §4.1, "oneToOne wrapping").
fn wrap_one_to_one(outer: &Message, inner: &Message) -> Element {
    let recipient = outer.recipient.as_deref().unwrap_or_default();
    let body = Element::builder("body", "")
        .append(to_xml_element(inner))
        .build();
    Element::builder("message", "")
        .attr("to", recipient)
        .attr("type", "chat")
        .append(body)
        .build()
}

// ---------------------------------------------------------------------------
// AMQP JSON form
// ---------------------------------------------------------------------------

pub fn emit_json(msg: &Message) -> Vec<u8> {
    let value = to_json_value(msg);
    serde_json::to_vec(&value).expect("Message always serializes to valid JSON")
}

fn to_json_value(msg: &Message) -> Value {
    match &msg.body {
        MessageBody::Nested(inner) => {
            // spec.md §4.1: "on AMQP, the recipient becomes the routing key."
            let mut inner_value = to_json_value(inner);
            if let Value::Object(map) = &mut inner_value {
                map.insert(
                    "routing_key".to_owned(),
                    Value::String(msg.recipient.clone().unwrap_or_default()),
                );
            }
            inner_value
        }
        MessageBody::Batch(items) => {
            let messages: Vec<Value> = items.iter().map(to_json_value).collect();
            let mut map = Map::new();
            // spec.md §6: batches are always typed "perf", never "perfs".
            map.insert("type".to_owned(), Value::String(Kind::Perf.as_str().to_owned()));
            map.insert("messages".to_owned(), Value::Array(messages));
            Value::Object(map)
        }
        MessageBody::Structured(el) => structured_to_json(msg, el),
        MessageBody::Event { timestamp, host, service, state, message } => {
            base_envelope(msg, &[
                ("timestamp", timestamp.as_str()),
                ("host", host.as_str()),
                ("service", service.as_str()),
                ("state", state.as_str()),
                ("message", message.as_str()),
            ])
        }
        MessageBody::Perf { timestamp, host, datasource, value } => base_envelope(msg, &[
            ("timestamp", timestamp.as_str()),
            ("host", host.as_str()),
            ("datasource", datasource.as_str()),
            ("value", value.as_str()),
        ]),
        MessageBody::Downtime { timestamp, host, service, downtime_type, author, comment } => {
            base_envelope(msg, &[
                ("timestamp", timestamp.as_str()),
                ("host", host.as_str()),
                ("service", service.as_str()),
                ("type", downtime_type.as_str()),
                ("author", author.as_str()),
                ("comment", comment.as_str()),
            ])
        }
        MessageBody::Command { command_type, body } => base_envelope(msg, &[
            ("command_type", command_type.as_str()),
            ("body", body.as_str()),
        ]),
    }
}

fn base_envelope(msg: &Message, fields: &[(&str, &str)]) -> Value {
    let mut map = Map::new();
    map.insert("type".to_owned(), Value::String(msg.kind.as_str().to_owned()));
    map.insert("routing_key".to_owned(), Value::String(msg.routing_key().to_owned()));
    map.insert("persistent".to_owned(), Value::Bool(msg.persistent));
    for (k, v) in fields {
        map.insert((*k).to_owned(), Value::String((*v).to_owned()));
    }
    Value::Object(map)
}

fn structured_to_json(msg: &Message, el: &Element) -> Value {
    let mut map = Map::new();
    map.insert("type".to_owned(), Value::String(msg.kind.as_str().to_owned()));
    map.insert("routing_key".to_owned(), Value::String(msg.routing_key().to_owned()));
    map.insert("persistent".to_owned(), Value::Bool(msg.persistent));
    for child in el.children() {
        map.insert(child.name().to_owned(), Value::String(child.text()));
    }
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Local line (pipe-delimited text) form — the inverse of codec::parse, used
// when the sink is the local socket rather than the bus.
// ---------------------------------------------------------------------------

pub fn emit_line(msg: &Message) -> Vec<u8> {
    to_line_string(msg).into_bytes()
}

fn to_line_string(msg: &Message) -> String {
    match &msg.body {
        MessageBody::Structured(el) => {
            let mut buf = Vec::new();
            el.write_to(&mut buf).expect("writing to an in-memory buffer never fails");
            String::from_utf8_lossy(&buf).into_owned()
        }
        MessageBody::Nested(inner) => {
            format!("oneToOne|{}|{}", msg.recipient.as_deref().unwrap_or_default(), to_line_string(inner))
        }
        MessageBody::Batch(items) => items.iter().map(to_line_string).collect::<Vec<_>>().join("\n"),
        MessageBody::Event { timestamp, host, service, state, message } => {
            format!("event|{timestamp}|{host}|{service}|{state}|{message}")
        }
        MessageBody::Perf { timestamp, host, datasource, value } => {
            format!("perf|{timestamp}|{host}|{datasource}|{value}")
        }
        MessageBody::Downtime { timestamp, host, service, downtime_type, author, comment } => {
            format!("downtime|{timestamp}|{host}|{service}|{downtime_type}|{author}|{comment}")
        }
        MessageBody::Command { command_type, body } => {
            format!("command|{command_type}|{body}")
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound parsing — turns bytes received from the bus back into a typed
// `Message`, including unwrapping a `perfs` batch into its children
// (spec.md §4.3, "A received batch-aggregate message is unwrapped on the
// receiving side").
// ---------------------------------------------------------------------------

pub fn parse_xml(bytes: &[u8]) -> Option<Message> {
    let text = std::str::from_utf8(bytes).ok()?;
    let el: Element = text.parse().ok()?;
    element_to_message(&el)
}

fn element_to_message(el: &Element) -> Option<Message> {
    match el.name() {
        "perfs" => {
            let children: Vec<Message> = el.children().filter_map(element_to_message).collect();
            Some(Message {
                kind: Kind::Perfs,
                routing_key: None,
                persistent: true,
                recipient: None,
                body: MessageBody::Batch(children),
            })
        }
        "message" if el.attr("type") == Some("chat") => {
            let recipient = el.attr("to").map(str::to_owned);
            let body_el = el.get_child("body", el.ns())?;
            let inner_el = body_el.children().next()?;
            let inner = element_to_message(inner_el)?;
            Some(Message {
                kind: Kind::OneToOne,
                routing_key: None,
                persistent: true,
                recipient,
                body: MessageBody::Nested(Box::new(inner)),
            })
        }
        "event" => {
            let child = |name: &str| el.get_child(name, el.ns()).map(Element::text).unwrap_or_default();
            Some(Message {
                kind: Kind::Event,
                routing_key: None,
                persistent: true,
                recipient: None,
                body: MessageBody::Event {
                    timestamp: child("timestamp"),
                    host: child("host"),
                    service: child("service"),
                    state: child("state"),
                    message: child("message"),
                },
            })
        }
        "perf" => {
            let child = |name: &str| el.get_child(name, el.ns()).map(Element::text).unwrap_or_default();
            Some(Message {
                kind: Kind::Perf,
                routing_key: None,
                persistent: true,
                recipient: None,
                body: MessageBody::Perf {
                    timestamp: child("timestamp"),
                    host: child("host"),
                    datasource: child("datasource"),
                    value: child("value"),
                },
            })
        }
        "downtime" => {
            let child = |name: &str| el.get_child(name, el.ns()).map(Element::text).unwrap_or_default();
            Some(Message {
                kind: Kind::Downtime,
                routing_key: None,
                persistent: true,
                recipient: None,
                body: MessageBody::Downtime {
                    timestamp: child("timestamp"),
                    host: child("host"),
                    service: child("service"),
                    downtime_type: child("type"),
                    author: child("author"),
                    comment: child("comment"),
                },
            })
        }
        "command" => Some(Message {
            kind: Kind::Command,
            routing_key: None,
            persistent: true,
            recipient: None,
            body: MessageBody::Command {
                command_type: el.attr("type").unwrap_or_default().to_owned(),
                body: el.text(),
            },
        }),
        other => {
            let kind = Kind::from_str(other)?;
            Some(Message { kind, routing_key: None, persistent: true, recipient: None, body: MessageBody::Structured(el.clone()) })
        }
    }
}

pub fn parse_json(bytes: &[u8]) -> Option<Message> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    json_to_message(&value)
}

fn json_to_message(value: &Value) -> Option<Message> {
    let obj = value.as_object()?;
    let kind_tag = obj.get("type")?.as_str()?;
    let routing_key = obj.get("routing_key").and_then(Value::as_str).map(str::to_owned);
    let persistent = obj.get("persistent").and_then(Value::as_bool).unwrap_or(true);

    if let Some(messages) = obj.get("messages").and_then(Value::as_array) {
        let children: Vec<Message> = messages.iter().filter_map(json_to_message).collect();
        return Some(Message {
            kind: Kind::Perfs,
            routing_key,
            persistent,
            recipient: None,
            body: MessageBody::Batch(children),
        });
    }

    let field = |name: &str| obj.get(name).and_then(Value::as_str).unwrap_or_default().to_owned();
    let body = match kind_tag {
        "event" => MessageBody::Event {
            timestamp: field("timestamp"),
            host: field("host"),
            service: field("service"),
            state: field("state"),
            message: field("message"),
        },
        "perf" => MessageBody::Perf {
            timestamp: field("timestamp"),
            host: field("host"),
            datasource: field("datasource"),
            value: field("value"),
        },
        "downtime" => MessageBody::Downtime {
            timestamp: field("timestamp"),
            host: field("host"),
            service: field("service"),
            downtime_type: field("type"),
            author: field("author"),
            comment: field("comment"),
        },
        "command" => MessageBody::Command { command_type: field("command_type"), body: field("body") },
        _ => return None,
    };
    let kind = Kind::from_str(kind_tag)?;
    // spec.md §4.1: "on AMQP, the recipient becomes the routing key" — a
    // oneToOne inbound message carries no reverse marker of its own, so
    // there is nothing further to unwrap here; the recipient stays in
    // routing_key as emitted.
    Some(Message { kind, routing_key, persistent, recipient: None, body })
}
