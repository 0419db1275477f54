//! The `Message` data model (spec.md §3).
//!
//! A `Message` is immutable once built: every field is set at construction
//! time in [`crate::codec`] and never mutated afterwards.

use serde::{Deserialize, Serialize};

/// The semantic category of a message. Determines routing (destination
/// node/exchange) and batching eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Event,
    Perf,
    /// Aggregate of up to `batch_size` `Perf` messages (spec.md §4.3).
    Perfs,
    Downtime,
    Command,
    State,
    Aggr,
    Delaggr,
    Correvent,
    OneToOne,
}

impl Kind {
    /// The wire tag used both in the text grammar and as the default
    /// routing key / exchange name.
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Event => "event",
            Kind::Perf => "perf",
            Kind::Perfs => "perfs",
            Kind::Downtime => "downtime",
            Kind::Command => "command",
            Kind::State => "state",
            Kind::Aggr => "aggr",
            Kind::Delaggr => "delaggr",
            Kind::Correvent => "correvent",
            Kind::OneToOne => "oneToOne",
        }
    }

    pub fn from_str(s: &str) -> Option<Kind> {
        Some(match s {
            "event" => Kind::Event,
            "perf" => Kind::Perf,
            "perfs" => Kind::Perfs,
            "downtime" => Kind::Downtime,
            "command" => Kind::Command,
            "state" => Kind::State,
            "aggr" => Kind::Aggr,
            "delaggr" => Kind::Delaggr,
            "correvent" => Kind::Correvent,
            "oneToOne" => Kind::OneToOne,
            _ => return None,
        })
    }

    /// XMPP namespace for kinds carried over PubSub (spec.md §6).
    /// `oneToOne` and `perfs` have no namespace of their own: the former is
    /// wrapped in a chat stanza, the latter reuses `perf`'s namespace.
    pub fn xmpp_namespace(self) -> Option<&'static str> {
        let tag = match self {
            Kind::Event => "event1",
            Kind::Perf | Kind::Perfs => "perf1",
            Kind::Downtime => "downtime1",
            Kind::Command => "command1",
            Kind::State => "state1",
            Kind::Aggr => "aggr1",
            Kind::Delaggr | Kind::Correvent => return None,
            Kind::OneToOne => return None,
        };
        Some(match tag {
            "event1" => "http://www.projet-vigilo.org/xmlns/event1",
            "perf1" => "http://www.projet-vigilo.org/xmlns/perf1",
            "downtime1" => "http://www.projet-vigilo.org/xmlns/downtime1",
            "command1" => "http://www.projet-vigilo.org/xmlns/command1",
            "state1" => "http://www.projet-vigilo.org/xmlns/state1",
            "aggr1" => "http://www.projet-vigilo.org/xmlns/aggr1",
            _ => unreachable!(),
        })
    }

    /// True when the kind is accumulated into a `perfs` batch rather than
    /// sent immediately (spec.md §4.3, "Batching of high-rate kinds").
    pub fn batch_eligible(self) -> bool {
        matches!(self, Kind::Perf)
    }
}

/// Typed field sets for the canonical text-grammar kinds (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Event {
        timestamp: String,
        host: String,
        service: String,
        state: String,
        message: String,
    },
    Perf {
        timestamp: String,
        host: String,
        datasource: String,
        value: String,
    },
    Downtime {
        timestamp: String,
        host: String,
        service: String,
        downtime_type: String,
        author: String,
        comment: String,
    },
    Command {
        command_type: String,
        body: String,
    },
    /// A message that arrived already-serialized (line started with `<`),
    /// or any other kind not in the canonical table. Carries its parsed
    /// XML tree so `emit` can hand it straight to the bus unchanged.
    Structured(minidom::Element),
    /// `oneToOne`: wraps a nested message of any other kind.
    Nested(Box<Message>),
    /// `perfs`: a batch of accumulated `Perf` messages (spec.md §4.3).
    Batch(Vec<Message>),
}

/// An immutable message moving through the forwarding pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: Kind,
    /// Defaults to `kind` when absent (spec.md §3).
    pub routing_key: Option<String>,
    /// Default true; false disables the durable broker delivery flag.
    pub persistent: bool,
    /// Present only for `oneToOne`: addresses a single peer on the bus.
    pub recipient: Option<String>,
    pub body: MessageBody,
}

impl Message {
    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or_else(|| self.kind.as_str())
    }

    /// Fire-and-forget messages don't expect a completion from the bus
    /// (spec.md §4.3 step 2c — `oneToOne`).
    pub fn is_push_only(&self) -> bool {
        matches!(self.kind, Kind::OneToOne)
    }
}
