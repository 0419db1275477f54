//! Endpoint adapters (spec.md §4.5): the local Unix socket pair and the
//! bus-side routing/transport seam. Everything transport-specific (the
//! actual XMPP stream or AMQP channel) is out of scope (spec.md §1) — these
//! modules implement the in-scope routing and framing around that seam.

pub mod bus;
pub mod line_socket;
