// bridge-protocol: the message model and codec shared by the connector's
// line-socket and bus-facing sides.
//
// Nothing here does I/O: parsing, building and serializing a `Message` are
// pure functions, so both endpoints and tests can exercise the grammar
// without a running socket or bus.

pub mod capability;
pub mod codec;
pub mod message;
pub mod wire;

pub use capability::{
    BackpressureSink, BoxFuture, BusPublisher, BusSubscriber, Delivery, DeliveryTag, PublishOutcome, PublishRequest,
    TransportError,
};
pub use message::{Kind, Message, MessageBody};
pub use wire::WireForm;
