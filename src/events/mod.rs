//! Event intake: the event model, routing table and the publish/consume bus.

pub mod bus;
pub mod model;
pub mod router;

pub use bus::{ConsumerStats, EventBus, EventPublisher, EventSink, spawn_event_consumer};
pub use model::Event;
pub use router::{
    EntitySource, EventMatcher, EventRouter, IngestReport, RouteRule, RouteTable,
    default_route_table,
};
