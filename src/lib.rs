pub mod broker;
pub mod config;
pub mod decode;
pub mod error;
pub mod fanout;
pub mod model;
pub mod pipeline;
pub mod pubsub;
pub mod stomp;
pub mod store;

pub use broker::{BrokerConfig, BrokerEvents, BrokerListener, BrokerStats};
pub use config::Settings;
pub use decode::WirePayload;
pub use error::{DecodeError, StompError};
pub use fanout::{ConnectionManager, ObserverId};
pub use model::{ResultKind, ShotRecord};
pub use pipeline::{ingest_channel, Inbound, IngestSender, Pipeline};
pub use pubsub::{PubSubConfig, PubSubListener, PubSubStats, Topology};
pub use stomp::{StompFrame, StompSplitter};
pub use store::ShotStore;
