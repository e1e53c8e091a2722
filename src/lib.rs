/// Broker: publisher/subscriber registry and topic matching.
pub mod broker;
/// Process settings loading.
pub mod config;
/// Error types: network, codec, delivery, topic.
pub mod error;
/// Logging setup (filter, console and file sinks).
pub mod logging;
/// Network stack: frames, connections, executor, control protocol.
pub mod network;
/// Client side: nodes, publications, subscription transports.
pub mod transport;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Broker service and its configuration.
pub use broker::{Broker, BrokerConfig, LateSubscriberPolicy};
/// Settings.
pub use config::{master_endpoint_from_env, Settings};
/// Operation errors.
pub use error::{
    CodecError, DeliveryError, ErrorExt, ExecutorError, NetworkError, StatusCode, TopicError,
};
/// Logging initialization.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
/// Network primitives.
pub use network::{
    Connection, ConnectionConfig, Endpoint, ExecutorConfig, Frame, FrameLink, IoExecutor,
};
/// Message payloads.
pub use network::protocol::{RawMessage, TypedMessage};
/// Pub/Sub API.
pub use transport::{AdvertiseOptions, Node, NodeConfig, Publisher, Subscriber};
