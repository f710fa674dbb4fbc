//! Sensor ingestion: wire protocol, transports, normalization and fan-out.

pub mod normalize;
pub mod pipeline;
pub mod protocol;
pub mod sim;
pub mod transport;

pub use normalize::{ChannelRanges, RawRange, SensorReading};
pub use pipeline::{LinkState, SensorPipeline, SensorSource, Subscriber};
