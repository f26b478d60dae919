pub mod client;
pub mod connection;
pub mod connection_manager;

mod error;
pub use error::{ConnectionError, Error, ProtocolError, Result};
pub mod executor;
pub mod protocol;

pub use client::{Kafka, KafkaOptions};
pub use protocol::{
    FetchRequest, FetchResponse, FetchSpec, FetchedPartitionData, MessageSet, MessageSetEntry,
    Record, Request, Response,
};

// kafka protocol
pub use kafka_protocol::ResponseError;

const DEFAULT_SERVER_PORT: u16 = 9092;
