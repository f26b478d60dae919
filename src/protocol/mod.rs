use bytes::{Bytes, BytesMut};
pub use kafka_protocol::messages::ApiKey;

use crate::error::ProtocolError;

pub mod buf;
mod codec;
pub mod fetch;
pub mod header;
pub mod message_set;

pub use codec::{Command, KafkaCodec, KafkaRequest, KafkaResponse};
pub use fetch::{FetchRequest, FetchResponse, FetchSpec, FetchedPartitionData, MessageSetEntry};
pub use message_set::{MessageSet, Record};

/// A request body that can be framed behind a request header.
pub trait Request {
    const API_KEY: ApiKey;
    const API_VERSION: i16;

    type Response: Response;

    /// Writes everything after the request header.
    fn encode_body(&self, dst: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Serializes the complete, length-prefixed request frame.
    ///
    /// The correlation id and client id belong to the session sending the request, the
    /// request itself never changes while being serialized.
    fn to_bytes(&self, correlation_id: i32, client_id: Option<&str>) -> Result<Bytes, ProtocolError> {
        let header =
            header::request_header(Self::API_KEY, Self::API_VERSION, correlation_id, client_id);
        let mut body = BytesMut::new();
        header::encode_request_header(&header, Self::API_KEY, &mut body)?;
        self.encode_body(&mut body)?;
        Ok(header::frame(&body))
    }
}

pub trait Response: Sized {
    /// Decodes a complete response frame, length prefix included. Fails unless the
    /// frame echoes `correlation_id`.
    fn decode(frame: Bytes, correlation_id: i32) -> Result<Self, ProtocolError>;
}
