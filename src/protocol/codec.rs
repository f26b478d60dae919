use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, LengthDelimitedCodec};

use crate::{error::ConnectionError, protocol::header::peek_correlation_id};

/// A serialized request frame tagged with the correlation id written in its header.
#[derive(Debug, Clone)]
pub struct KafkaRequest {
    pub correlation_id: i32,
    pub frame: Bytes,
}

/// A raw response frame, length prefix included, routed by its correlation id.
#[derive(Debug, Clone)]
pub struct KafkaResponse {
    pub correlation_id: i32,
    pub frame: Bytes,
}

#[derive(Debug, Clone)]
pub enum Command {
    Request(KafkaRequest),
    Response(KafkaResponse),
}

pub struct KafkaCodec {
    length_codec: LengthDelimitedCodec,
}

impl Default for KafkaCodec {
    fn default() -> Self {
        KafkaCodec {
            length_codec: LengthDelimitedCodec::builder()
                .max_frame_length(i32::MAX as usize)
                .length_field_length(4)
                .num_skip(0)
                .new_codec(),
        }
    }
}

impl KafkaCodec {
    fn encode0(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), ConnectionError> {
        match cmd {
            Command::Request(req) => {
                dst.extend_from_slice(&req.frame);
                Ok(())
            }
            Command::Response(res) => Err(ConnectionError::Unexpected(format!(
                "cannot send response frame, correlation_id: {}",
                res.correlation_id
            ))),
        }
    }

    fn decode0(&mut self, src: &mut BytesMut) -> Result<Option<Command>, ConnectionError> {
        match self.length_codec.decode(src)? {
            Some(frame) => {
                let frame = frame.freeze();
                let correlation_id = peek_correlation_id(&frame)?;
                Ok(Some(Command::Response(KafkaResponse {
                    correlation_id,
                    frame,
                })))
            }
            None => Ok(None),
        }
    }
}

#[cfg(feature = "tokio-runtime")]
impl tokio_util::codec::Encoder<Command> for KafkaCodec {
    type Error = ConnectionError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode0(cmd, dst)
    }
}

#[cfg(feature = "tokio-runtime")]
impl tokio_util::codec::Decoder for KafkaCodec {
    type Item = Command;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode0(src)
    }
}

#[cfg(feature = "async-std-runtime")]
impl asynchronous_codec::Encoder for KafkaCodec {
    type Item = Command;
    type Error = ConnectionError;

    fn encode(&mut self, cmd: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode0(cmd, dst)
    }
}

#[cfg(feature = "async-std-runtime")]
impl asynchronous_codec::Decoder for KafkaCodec {
    type Item = Command;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode0(src)
    }
}
