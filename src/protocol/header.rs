use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::{
    messages::{ApiKey, RequestHeader, ResponseHeader},
    protocol::{buf::ByteBuf, Decodable, Encodable, StrBytes},
};

use crate::{error::ProtocolError, protocol::buf::ByteReader};

/// Size of the big-endian length prefix in front of every frame.
pub const LENGTH_PREFIX: usize = 4;

pub fn request_header(
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    client_id: Option<&str>,
) -> RequestHeader {
    RequestHeader::default()
        .with_request_api_key(api_key as i16)
        .with_request_api_version(api_version)
        .with_correlation_id(correlation_id)
        .with_client_id(client_id.map(|id| StrBytes::from_string(id.to_string())))
}

/// Writes `header` in the header version the api key and version call for.
pub fn encode_request_header(
    header: &RequestHeader,
    api_key: ApiKey,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let version = api_key.request_header_version(header.request_api_version);
    header.encode(dst, version).map_err(ProtocolError::encode)
}

pub fn decode_request_header<B: ByteBuf>(
    src: &mut B,
    api_key: ApiKey,
    api_version: i16,
) -> Result<RequestHeader, ProtocolError> {
    RequestHeader::decode(src, api_key.request_header_version(api_version))
        .map_err(ProtocolError::decode)
}

pub fn encode_response_header(
    correlation_id: i32,
    api_key: ApiKey,
    api_version: i16,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    ResponseHeader::default()
        .with_correlation_id(correlation_id)
        .encode(dst, api_key.response_header_version(api_version))
        .map_err(ProtocolError::encode)
}

/// Decodes the response header and rejects it unless it echoes `expected`.
pub fn decode_response_header<B: ByteBuf>(
    src: &mut B,
    api_key: ApiKey,
    api_version: i16,
    expected: i32,
) -> Result<ResponseHeader, ProtocolError> {
    let header = ResponseHeader::decode(src, api_key.response_header_version(api_version))
        .map_err(ProtocolError::decode)?;
    if header.correlation_id != expected {
        return Err(ProtocolError::CorrelationMismatch {
            expected,
            actual: header.correlation_id,
        });
    }
    Ok(header)
}

/// Prefixes `body` with its own length as a big-endian int32.
pub fn frame(body: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(body.len() + LENGTH_PREFIX);
    dst.put_i32(body.len() as i32);
    dst.put_slice(body);
    dst.freeze()
}

/// Strips and verifies the length prefix of a complete frame, returning the body.
pub fn unframe(mut frame: Bytes) -> Result<Bytes, ProtocolError> {
    let declared = frame.read_i32("length")?;
    if declared < 0 || declared as usize != frame.remaining() {
        return Err(ProtocolError::FrameLength {
            declared,
            actual: frame.remaining(),
        });
    }
    Ok(frame)
}

/// Reads the correlation id of a response frame without consuming it.
pub fn peek_correlation_id(frame: &[u8]) -> Result<i32, ProtocolError> {
    let mut header = frame
        .get(LENGTH_PREFIX..)
        .ok_or(ProtocolError::UnexpectedEof { field: "length" })?;
    header.read_i32("correlation_id")
}
