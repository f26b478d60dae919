use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_protocol::{
    error::ParseResponseErrorCode,
    messages::{ApiKey, RequestHeader},
    ResponseError,
};
use tracing::trace;

use crate::{
    error::ProtocolError,
    protocol::{
        buf::{ByteBuilder, ByteReader},
        header::{decode_request_header, decode_response_header, unframe},
        message_set::MessageSet,
        Request, Response,
    },
};

pub const DEFAULT_MAX_BYTES: i32 = 65536;
pub const DEFAULT_MAX_WAIT_TIME: i32 = 100;
pub const DEFAULT_MIN_BYTES: i32 = 1;

/// One partition entry of a fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSpec {
    pub partition: i32,
    pub fetch_offset: i64,
    pub max_bytes: i32,
}

/// Fetch request, API version 0.
///
/// Partitions are accumulated per topic with [`FetchRequest::add`] and serialized with
/// [`Request::to_bytes`]. Topics are written in the order they were first added,
/// partitions in the order they were added to their topic. Duplicate partitions are
/// not merged, every entry is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    max_wait_time: i32,
    min_bytes: i32,
    topics: IndexMap<String, Vec<FetchSpec>>,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WAIT_TIME, DEFAULT_MIN_BYTES)
    }
}

impl FetchRequest {
    /// Consumers always fetch as a non-replica.
    pub const REPLICA_ID: i32 = -1;

    /// `max_wait_time` is how long, in milliseconds, the broker may block waiting for
    /// `min_bytes` to accumulate.
    pub fn new(max_wait_time: i32, min_bytes: i32) -> Self {
        Self {
            max_wait_time,
            min_bytes,
            topics: IndexMap::new(),
        }
    }

    pub fn add<S: Into<String>>(&mut self, topic: S, partition: i32, fetch_offset: i64) -> &mut Self {
        self.add_with_max_bytes(topic, partition, fetch_offset, DEFAULT_MAX_BYTES)
    }

    pub fn add_with_max_bytes<S: Into<String>>(
        &mut self,
        topic: S,
        partition: i32,
        fetch_offset: i64,
        max_bytes: i32,
    ) -> &mut Self {
        self.topics.entry(topic.into()).or_default().push(FetchSpec {
            partition,
            fetch_offset,
            max_bytes,
        });
        self
    }

    pub fn max_wait_time(&self) -> i32 {
        self.max_wait_time
    }

    pub fn min_bytes(&self) -> i32 {
        self.min_bytes
    }

    pub fn topics(&self) -> &IndexMap<String, Vec<FetchSpec>> {
        &self.topics
    }

    pub fn partition_count(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Decodes a complete request frame, the inverse of [`Request::to_bytes`].
    pub fn decode(frame: Bytes) -> Result<(RequestHeader, FetchRequest), ProtocolError> {
        let mut src = unframe(frame)?;
        let header = decode_request_header(&mut src, Self::API_KEY, Self::API_VERSION)?;

        let _replica_id = src.read_i32("replica_id")?;
        let mut request = FetchRequest::new(
            src.read_i32("max_wait_time")?,
            src.read_i32("min_bytes")?,
        );

        let topic_count = src.read_array_len("topic_count")?;
        for _ in 0..topic_count {
            let topic = src.read_string("topic_name")?;
            let partition_count = src.read_array_len("partition_count")?;
            let partitions = request.topics.entry(topic).or_default();
            for _ in 0..partition_count {
                partitions.push(FetchSpec {
                    partition: src.read_i32("partition_id")?,
                    fetch_offset: src.read_i64("fetch_offset")?,
                    max_bytes: src.read_i32("max_bytes")?,
                });
            }
        }

        if src.has_remaining() {
            return Err(ProtocolError::TrailingBytes(src.remaining()));
        }
        Ok((header, request))
    }
}

impl Request for FetchRequest {
    const API_KEY: ApiKey = ApiKey::Fetch;
    const API_VERSION: i16 = 0;
    type Response = FetchResponse;

    fn encode_body(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.put_i32(Self::REPLICA_ID);
        dst.put_i32(self.max_wait_time);
        dst.put_i32(self.min_bytes);
        dst.put_array_len(self.topics.len())?;
        for (topic, partitions) in &self.topics {
            dst.put_string(topic)?;
            dst.put_array_len(partitions.len())?;
            for spec in partitions {
                dst.put_i32(spec.partition);
                dst.put_i64(spec.fetch_offset);
                dst.put_i32(spec.max_bytes);
            }
        }
        Ok(())
    }
}

/// Result of fetching one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPartitionData {
    pub partition: i32,
    pub error_code: i16,
    pub high_water_mark: i64,
    pub messages: MessageSet,
}

impl FetchedPartitionData {
    pub fn is_ok(&self) -> bool {
        self.error_code.is_ok()
    }

    /// The broker error for this partition, `None` when the partition was served.
    pub fn error(&self) -> Option<ResponseError> {
        self.error_code.err()
    }

    /// Offset to continue fetching from, if any message was returned.
    pub fn next_offset(&self) -> Option<i64> {
        self.messages.last_offset().map(|offset| offset + 1)
    }
}

/// One entry of the flattened view over a [`FetchResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSetEntry {
    pub topic: String,
    pub partition: i32,
    pub messages: MessageSet,
}

/// Fetch response, API version 0.
///
/// Built in a single pass over the response frame. Partition errors are kept as data on
/// each [`FetchedPartitionData`] and summarized by [`FetchResponse::has_errors`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    correlation_id: i32,
    topics: IndexMap<String, Vec<FetchedPartitionData>>,
    message_sets: Vec<MessageSetEntry>,
    has_errors: bool,
}

impl FetchResponse {
    pub fn correlation_id(&self) -> i32 {
        self.correlation_id
    }

    pub fn topics(&self) -> &IndexMap<String, Vec<FetchedPartitionData>> {
        &self.topics
    }

    /// Every partition in the order it was read, topic by topic.
    pub fn message_sets(&self) -> &[MessageSetEntry] {
        &self.message_sets
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn partition(&self, topic: &str, partition: i32) -> Option<&FetchedPartitionData> {
        self.topics
            .get(topic)?
            .iter()
            .find(|data| data.partition == partition)
    }

    /// Partitions the broker refused, with their decoded error.
    pub fn errors(&self) -> impl Iterator<Item = (&str, i32, ResponseError)> + '_ {
        self.topics.iter().flat_map(|(topic, partitions)| {
            partitions
                .iter()
                .filter_map(move |data| data.error().map(|err| (topic.as_str(), data.partition, err)))
        })
    }
}

impl Response for FetchResponse {
    fn decode(frame: Bytes, correlation_id: i32) -> Result<Self, ProtocolError> {
        let mut src = unframe(frame)?;
        decode_response_header(
            &mut src,
            FetchRequest::API_KEY,
            FetchRequest::API_VERSION,
            correlation_id,
        )?;

        let topic_count = src.read_array_len("topic_count")?;
        let mut topics: IndexMap<String, Vec<FetchedPartitionData>> = IndexMap::new();
        let mut message_sets = Vec::new();
        let mut has_errors = false;

        for _ in 0..topic_count {
            let topic = src.read_string("topic_name")?;
            let partition_count = src.read_array_len("partition_count")?;
            let mut partitions = Vec::new();

            for _ in 0..partition_count {
                let partition = src.read_i32("partition_id")?;
                let error_code = src.read_i16("error_code")?;
                let high_water_mark = src.read_i64("high_water_mark")?;
                let size = src.read_array_len("message_set_size")?;
                let messages = MessageSet::decode(src.read_bytes(size, "message_set")?)?;

                trace!(
                    "fetched [{} - {}] error_code: {}, high_water_mark: {}, messages: {}",
                    topic,
                    partition,
                    error_code,
                    high_water_mark,
                    messages.len()
                );

                has_errors |= !error_code.is_ok();
                message_sets.push(MessageSetEntry {
                    topic: topic.clone(),
                    partition,
                    messages: messages.clone(),
                });
                partitions.push(FetchedPartitionData {
                    partition,
                    error_code,
                    high_water_mark,
                    messages,
                });
            }

            topics.entry(topic).or_default().extend(partitions);
        }

        if src.has_remaining() {
            return Err(ProtocolError::TrailingBytes(src.remaining()));
        }

        Ok(FetchResponse {
            correlation_id,
            topics,
            message_sets,
            has_errors,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{
        header::{encode_response_header, frame},
        message_set::tests::message_set,
    };

    pub(crate) struct PartitionFixture<'a> {
        pub partition: i32,
        pub error_code: i16,
        pub high_water_mark: i64,
        pub messages: &'a [(i64, &'a str)],
    }

    /// Encodes a complete v0 fetch response frame.
    pub(crate) fn response_frame(
        correlation_id: i32,
        topics: &[(&str, Vec<PartitionFixture<'_>>)],
    ) -> Bytes {
        let mut body = BytesMut::new();
        encode_response_header(correlation_id, ApiKey::Fetch, 0, &mut body).unwrap();
        body.put_i32(topics.len() as i32);
        for (topic, partitions) in topics {
            body.put_string(topic).unwrap();
            body.put_i32(partitions.len() as i32);
            for fixture in partitions {
                let set = message_set(fixture.messages);
                body.put_i32(fixture.partition);
                body.put_i16(fixture.error_code);
                body.put_i64(fixture.high_water_mark);
                body.put_i32(set.len() as i32);
                body.put_slice(&set);
            }
        }
        frame(&body)
    }

    fn ok_partition(partition: i32) -> PartitionFixture<'static> {
        PartitionFixture {
            partition,
            error_code: 0,
            high_water_mark: 10,
            messages: &[(8, "a"), (9, "b")],
        }
    }

    #[test]
    fn serializes_partitions_in_insertion_order() {
        let mut request = FetchRequest::new(1000, 1);
        request.add_with_max_bytes("orders", 0, 100, 4096);
        request.add("orders", 1, 50);

        let bytes = request.to_bytes(3, Some("kfetch")).unwrap();

        let mut expected = BytesMut::new();
        expected.put_i16(1);
        expected.put_i16(0);
        expected.put_i32(3);
        expected.put_string("kfetch").unwrap();
        expected.put_i32(-1);
        expected.put_i32(1000);
        expected.put_i32(1);
        expected.put_i32(1);
        expected.put_string("orders").unwrap();
        expected.put_i32(2);
        expected.put_i32(0);
        expected.put_i64(100);
        expected.put_i32(4096);
        expected.put_i32(1);
        expected.put_i64(50);
        expected.put_i32(65536);

        assert_eq!(bytes, frame(&expected));
    }

    #[test]
    fn serialization_is_idempotent() {
        let mut request = FetchRequest::default();
        request.add("orders", 0, 0).add("payments", 3, 17);

        let first = request.to_bytes(11, None).unwrap();
        let second = request.to_bytes(11, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn request_round_trips_through_decode() {
        let mut request = FetchRequest::new(250, 64);
        request
            .add("orders", 2, i64::MAX)
            .add_with_max_bytes("payments", 0, -2, 1)
            .add("orders", 0, 5)
            .add("orders", 2, 7);

        let (header, decoded) =
            FetchRequest::decode(request.to_bytes(99, Some("c")).unwrap()).unwrap();
        assert_eq!(header.request_api_key, ApiKey::Fetch as i16);
        assert_eq!(header.request_api_version, 0);
        assert_eq!(header.correlation_id, 99);
        assert_eq!(header.client_id.as_deref(), Some("c"));
        assert_eq!(decoded, request);
        assert_eq!(decoded.partition_count(), 4);

        let orders: Vec<_> = decoded.topics()["orders"]
            .iter()
            .map(|spec| (spec.partition, spec.fetch_offset))
            .collect();
        assert_eq!(orders, vec![(2, i64::MAX), (0, 5), (2, 7)]);
    }

    #[test]
    fn empty_request_has_no_topics() {
        let request = FetchRequest::default();
        assert!(request.is_empty());

        let (_, decoded) = FetchRequest::decode(request.to_bytes(0, None).unwrap()).unwrap();
        assert_eq!(decoded.max_wait_time(), DEFAULT_MAX_WAIT_TIME);
        assert_eq!(decoded.min_bytes(), DEFAULT_MIN_BYTES);
        assert!(decoded.is_empty());
    }

    #[test]
    fn decodes_response_with_partition_error() {
        let frame = response_frame(
            5,
            &[
                ("orders", vec![ok_partition(0)]),
                (
                    "payments",
                    vec![PartitionFixture {
                        partition: 0,
                        error_code: 3,
                        high_water_mark: -1,
                        messages: &[],
                    }],
                ),
            ],
        );

        let response = FetchResponse::decode(frame, 5).unwrap();
        assert!(response.has_errors());
        assert_eq!(response.correlation_id(), 5);
        assert_eq!(response.topics()["payments"][0].error_code, 3);
        assert_eq!(
            response.topics()["payments"][0].error(),
            Some(ResponseError::UnknownTopicOrPartition)
        );
        assert_eq!(response.message_sets().len(), 2);

        let errors: Vec<_> = response.errors().collect();
        assert_eq!(
            errors,
            vec![("payments", 0, ResponseError::UnknownTopicOrPartition)]
        );
    }

    #[test]
    fn all_ok_partitions_have_no_errors() {
        let frame = response_frame(1, &[("orders", vec![ok_partition(0), ok_partition(1)])]);

        let response = FetchResponse::decode(frame, 1).unwrap();
        assert!(!response.has_errors());
        assert_eq!(response.errors().count(), 0);

        let partition = response.partition("orders", 1).unwrap();
        assert!(partition.is_ok());
        assert_eq!(partition.high_water_mark, 10);
        assert_eq!(partition.next_offset(), Some(10));
        assert!(response.partition("orders", 2).is_none());
        assert!(response.partition("payments", 0).is_none());
    }

    #[test]
    fn error_flag_is_sticky_across_later_ok_partitions() {
        let failed = PartitionFixture {
            partition: 0,
            error_code: 1,
            high_water_mark: 0,
            messages: &[],
        };
        let frame = response_frame(2, &[("orders", vec![failed, ok_partition(1)])]);

        let response = FetchResponse::decode(frame, 2).unwrap();
        assert!(response.has_errors());
        assert_eq!(response.topics()["orders"][0].error_code, 1);
        assert_eq!(response.topics()["orders"][1].error_code, 0);
    }

    #[test]
    fn flattened_view_matches_topics() {
        let frame = response_frame(
            8,
            &[
                ("orders", vec![ok_partition(0), ok_partition(3)]),
                ("payments", vec![ok_partition(1)]),
            ],
        );

        let response = FetchResponse::decode(frame, 8).unwrap();
        let total: usize = response.topics().values().map(Vec::len).sum();
        assert_eq!(response.message_sets().len(), total);

        let order: Vec<_> = response
            .message_sets()
            .iter()
            .map(|entry| (entry.topic.as_str(), entry.partition))
            .collect();
        assert_eq!(order, vec![("orders", 0), ("orders", 3), ("payments", 1)]);

        for entry in response.message_sets() {
            let data = response.partition(&entry.topic, entry.partition).unwrap();
            assert_eq!(entry.messages, data.messages);
            assert_eq!(entry.messages.len(), 2);
        }
    }

    #[test]
    fn correlation_mismatch_fails_the_whole_response() {
        let frame = response_frame(41, &[("orders", vec![ok_partition(0)])]);

        assert_eq!(
            FetchResponse::decode(frame, 42),
            Err(ProtocolError::CorrelationMismatch {
                expected: 42,
                actual: 41
            })
        );
    }

    #[test]
    fn rejects_length_mismatch() {
        let frame = response_frame(1, &[("orders", vec![ok_partition(0)])]);
        let mut corrupted = BytesMut::from(&frame[..]);
        corrupted.put_u8(0);

        assert!(matches!(
            FetchResponse::decode(corrupted.freeze(), 1),
            Err(ProtocolError::FrameLength { .. })
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut body = BytesMut::from(&unframe(response_frame(1, &[])).unwrap()[..]);
        body.put_slice(b"xy");

        assert_eq!(
            FetchResponse::decode(frame(&body), 1),
            Err(ProtocolError::TrailingBytes(2))
        );
    }

    #[test]
    fn truncated_partition_is_an_error() {
        let mut body = BytesMut::new();
        body.put_i32(1);
        body.put_i32(1);
        body.put_string("orders").unwrap();
        body.put_i32(1);
        body.put_i32(0);
        body.put_i16(0);

        assert_eq!(
            FetchResponse::decode(frame(&body), 1),
            Err(ProtocolError::UnexpectedEof {
                field: "high_water_mark"
            })
        );
    }

    #[test]
    fn oversized_topic_name_fails_serialization() {
        let mut request = FetchRequest::default();
        request.add("t".repeat(40_000), 0, 0);

        assert_eq!(
            request.to_bytes(1, None),
            Err(ProtocolError::StringTooLong(40_000))
        );
    }

    #[test]
    fn huge_partition_count_on_a_short_frame_is_an_error() {
        let mut body = BytesMut::new();
        body.put_i32(1);
        body.put_i32(1);
        body.put_string("orders").unwrap();
        body.put_i32(i32::MAX);

        assert_eq!(
            FetchResponse::decode(frame(&body), 1),
            Err(ProtocolError::UnexpectedEof {
                field: "partition_id"
            })
        );
    }

    #[test]
    fn huge_topic_count_on_a_short_frame_is_an_error() {
        let mut body = BytesMut::new();
        body.put_i32(1);
        body.put_i32(i32::MAX);

        assert_eq!(
            FetchResponse::decode(frame(&body), 1),
            Err(ProtocolError::UnexpectedEof { field: "topic_name" })
        );

        let mut request = BytesMut::from(&FetchRequest::default().to_bytes(0, None).unwrap()[4..]);
        let topic_count = request.len() - 4;
        request[topic_count..].copy_from_slice(&i32::MAX.to_be_bytes());
        assert_eq!(
            FetchRequest::decode(frame(&request)),
            Err(ProtocolError::UnexpectedEof { field: "topic_name" })
        );
    }
}
