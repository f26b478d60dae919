use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    connection_manager::{BrokerAddress, ConnectionManager},
    error::Result,
    executor::Executor,
    protocol::{FetchRequest, FetchResponse, Request},
};

#[derive(Debug, Clone)]
pub struct KafkaOptions {
    pub client_id: Option<String>,
    /// time limit to establish a broker connection
    pub connection_timeout: Duration,
    /// time limit to receive the response to a request
    pub operation_timeout: Duration,
}

impl Default for KafkaOptions {
    fn default() -> Self {
        Self {
            client_id: Some("kfetch".into()),
            connection_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl KafkaOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn client_id<S: Into<String>>(&mut self, client_id: S) -> &mut Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn connection_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn operation_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.operation_timeout = timeout;
        self
    }
}

/// Sends requests to brokers addressed explicitly by the caller.
///
/// There is no metadata lookup: the caller picks the broker leading the partitions it
/// fetches. Failed requests are returned as they are, retrying is up to the caller.
#[derive(Clone)]
pub struct Kafka<Exe: Executor> {
    pub manager: Arc<ConnectionManager<Exe>>,
    pub executor: Arc<Exe>,
}

impl<Exe: Executor> Kafka<Exe> {
    pub fn new(options: KafkaOptions, executor: Exe) -> Self {
        let executor = Arc::new(executor);
        let manager = Arc::new(ConnectionManager::new(options, executor.clone()));
        Kafka { manager, executor }
    }

    pub fn options(&self) -> &KafkaOptions {
        self.manager.options()
    }

    /// Sends any request to `broker` and waits for its correlated response.
    pub async fn invoke<R: Request>(&self, broker: &str, request: &R) -> Result<R::Response> {
        let broker = BrokerAddress::parse(broker)?;
        let conn = self.manager.get_connection(&broker).await?;
        conn.sender().send(request).await
    }

    pub async fn fetch(&self, broker: &str, request: &FetchRequest) -> Result<FetchResponse> {
        debug!(
            "fetching {} partitions of {} topics from {}",
            request.partition_count(),
            request.topics().len(),
            broker
        );
        let response = self.invoke(broker, request).await?;

        if response.has_errors() {
            for (topic, partition, error) in response.errors() {
                warn!("Fetch topic [{} - {}] error: {}", topic, partition, error);
            }
        }
        Ok(response)
    }
}

impl FetchRequest {
    /// Sends this request to `broker` through `client`.
    pub async fn send<Exe: Executor>(
        &self,
        client: &Kafka<Exe>,
        broker: &str,
    ) -> Result<FetchResponse> {
        client.fetch(broker, self).await
    }
}

#[cfg(all(test, feature = "tokio-runtime"))]
mod tests {
    use bytes::BytesMut;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::{
        error::{ConnectionError, Error},
        executor::TokioExecutor,
        protocol::fetch::tests::{response_frame, PartitionFixture},
    };

    async fn read_frame(stream: &mut TcpStream) -> bytes::Bytes {
        let len = stream.read_i32().await.unwrap();
        let mut frame = BytesMut::zeroed(len as usize + 4);
        frame[..4].copy_from_slice(&len.to_be_bytes());
        stream.read_exact(&mut frame[4..]).await.unwrap();
        frame.freeze()
    }

    /// Serves `rounds` fetch requests on one connection, answering each partition with
    /// `error_code` and one message at the requested offset.
    async fn spawn_broker(rounds: usize, error_code: i16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for _ in 0..rounds {
                let (header, request) = FetchRequest::decode(read_frame(&mut stream).await).unwrap();
                assert_eq!(header.client_id.as_deref(), Some("fetch-test"));

                let values: Vec<Vec<(i64, &str)>> = request
                    .topics()
                    .values()
                    .flat_map(|specs| specs.iter().map(|spec| vec![(spec.fetch_offset, "m")]))
                    .collect();
                let mut values = values.iter();
                let topics: Vec<(&str, Vec<PartitionFixture<'_>>)> = request
                    .topics()
                    .iter()
                    .map(|(topic, specs)| {
                        let partitions = specs
                            .iter()
                            .zip(values.by_ref())
                            .map(|(spec, messages)| PartitionFixture {
                                partition: spec.partition,
                                error_code,
                                high_water_mark: spec.fetch_offset + 1,
                                messages: messages.as_slice(),
                            })
                            .collect();
                        (topic.as_str(), partitions)
                    })
                    .collect();

                let frame = response_frame(header.correlation_id, &topics);
                stream.write_all(&frame).await.unwrap();
            }
        });

        address
    }

    fn client() -> Kafka<TokioExecutor> {
        let mut options = KafkaOptions::new();
        options
            .client_id("fetch-test")
            .operation_timeout(Duration::from_secs(5));
        Kafka::new(options, TokioExecutor)
    }

    #[tokio::test]
    async fn fetches_over_tcp() {
        let address = spawn_broker(2, 0).await;
        let client = client();

        let mut request = FetchRequest::new(1000, 1);
        request
            .add_with_max_bytes("orders", 0, 100, 4096)
            .add("orders", 1, 50)
            .add("payments", 0, 7);

        let response = request.send(&client, &address).await.unwrap();
        assert!(!response.has_errors());
        assert_eq!(response.message_sets().len(), 3);
        assert_eq!(response.partition("orders", 1).unwrap().next_offset(), Some(51));
        assert_eq!(response.partition("payments", 0).unwrap().high_water_mark, 8);

        // the second round reuses the cached connection
        let response = client.fetch(&address, &request).await.unwrap();
        assert_eq!(response.message_sets()[0].messages.last_offset(), Some(100));
    }

    #[tokio::test]
    async fn partition_errors_are_returned_as_data() {
        let address = spawn_broker(1, 6).await;
        let client = client();

        let mut request = FetchRequest::default();
        request.add("orders", 0, 0);

        let response = client.fetch(&address, &request).await.unwrap();
        assert!(response.has_errors());
        assert_eq!(response.topics()["orders"][0].error_code, 6);
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut request = FetchRequest::default();
        request.add("orders", 0, 0);

        let result = client().fetch(&address, &request).await;
        assert!(matches!(result, Err(Error::Connection(ConnectionError::Io(_)))));
    }
}
