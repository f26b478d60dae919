use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    channel::{mpsc, oneshot},
    future::{select, Either},
    pin_mut, Future, FutureExt, Sink, SinkExt, Stream, StreamExt,
};
use tracing::{debug, error, trace, warn};

use crate::{
    client::KafkaOptions,
    error::{ConnectionError, Error, Result, SharedError},
    executor::{Executor, ExecutorKind},
    protocol::{Command, KafkaCodec, KafkaRequest, Request, Response},
};

pub(crate) struct RegisterPair {
    correlation_id: i32,
    resolver: oneshot::Sender<Command>,
}

/// Issues correlation ids, one per request sent on a connection.
#[derive(Clone)]
pub struct SerialId(Arc<AtomicUsize>);

impl Default for SerialId {
    fn default() -> Self {
        SerialId(Arc::new(AtomicUsize::new(0)))
    }
}

impl SerialId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> i32 {
        (self.0.fetch_add(1, Ordering::Relaxed) & i32::MAX as usize) as i32
    }
}

pub struct ConnectionSender<Exe: Executor> {
    tx: mpsc::UnboundedSender<Command>,
    registrations: mpsc::UnboundedSender<RegisterPair>,
    receiver_shutdown: Option<oneshot::Sender<()>>,
    correlation_id: SerialId,
    error: SharedError,
    executor: Arc<Exe>,
    operation_timeout: Duration,
    client_id: Option<String>,
}

impl<Exe: Executor> ConnectionSender<Exe> {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Command>,
        registrations: mpsc::UnboundedSender<RegisterPair>,
        receiver_shutdown: oneshot::Sender<()>,
        error: SharedError,
        executor: Arc<Exe>,
        operation_timeout: Duration,
        client_id: Option<String>,
    ) -> Self {
        Self {
            tx,
            registrations,
            receiver_shutdown: Some(receiver_shutdown),
            correlation_id: SerialId::new(),
            error,
            executor,
            operation_timeout,
            client_id,
        }
    }

    /// Sends `request` under a fresh correlation id and decodes the one response frame
    /// that echoes it.
    pub async fn send<R: Request>(&self, request: &R) -> Result<R::Response> {
        let (resolver, response) = oneshot::channel();
        let response = async {
            response.await.map_err(|oneshot::Canceled| {
                self.error.set(ConnectionError::Disconnected);
                ConnectionError::Disconnected
            })
        };
        let correlation_id = self.correlation_id.get();
        let frame = request.to_bytes(correlation_id, self.client_id.as_deref())?;
        trace!(
            "sending api_key {:?} correlation_id {}, {} bytes",
            R::API_KEY,
            correlation_id,
            frame.len()
        );

        match (
            self.registrations.unbounded_send(RegisterPair {
                correlation_id,
                resolver,
            }),
            self.tx.unbounded_send(Command::Request(KafkaRequest {
                correlation_id,
                frame,
            })),
        ) {
            (Ok(_), Ok(_)) => {
                let delay_f = self.executor.delay(self.operation_timeout);
                pin_mut!(response);
                pin_mut!(delay_f);

                match select(response, delay_f).await {
                    Either::Left((Ok(Command::Response(res)), _)) => {
                        Ok(<R::Response as Response>::decode(
                            res.frame,
                            correlation_id,
                        )?)
                    }
                    Either::Left((Err(e), _)) => Err(e.into()),
                    Either::Left((Ok(Command::Request(_)), _)) => {
                        Err(Error::Connection(ConnectionError::UnexpectedResponse(
                            "receive an invalid request".into(),
                        )))
                    }
                    Either::Right(_) => Err(ConnectionError::Timeout.into()),
                }
            }
            _ => Err(ConnectionError::Disconnected.into()),
        }
    }
}

struct Receiver<S: Stream<Item = std::result::Result<Command, ConnectionError>>> {
    inbound: Pin<Box<S>>,
    error: SharedError,
    pending_requests: BTreeMap<i32, oneshot::Sender<Command>>,
    registrations: Pin<Box<mpsc::UnboundedReceiver<RegisterPair>>>,
    shutdown: Pin<Box<oneshot::Receiver<()>>>,
}

impl<S: Stream<Item = std::result::Result<Command, ConnectionError>>> Receiver<S> {
    pub fn new(
        inbound: S,
        error: SharedError,
        registrations: mpsc::UnboundedReceiver<RegisterPair>,
        shutdown: oneshot::Receiver<()>,
    ) -> Self {
        Receiver {
            inbound: Box::pin(inbound),
            error,
            pending_requests: BTreeMap::new(),
            registrations: Box::pin(registrations),
            shutdown: Box::pin(shutdown),
        }
    }
}

impl<S: Stream<Item = std::result::Result<Command, ConnectionError>>> Future for Receiver<S> {
    type Output = std::result::Result<(), ()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.shutdown.as_mut().poll(cx) {
            Poll::Ready(Ok(())) | Poll::Ready(Err(oneshot::Canceled)) => {
                return Poll::Ready(Err(()));
            }
            Poll::Pending => {}
        }

        loop {
            match self.registrations.as_mut().poll_next(cx) {
                Poll::Ready(Some(RegisterPair {
                    correlation_id,
                    resolver,
                })) => {
                    self.pending_requests.insert(correlation_id, resolver);
                }
                Poll::Ready(None) => {
                    self.error.set(ConnectionError::Disconnected);
                    return Poll::Ready(Err(()));
                }
                Poll::Pending => break,
            }
        }

        // senders that timed out dropped their receiver
        self.pending_requests
            .retain(|_, resolver| !resolver.is_canceled());

        loop {
            match self.inbound.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(Command::Response(res)))) => {
                    let correlation_id = res.correlation_id;
                    match self.pending_requests.remove(&correlation_id) {
                        Some(resolver) => {
                            let _ = resolver.send(Command::Response(res));
                        }
                        None => {
                            warn!(
                                "dropping response frame without a pending request, \
                                 correlation_id: {}",
                                correlation_id
                            );
                        }
                    }
                }
                Poll::Ready(Some(Ok(Command::Request(req)))) => {
                    warn!(
                        "ignoring inbound request frame, correlation_id: {}",
                        req.correlation_id
                    );
                }
                Poll::Ready(None) => {
                    self.error.set(ConnectionError::Disconnected);
                    return Poll::Ready(Err(()));
                }
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Err(e))) => {
                    self.error.set(e);
                    return Poll::Ready(Err(()));
                }
            }
        }
    }
}

pub struct Connection<Exe: Executor> {
    id: i64,
    url: String,
    sender: ConnectionSender<Exe>,
}

impl<Exe: Executor> Connection<Exe> {
    pub async fn new(
        url: String,
        options: &KafkaOptions,
        executor: Arc<Exe>,
    ) -> std::result::Result<Connection<Exe>, ConnectionError> {
        debug!("connecting to {}", url);
        let sender_prepare = Connection::prepare_stream(&url, executor.clone(), options);
        let delay_f = executor.delay(options.connection_timeout);

        pin_mut!(sender_prepare);
        pin_mut!(delay_f);

        let sender = match select(sender_prepare, delay_f).await {
            Either::Left((s, _)) => s?,
            Either::Right(_) => {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timeout connecting to the kafka server.",
                )))
            }
        };

        Ok(Connection {
            id: rand::random(),
            url: url.clone(),
            sender,
        })
    }

    async fn prepare_stream(
        address: &str,
        executor: Arc<Exe>,
        options: &KafkaOptions,
    ) -> std::result::Result<ConnectionSender<Exe>, ConnectionError> {
        let codec = KafkaCodec::default();
        let operation_timeout = options.operation_timeout;
        let client_id = options.client_id.clone();
        match executor.kind() {
            #[cfg(feature = "tokio-runtime")]
            ExecutorKind::Tokio => {
                let stream = tokio::net::TcpStream::connect(address)
                    .await
                    .map(|stream| tokio_util::codec::Framed::new(stream, codec))?;
                Connection::connect(stream, executor, operation_timeout, client_id).await
            }
            #[cfg(feature = "async-std-runtime")]
            ExecutorKind::AsyncStd => {
                let stream = async_std::net::TcpStream::connect(address)
                    .await
                    .map(|stream| asynchronous_codec::Framed::new(stream, codec))?;
                Connection::connect(stream, executor, operation_timeout, client_id).await
            }
            #[cfg(not(feature = "tokio-runtime"))]
            ExecutorKind::Tokio => {
                unimplemented!("the tokio-runtime cargo feature is not active.");
            }
            #[cfg(not(feature = "async-std-runtime"))]
            ExecutorKind::AsyncStd => {
                unimplemented!("the async-std-runtime cargo feature is not active.");
            }
        }
    }

    /// Spawns the reader and writer tasks over an already framed stream.
    pub async fn connect<S>(
        stream: S,
        executor: Arc<Exe>,
        operation_timeout: Duration,
        client_id: Option<String>,
    ) -> std::result::Result<ConnectionSender<Exe>, ConnectionError>
    where
        S: Stream<Item = std::result::Result<Command, ConnectionError>>,
        S: Sink<Command, Error = ConnectionError>,
        S: Send + std::marker::Unpin + 'static,
    {
        let (mut sink, stream) = stream.split();
        let (tx, mut rx) = mpsc::unbounded();
        let (registrations_tx, registrations_rx) = mpsc::unbounded();
        let error = SharedError::new();
        let (receiver_shutdown_tx, receiver_shutdown_rx) = oneshot::channel();

        if executor
            .spawn(Box::pin(
                Receiver::new(stream, error.clone(), registrations_rx, receiver_shutdown_rx)
                    .map(|_| ()),
            ))
            .is_err()
        {
            error!("the executor could not spawn the receiver future");
            return Err(ConnectionError::Shutdown);
        }

        let err = error.clone();
        let res = executor.spawn(Box::pin(async move {
            while let Some(cmd) = rx.next().await {
                if let Err(e) = sink.send(cmd).await {
                    error!("error occur: {:?}", e);
                    err.set(e);
                    break;
                }
            }
        }));
        if res.is_err() {
            error!("the executor could not spawn the sender future");
            return Err(ConnectionError::Shutdown);
        }

        Ok(ConnectionSender::new(
            tx,
            registrations_tx,
            receiver_shutdown_tx,
            error,
            executor,
            operation_timeout,
            client_id,
        ))
    }

    pub fn sender(&self) -> &ConnectionSender<Exe> {
        &self.sender
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_valid(&self) -> bool {
        !self.sender.error.is_set()
    }
}

impl<Exe: Executor> Drop for Connection<Exe> {
    fn drop(&mut self) {
        trace!("dropping connection {} for {}", self.id, self.url);
        if let Some(shutdown) = self.sender.receiver_shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
