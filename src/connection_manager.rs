use std::{collections::HashMap, sync::Arc};

use futures::{channel::oneshot, lock::Mutex};
use tracing::{info, warn};
use url::Url;

use crate::{
    client::KafkaOptions, connection::Connection, error::ConnectionError, executor::Executor,
    DEFAULT_SERVER_PORT,
};

/// A broker endpoint normalized to `host:port`.
///
/// Accepts `host`, `host:port` and `kafka://host:port`, bare hosts get the default
/// broker port.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct BrokerAddress {
    pub url: Url,
    pub broker_url: String,
}

impl BrokerAddress {
    pub fn parse<S: AsRef<str>>(address: S) -> Result<Self, ConnectionError> {
        let address = address.as_ref().trim();
        let url = if address.contains("://") {
            Url::parse(address)
        } else {
            Url::parse(&format!("kafka://{address}"))
        }
        .map_err(|e| ConnectionError::SocketAddr(format!("{address}: {e}")))?;

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConnectionError::SocketAddr(format!("{address}: missing host")))?;
        let broker_url = format!("{}:{}", host, url.port().unwrap_or(DEFAULT_SERVER_PORT));
        Ok(BrokerAddress { url, broker_url })
    }
}

enum ConnectionStatus<Exe: Executor> {
    Connected(Arc<Connection<Exe>>),
    Connecting(Vec<oneshot::Sender<Result<Arc<Connection<Exe>>, ConnectionError>>>),
}

/// Keeps one connection per broker address.
///
/// Concurrent callers asking for a broker that is still connecting wait for that single
/// attempt instead of opening their own. A connection whose background tasks reported
/// an error is replaced on the next request. Failed attempts are not retried.
#[derive(Clone)]
pub struct ConnectionManager<Exe: Executor> {
    pub(crate) executor: Arc<Exe>,
    connections: Arc<Mutex<HashMap<String, ConnectionStatus<Exe>>>>,
    options: KafkaOptions,
}

impl<Exe: Executor> ConnectionManager<Exe> {
    pub fn new(options: KafkaOptions, executor: Arc<Exe>) -> Self {
        ConnectionManager {
            executor,
            connections: Arc::new(Mutex::new(HashMap::new())),
            options,
        }
    }

    pub async fn get_connection(
        &self,
        broker: &BrokerAddress,
    ) -> Result<Arc<Connection<Exe>>, ConnectionError> {
        let rx = {
            let mut conns = self.connections.lock().await;
            match conns.get_mut(&broker.broker_url) {
                None => None,
                Some(ConnectionStatus::Connected(conn)) => {
                    if conn.is_valid() {
                        return Ok(conn.clone());
                    }
                    warn!("dropping invalid connection {} to {}", conn.id(), conn.url());
                    conns.remove(&broker.broker_url);
                    None
                }
                Some(ConnectionStatus::Connecting(ref mut v)) => {
                    let (tx, rx) = oneshot::channel();
                    v.push(tx);
                    Some(rx)
                }
            }
        };

        match rx {
            None => self.connect(broker).await,
            Some(rx) => match rx.await {
                Ok(res) => res,
                Err(_) => Err(ConnectionError::Canceled),
            },
        }
    }

    async fn connect(
        &self,
        broker: &BrokerAddress,
    ) -> Result<Arc<Connection<Exe>>, ConnectionError> {
        let rx = {
            match self
                .connections
                .lock()
                .await
                .entry(broker.broker_url.clone())
                .or_insert_with(|| ConnectionStatus::Connecting(Vec::new()))
            {
                ConnectionStatus::Connecting(ref mut v) => {
                    if v.is_empty() {
                        None
                    } else {
                        let (tx, rx) = oneshot::channel();
                        v.push(tx);
                        Some(rx)
                    }
                }
                ConnectionStatus::Connected(conn) => return Ok(conn.clone()),
            }
        };

        if let Some(rx) = rx {
            return match rx.await {
                Ok(res) => res,
                Err(_) => Err(ConnectionError::Canceled),
            };
        }

        let start = std::time::Instant::now();
        let conn = match Connection::new(
            broker.broker_url.clone(),
            &self.options,
            self.executor.clone(),
        )
        .await
        {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                if let Some(ConnectionStatus::Connecting(mut v)) =
                    self.connections.lock().await.remove(&broker.broker_url)
                {
                    for tx in v.drain(..) {
                        let _ = tx.send(Err(ConnectionError::Canceled));
                    }
                }
                return Err(e);
            }
        };

        info!(
            "connected {} to {} in {}ms",
            conn.id(),
            broker.broker_url,
            start.elapsed().as_millis()
        );

        let old = self.connections.lock().await.insert(
            broker.broker_url.clone(),
            ConnectionStatus::Connected(conn.clone()),
        );
        match old {
            Some(ConnectionStatus::Connecting(mut v)) => {
                for tx in v.drain(..) {
                    let _ = tx.send(Ok(conn.clone()));
                }
            }
            Some(ConnectionStatus::Connected(_)) => {
                warn!("the connection to {} was already connected", broker.broker_url);
            }
            None => {}
        };

        Ok(conn)
    }

    pub fn options(&self) -> &KafkaOptions {
        &self.options
    }
}
