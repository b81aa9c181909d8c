//! Network edges.
//!
//! The board only needs a transport to hand out a sending side for a published
//! key and a receiving side for a subscribed key. How chunks are encoded on a
//! real wire is the transport's business. [`LoopbackNetwork`] connects boards
//! living in the same process.

use crate::board::chunk::Chunk;
use crate::board::edge::Endpoint;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Endpoint {endpoint} unreachable: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("Gave up rising {endpoint} after {attempts} attempt(s)")]
    RiseExhausted { endpoint: String, attempts: u32 },

    #[error("Rising {endpoint} interrupted by stop")]
    Interrupted { endpoint: String },
}

/// Carries chunks between boards.
pub trait NetworkTransport: Send + Sync {
    /// Sending side for `key` published at `endpoint`.
    fn publish(&self, endpoint: &Endpoint, key: &str) -> Result<Sender<Chunk>, TransportError>;

    /// Receiving side for `key` published at `endpoint`.
    fn subscribe(&self, endpoint: &Endpoint, key: &str)
    -> Result<Receiver<Chunk>, TransportError>;
}

type Subscribers = Arc<Mutex<Vec<Sender<Chunk>>>>;

/// One published `(endpoint, key)`.
struct Route {
    /// Shared by every publisher of the route.
    tx: Sender<Chunk>,
    /// Taken by the forwarder when the first subscriber arrives.
    rx: Option<Receiver<Chunk>>,
    subscribers: Subscribers,
}

/// In-process publish/subscribe transport.
///
/// Every `(endpoint, key)` has one publishing channel. Each subscriber gets
/// its own bounded channel, fed by a forwarder thread that copies every chunk
/// to all current subscribers in publication order. Until the first subscriber
/// arrives, chunks queue on the publishing channel. A later subscriber sees
/// the stream from the point it joined.
///
/// Routes live as long as the network, so a loopback edge never reports
/// disconnection; stages on it end through stop.
pub struct LoopbackNetwork {
    capacity: usize,
    routes: Mutex<HashMap<(Endpoint, String), Route>>,
}

impl LoopbackNetwork {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            routes: Mutex::new(HashMap::new()),
        }
    }

    fn open<'a>(
        &self,
        routes: &'a mut HashMap<(Endpoint, String), Route>,
        endpoint: &Endpoint,
        key: &str,
    ) -> &'a mut Route {
        routes
            .entry((endpoint.clone(), key.to_string()))
            .or_insert_with(|| {
                debug!(%endpoint, key, "opening loopback route");
                let (tx, rx) = bounded(self.capacity);
                Route {
                    tx,
                    rx: Some(rx),
                    subscribers: Arc::new(Mutex::new(Vec::new())),
                }
            })
    }

    /// Number of `(endpoint, key)` routes opened so far.
    pub fn route_count(&self) -> usize {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of live subscribers of `key` at `endpoint`.
    pub fn subscriber_count(&self, endpoint: &Endpoint, key: &str) -> usize {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes
            .get(&(endpoint.clone(), key.to_string()))
            .map_or(0, |route| {
                route
                    .subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            })
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new(crate::defaults::EDGE_BUFFER)
    }
}

impl NetworkTransport for LoopbackNetwork {
    fn publish(&self, endpoint: &Endpoint, key: &str) -> Result<Sender<Chunk>, TransportError> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.open(&mut routes, endpoint, key).tx.clone())
    }

    fn subscribe(
        &self,
        endpoint: &Endpoint,
        key: &str,
    ) -> Result<Receiver<Chunk>, TransportError> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let route = self.open(&mut routes, endpoint, key);

        let (tx, rx) = bounded(self.capacity);
        route
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);

        if let Some(inbound) = route.rx.take() {
            let subscribers = Arc::clone(&route.subscribers);
            let spawned = thread::Builder::new()
                .name(format!("loopback {}/{}", endpoint, key))
                .spawn(move || forward(inbound, subscribers));
            if let Err(e) = spawned {
                return Err(TransportError::Unreachable {
                    endpoint: endpoint.to_string(),
                    message: format!("failed to start forwarder: {}", e),
                });
            }
            debug!(%endpoint, key, "loopback forwarder started");
        }
        Ok(rx)
    }
}

/// Copies every inbound chunk to each subscriber, pruning the ones that left.
///
/// Sends happen outside the lock so a subscriber joining mid-stream never
/// waits behind a full channel.
fn forward(inbound: Receiver<Chunk>, subscribers: Subscribers) {
    for chunk in inbound.iter() {
        let targets: Vec<Sender<Chunk>> = subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let gone: Vec<&Sender<Chunk>> = targets
            .iter()
            .filter(|tx| tx.send(chunk.clone()).is_err())
            .collect();
        if !gone.is_empty() {
            debug!(count = gone.len(), "loopback subscriber gone, pruning");
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|tx| !gone.iter().any(|g| g.same_channel(tx)));
        }
    }
}

/// Retry policy for rising a network edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RisePolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RisePolicy {
    fn default() -> Self {
        Self {
            attempts: crate::defaults::RISE_ATTEMPTS,
            backoff: Duration::from_millis(crate::defaults::RISE_BACKOFF_MS),
        }
    }
}

/// Subscribes to `key` at `endpoint`, retrying per `policy`.
///
/// Backoff waits on `stop`, so a stage being stopped gives up immediately.
pub fn rise(
    transport: &dyn NetworkTransport,
    endpoint: &Endpoint,
    key: &str,
    policy: RisePolicy,
    stop: &Receiver<()>,
) -> Result<Receiver<Chunk>, TransportError> {
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match transport.subscribe(endpoint, key) {
            Ok(rx) => {
                debug!(%endpoint, key, attempt, "network edge risen");
                return Ok(rx);
            }
            Err(e) => {
                warn!(%endpoint, key, attempt, attempts, "rise failed: {}", e);
                if attempt == attempts {
                    break;
                }
                match stop.recv_timeout(policy.backoff) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => {
                        return Err(TransportError::Interrupted {
                            endpoint: endpoint.to_string(),
                        });
                    }
                }
            }
        }
    }

    Err(TransportError::RiseExhausted {
        endpoint: endpoint.to_string(),
        attempts,
    })
}
