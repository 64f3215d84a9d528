//! Network layer: owns connection drivers, routes inbound datagrams into
//! per-port channels, fans outbound datagrams to the first driver that
//! accepts them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::channel::{Cancelled, Channel};
use crate::datagram::{Datagram, OutboundDatagram};
use crate::identity::{DeviceId, Keypair};
use crate::store::{KvStore, ScopedStore};

/// Cancellation context threaded through blocking waits. A cancelled wait
/// resolves with [`Cancelled`] instead of hanging.
#[derive(Debug, Clone, Default)]
pub struct NetworkContext {
    cancel: CancellationToken,
}

impl NetworkContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every wait using this context (or a child of it).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A context that is cancelled when `self` is, and can also be cancelled
    /// on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("peer not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("driver closed")]
    Closed,
}

/// Pluggable transport. Implementations register peer connections and push
/// inbound datagrams through the [`InboundSink`] they were created with.
#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    /// Establish (or record) a connection to a peer. `additional_info` is
    /// driver-specific, e.g. an address for a TCP driver.
    async fn register_connection(
        &self,
        peer_device_id: DeviceId,
        additional_info: Value,
    ) -> Result<(), DriverError>;

    /// Deliver one datagram to its receiver. Errors are recoverable from the
    /// network layer's point of view: it simply tries the next driver.
    async fn send_datagram(
        &self,
        datagram: &Datagram,
        ctx: &NetworkContext,
    ) -> Result<(), DriverError>;

    /// Close all connections and release resources.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Everything a driver needs from the network layer at construction time.
pub struct DriverInit {
    pub keypair: Arc<Keypair>,
    pub inbound: InboundSink,
    /// Store scoped by driver id, so drivers can remember peer state without
    /// colliding with each other.
    pub peer_store: ScopedStore,
}

pub trait ConnectionDriverFactory {
    fn id(&self) -> &str;
    fn create(&self, init: DriverInit) -> Arc<dyn ConnectionDriver>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Connectivity events, broadcast on an unbounded channel that consumers
/// drain in a loop.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Driver {
        driver: String,
        status: DriverStatus,
    },
    PeerConnected {
        peer: DeviceId,
    },
    PeerDisconnected {
        peer: DeviceId,
    },
    DriverError {
        driver: String,
        error: String,
    },
}

struct PortEntry {
    channel: Arc<Channel<Datagram>>,
    last_access: Instant,
}

/// Port-indexed channel table. Exactly one channel exists per distinct port
/// string; channels are created unbounded on first reference.
struct PortTable {
    inner: Mutex<HashMap<String, PortEntry>>,
}

impl PortTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PortEntry>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn channel_for(&self, port: &str) -> Arc<Channel<Datagram>> {
        let mut table = self.lock();
        let entry = table.entry(port.to_string()).or_insert_with(|| PortEntry {
            channel: Arc::new(Channel::unbounded()),
            last_access: Instant::now(),
        });
        entry.last_access = Instant::now();
        entry.channel.clone()
    }

    /// Evict ports that are empty, waiter-free, and idle for longer than
    /// `max_idle`, keeping at least `floor` entries. Returns evicted count.
    fn prune_idle(&self, max_idle: Duration, floor: usize) -> usize {
        let mut table = self.lock();
        if table.len() <= floor {
            return 0;
        }
        let mut evictable: Vec<(String, Instant)> = table
            .iter()
            .filter(|(_, entry)| {
                entry.channel.size() == 0 && entry.last_access.elapsed() > max_idle
            })
            .map(|(port, entry)| (port.clone(), entry.last_access))
            .collect();
        // Oldest first, and never shrink below the floor.
        evictable.sort_by_key(|(_, at)| *at);
        let budget = table.len().saturating_sub(floor);
        let mut evicted = 0;
        for (port, _) in evictable.into_iter().take(budget) {
            table.remove(&port);
            evicted += 1;
        }
        evicted
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Handle drivers use to push inbound traffic and connectivity events into
/// the network layer.
#[derive(Clone)]
pub struct InboundSink {
    ports: Arc<PortTable>,
    status: Arc<Channel<StatusUpdate>>,
}

impl InboundSink {
    /// Route a received datagram into the channel for its port, creating the
    /// channel if this is the first reference to that port.
    pub fn deliver(&self, datagram: Datagram) {
        tracing::trace!(port = %datagram.port, sender = %datagram.sender, "inbound datagram");
        let channel = self.ports.channel_for(&datagram.port);
        // Port channels are unbounded, so this cannot reject.
        channel.send(datagram);
    }

    pub fn push_status(&self, update: StatusUpdate) {
        self.status.send(update);
    }
}

/// Result of an outbound send attempt across all registered drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
}

/// Per-device router. Construct once and share by `Arc`; there are no
/// process-wide singletons.
pub struct NetworkLayer {
    keypair: Arc<Keypair>,
    drivers: Mutex<Vec<(String, Arc<dyn ConnectionDriver>)>>,
    ports: Arc<PortTable>,
    status: Arc<Channel<StatusUpdate>>,
    store: Arc<dyn KvStore>,
}

impl NetworkLayer {
    pub fn new(keypair: Arc<Keypair>, store: Arc<dyn KvStore>) -> Self {
        Self {
            keypair,
            drivers: Mutex::new(Vec::new()),
            ports: Arc::new(PortTable::new()),
            status: Arc::new(Channel::unbounded()),
            store,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.keypair.device_id()
    }

    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    /// Instantiate a driver and wire its inbound path into the port table.
    /// Drivers are tried for outbound sends in registration order.
    pub fn add_connection_driver(&self, factory: &dyn ConnectionDriverFactory) {
        let init = DriverInit {
            keypair: self.keypair.clone(),
            inbound: InboundSink {
                ports: self.ports.clone(),
                status: self.status.clone(),
            },
            peer_store: ScopedStore::new(self.store.clone(), factory.id()),
        };
        let driver = factory.create(init);
        let mut drivers = self.lock_drivers();
        if let Some(existing) = drivers.iter_mut().find(|(id, _)| id == factory.id()) {
            tracing::warn!(driver = factory.id(), "replacing already-registered driver");
            existing.1 = driver;
        } else {
            drivers.push((factory.id().to_string(), driver));
        }
    }

    /// Tell a registered driver about a peer it can reach.
    /// `additional_info` is driver-specific, e.g. `{"addr": "host:port"}`.
    pub async fn register_connection(
        &self,
        driver_id: &str,
        peer: DeviceId,
        additional_info: Value,
    ) -> Result<(), DriverError> {
        let driver = self
            .lock_drivers()
            .iter()
            .find(|(id, _)| id == driver_id)
            .map(|(_, driver)| driver.clone())
            .ok_or(DriverError::NotConnected)?;
        driver.register_connection(peer, additional_info).await
    }

    /// Stamp the local device as sender and try each driver in registration
    /// order; the first one that accepts wins. A driver error is treated as
    /// "try the next driver", with no transient/permanent distinction and no
    /// retry beyond the single pass.
    pub async fn send(&self, outbound: OutboundDatagram, ctx: &NetworkContext) -> SendOutcome {
        let datagram = outbound.stamp(self.device_id());
        let drivers: Vec<(String, Arc<dyn ConnectionDriver>)> = self.lock_drivers().clone();
        for (id, driver) in drivers {
            match driver.send_datagram(&datagram, ctx).await {
                Ok(()) => return SendOutcome { success: true },
                Err(err) => {
                    tracing::warn!(driver = %id, error = %err, port = %datagram.port,
                        "driver failed to send, trying next");
                }
            }
        }
        tracing::warn!(port = %datagram.port, receiver = %datagram.receiver,
            "all drivers failed to send");
        SendOutcome { success: false }
    }

    /// Await the next datagram addressed to `port`, creating its channel on
    /// first reference.
    pub async fn receive(&self, port: &str, ctx: &NetworkContext) -> Result<Datagram, Cancelled> {
        let channel = self.ports.channel_for(port);
        channel.pop_cancellable(ctx.token()).await
    }

    /// Unbounded connectivity event stream; drain it in a loop.
    pub fn status_updates(&self) -> Arc<Channel<StatusUpdate>> {
        self.status.clone()
    }

    /// Evict idle, empty port channels (see spec note on the ever-growing
    /// port table), keeping at least `floor` entries. Returns evicted count.
    pub fn prune_idle_ports(&self, max_idle: Duration, floor: usize) -> usize {
        let evicted = self.ports.prune_idle(max_idle, floor);
        if evicted > 0 {
            tracing::debug!(evicted, "pruned idle ports");
        }
        evicted
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Close every registered driver. Errors are logged, not propagated; a
    /// dead driver must never prevent the rest from shutting down.
    pub async fn shutdown(&self) {
        let drivers: Vec<(String, Arc<dyn ConnectionDriver>)> = self.lock_drivers().clone();
        for (id, driver) in drivers {
            if let Err(err) = driver.close().await {
                tracing::warn!(driver = %id, error = %err, "driver close failed");
            }
        }
    }

    fn lock_drivers(&self) -> std::sync::MutexGuard<'_, Vec<(String, Arc<dyn ConnectionDriver>)>> {
        match self.drivers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
