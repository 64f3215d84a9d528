//! In-process loopback driver. Connects network layers living in the same
//! process through a shared hub; the reference driver implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::datagram::Datagram;
use crate::identity::DeviceId;
use crate::network::{
    ConnectionDriver, ConnectionDriverFactory, DriverError, DriverInit, InboundSink,
    NetworkContext, StatusUpdate,
};

const DRIVER_ID: &str = "loopback";

/// Shared routing table. Every layer attached through [`LoopbackHub::factory`]
/// can reach every other attached layer.
#[derive(Default)]
pub struct LoopbackHub {
    sinks: Mutex<HashMap<DeviceId, InboundSink>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> LoopbackFactory {
        LoopbackFactory { hub: self.clone() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceId, InboundSink>> {
        match self.sinks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct LoopbackFactory {
    hub: Arc<LoopbackHub>,
}

impl ConnectionDriverFactory for LoopbackFactory {
    fn id(&self) -> &str {
        DRIVER_ID
    }

    fn create(&self, init: DriverInit) -> Arc<dyn ConnectionDriver> {
        let local = init.keypair.device_id();
        self.hub.lock().insert(local, init.inbound.clone());
        Arc::new(LoopbackDriver {
            hub: self.hub.clone(),
            local,
            inbound: init.inbound,
        })
    }
}

struct LoopbackDriver {
    hub: Arc<LoopbackHub>,
    local: DeviceId,
    inbound: InboundSink,
}

#[async_trait]
impl ConnectionDriver for LoopbackDriver {
    async fn register_connection(
        &self,
        peer_device_id: DeviceId,
        _additional_info: Value,
    ) -> Result<(), DriverError> {
        if !self.hub.lock().contains_key(&peer_device_id) {
            return Err(DriverError::NotConnected);
        }
        self.inbound.push_status(StatusUpdate::PeerConnected {
            peer: peer_device_id,
        });
        Ok(())
    }

    async fn send_datagram(
        &self,
        datagram: &Datagram,
        _ctx: &NetworkContext,
    ) -> Result<(), DriverError> {
        let sink = self
            .hub
            .lock()
            .get(&datagram.receiver)
            .cloned()
            .ok_or(DriverError::NotConnected)?;
        sink.deliver(datagram.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.hub.lock().remove(&self.local);
        Ok(())
    }
}
