//! Datagram: the atomic unit of communication between devices.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::DeviceId;

/// One addressed message unit. Constructed by the sender at call time,
/// immutable once sent, consumed exactly once by whichever channel dequeues
/// it. `sender`/`receiver` are stable device identifiers, not connection
/// handles; `port` partitions concurrently pending exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datagram {
    pub sender: DeviceId,
    pub receiver: DeviceId,

    /// Data port on the receiver device. Ports are independent of each other.
    pub port: String,

    /// Transient correlation tag, e.g. for RPC exchanges. Always present;
    /// raw sends use it as a unique tag too.
    #[serde(rename = "requestId")]
    pub request_id: String,

    /// `Some(true)` means no further datagrams will arrive for this request id.
    #[serde(
        rename = "closeRequestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub close_request_id: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Datagram {
    /// Whether this datagram is the stream terminator for its request id.
    pub fn is_close(&self) -> bool {
        self.close_request_id == Some(true)
    }
}

/// A datagram before the network layer stamps the local device as sender.
#[derive(Debug, Clone)]
pub struct OutboundDatagram {
    pub receiver: DeviceId,
    pub port: String,
    pub request_id: String,
    pub close_request_id: Option<bool>,
    pub data: Option<Value>,
}

impl OutboundDatagram {
    pub fn stamp(self, sender: DeviceId) -> Datagram {
        Datagram {
            sender,
            receiver: self.receiver,
            port: self.port,
            request_id: self.request_id,
            close_request_id: self.close_request_id,
            data: self.data,
        }
    }
}

/// Port carrying the response stream for an RPC request.
pub fn rpc_response_port(request_id: &str) -> String {
    format!("rpc:{request_id}")
}

/// Port for a raw channel listener, by convention.
pub fn listener_port(channel_name: &str) -> String {
    format!("chan-{channel_name}")
}
