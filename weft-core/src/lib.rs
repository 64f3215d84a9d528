//! Device-addressed messaging substrate: channels, datagram routing over
//! pluggable transport drivers, streaming RPC, and signed capability
//! permissions. Transport-agnostic; drivers live with their hosts.

pub mod channel;
pub mod datagram;
pub mod identity;
pub mod loopback;
pub mod network;
pub mod packet;
pub mod permissions;
pub mod rpc;
pub mod store;

pub use channel::{Cancelled, Channel};
pub use datagram::{listener_port, rpc_response_port, Datagram, OutboundDatagram};
pub use identity::{DeviceId, Keypair, PublicKey};
pub use network::{
    ConnectionDriver, ConnectionDriverFactory, DriverError, DriverInit, DriverStatus, InboundSink,
    NetworkContext, NetworkLayer, SendOutcome, StatusUpdate,
};
pub use permissions::{
    Action, Authority, AuthorityKind, Cert, Identity, Matcher, Permission, PermissionCache,
    PermissionInput, PermissionResult, RootIdentity,
};
pub use rpc::{
    RpcCallStream, RpcChunk, RpcDefinition, RpcError, RpcRequest, RpcResponder, ValidationError,
};
pub use store::{KvStore, MemoryStore, ScopedStore, StoreError};
