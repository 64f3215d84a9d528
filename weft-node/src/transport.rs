//! TCP transport driver: version + identity handshake, then length-prefixed
//! JSON datagram frames. One writer task per live peer connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use weft_core::network::{
    ConnectionDriver, ConnectionDriverFactory, DriverError, DriverInit, DriverStatus, InboundSink,
    NetworkContext, StatusUpdate,
};
use weft_core::{Datagram, DeviceId, Keypair, PublicKey, ScopedStore};

pub const WIRE_VERSION: u8 = 1;
pub const DRIVER_ID: &str = "tcp";

const HANDSHAKE_SIZE: usize = 1 + 16 + 32; // version + device_id + public_key
const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub struct TcpFactory {
    listen_port: u16,
}

impl TcpFactory {
    pub fn new(listen_port: u16) -> Self {
        Self { listen_port }
    }
}

impl ConnectionDriverFactory for TcpFactory {
    fn id(&self) -> &str {
        DRIVER_ID
    }

    fn create(&self, init: DriverInit) -> Arc<dyn ConnectionDriver> {
        let shared = Arc::new(Shared {
            keypair: init.keypair,
            inbound: init.inbound,
            store: init.peer_store,
            peers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(listen(shared.clone(), self.listen_port));
        Arc::new(TcpDriver { shared })
    }
}

struct Shared {
    keypair: Arc<Keypair>,
    inbound: InboundSink,
    store: ScopedStore,
    peers: Mutex<HashMap<DeviceId, mpsc::UnboundedSender<Datagram>>>,
    cancel: CancellationToken,
}

pub struct TcpDriver {
    shared: Arc<Shared>,
}

#[async_trait]
impl ConnectionDriver for TcpDriver {
    /// Remember the peer's address and dial it. The address is persisted in
    /// the driver's scoped store so later sends can redial after a drop.
    async fn register_connection(
        &self,
        peer_device_id: DeviceId,
        additional_info: Value,
    ) -> Result<(), DriverError> {
        let Some(addr) = additional_info.get("addr").and_then(Value::as_str) else {
            return Err(DriverError::Transport(
                "missing \"addr\" in connection info".into(),
            ));
        };
        self.shared
            .store
            .set_value(&[peer_device_id.to_string()], Value::String(addr.into()))
            .await
            .map_err(|err| DriverError::Transport(err.to_string()))?;

        let connected = dial(&self.shared, addr).await?;
        if connected != peer_device_id {
            tracing::warn!(expected = %peer_device_id, actual = %connected,
                "dialed address belongs to a different device");
            return Err(DriverError::NotConnected);
        }
        Ok(())
    }

    /// Send over the live connection, redialing via the stored address if
    /// the connection has dropped since registration.
    async fn send_datagram(
        &self,
        datagram: &Datagram,
        _ctx: &NetworkContext,
    ) -> Result<(), DriverError> {
        let peer = datagram.receiver;
        if self.try_send(peer, datagram).await {
            return Ok(());
        }

        let addr = self
            .shared
            .store
            .get_value(&[peer.to_string()])
            .await
            .map_err(|err| DriverError::Transport(err.to_string()))?
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or(DriverError::NotConnected)?;
        let connected = dial(&self.shared, &addr).await?;
        if connected != peer {
            return Err(DriverError::NotConnected);
        }
        if self.try_send(peer, datagram).await {
            Ok(())
        } else {
            Err(DriverError::Closed)
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.shared.cancel.cancel();
        self.shared.peers.lock().await.clear();
        Ok(())
    }
}

impl TcpDriver {
    async fn try_send(&self, peer: DeviceId, datagram: &Datagram) -> bool {
        let mut peers = self.shared.peers.lock().await;
        match peers.get(&peer) {
            Some(tx) => {
                if tx.send(datagram.clone()).is_ok() {
                    true
                } else {
                    // Writer task is gone; drop the stale entry.
                    peers.remove(&peer);
                    false
                }
            }
            None => false,
        }
    }
}

async fn listen(shared: Arc<Shared>, port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(port, error = %err, "tcp driver failed to bind");
            shared.inbound.push_status(StatusUpdate::DriverError {
                driver: DRIVER_ID.into(),
                error: err.to_string(),
            });
            return;
        }
    };
    tracing::info!(port, "tcp driver listening");
    shared.inbound.push_status(StatusUpdate::Driver {
        driver: DRIVER_ID.into(),
        status: DriverStatus::Connected,
    });

    loop {
        let stream = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            },
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            match handshake_accept(&mut stream, &shared.keypair).await {
                Ok(peer) => run_connection(shared, stream, peer).await,
                Err(err) => tracing::warn!(error = %err, "inbound handshake failed"),
            }
        });
    }
    shared.inbound.push_status(StatusUpdate::Driver {
        driver: DRIVER_ID.into(),
        status: DriverStatus::Disconnected,
    });
}

async fn dial(shared: &Arc<Shared>, addr: &str) -> Result<DeviceId, DriverError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|err| DriverError::Transport(err.to_string()))?;
    let peer = handshake_connect(&mut stream, &shared.keypair)
        .await
        .map_err(|err| DriverError::Transport(err.to_string()))?;
    tokio::spawn(run_connection(shared.clone(), stream, peer));
    Ok(peer)
}

/// Accept side: read the peer's hello, then send ours.
async fn handshake_accept(stream: &mut TcpStream, keypair: &Keypair) -> std::io::Result<DeviceId> {
    let (mut r, mut w) = stream.split();
    let mut buf = [0u8; HANDSHAKE_SIZE];
    r.read_exact(&mut buf).await?;
    let peer = parse_hello(&buf)?;
    w.write_all(&hello_bytes(keypair)).await?;
    w.flush().await?;
    Ok(peer)
}

/// Connect side: send our hello first, then read the peer's.
async fn handshake_connect(stream: &mut TcpStream, keypair: &Keypair) -> std::io::Result<DeviceId> {
    let (mut r, mut w) = stream.split();
    w.write_all(&hello_bytes(keypair)).await?;
    w.flush().await?;
    let mut buf = [0u8; HANDSHAKE_SIZE];
    r.read_exact(&mut buf).await?;
    parse_hello(&buf)
}

fn hello_bytes(keypair: &Keypair) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = WIRE_VERSION;
    out[1..17].copy_from_slice(keypair.device_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out
}

fn parse_hello(buf: &[u8; HANDSHAKE_SIZE]) -> std::io::Result<DeviceId> {
    if buf[0] != WIRE_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported wire version",
        ));
    }
    let mut device_id = [0u8; 16];
    device_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    let claimed = DeviceId::from_bytes(device_id);
    // The device id must actually be derived from the presented key.
    if DeviceId::from_public_key(PublicKey::from_bytes(public_key).as_bytes()) != claimed {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "device id does not match public key",
        ));
    }
    Ok(claimed)
}

async fn run_connection(shared: Arc<Shared>, stream: TcpStream, peer: DeviceId) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Datagram>();
    shared.peers.lock().await.insert(peer, tx);
    shared
        .inbound
        .push_status(StatusUpdate::PeerConnected { peer });
    tracing::info!(%peer, "peer connected");

    let write_cancel = shared.cancel.clone();
    tokio::spawn(async move {
        loop {
            let datagram = tokio::select! {
                _ = write_cancel.cancelled() => break,
                d = rx.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
            };
            let bytes = match serde_json::to_vec(&datagram) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(error = %err, "failed to encode datagram");
                    continue;
                }
            };
            let len = bytes.len() as u32;
            if writer.write_all(&len.to_le_bytes()).await.is_err()
                || writer.write_all(&bytes).await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(datagram)) => shared.inbound.deliver(datagram),
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "dropping connection");
                break;
            }
        }
    }

    shared.peers.lock().await.remove(&peer);
    shared
        .inbound
        .push_status(StatusUpdate::PeerDisconnected { peer });
    tracing::info!(%peer, "peer disconnected");
}

/// One length-prefixed frame; `None` on clean EOF at a frame boundary.
async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<Datagram>> {
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let datagram = serde_json::from_slice(&buf)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    Ok(Some(datagram))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::{MemoryStore, NetworkContext, NetworkLayer, OutboundDatagram};

    async fn layer(port: u16) -> Arc<NetworkLayer> {
        let net = Arc::new(NetworkLayer::new(
            Arc::new(Keypair::generate()),
            Arc::new(MemoryStore::new()),
        ));
        net.add_connection_driver(&TcpFactory::new(port));
        // Give the listener a beat to bind.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        net
    }

    #[tokio::test]
    async fn hello_roundtrip() {
        let kp = Keypair::generate();
        let bytes = hello_bytes(&kp);
        assert_eq!(parse_hello(&bytes).unwrap(), kp.device_id());
    }

    #[tokio::test]
    async fn hello_rejects_forged_device_id() {
        let kp = Keypair::generate();
        let mut bytes = hello_bytes(&kp);
        bytes[1] ^= 0xff;
        assert!(parse_hello(&bytes).is_err());
    }

    #[tokio::test]
    async fn hello_rejects_wrong_version() {
        let kp = Keypair::generate();
        let mut bytes = hello_bytes(&kp);
        bytes[0] = 99;
        assert!(parse_hello(&bytes).is_err());
    }

    #[tokio::test]
    async fn datagrams_flow_over_tcp() {
        let a = layer(46710).await;
        let b = layer(46711).await;
        let ctx = NetworkContext::new();

        a.register_connection("tcp", b.device_id(), json!({ "addr": "127.0.0.1:46711" }))
            .await
            .expect("register");

        let outcome = a
            .send(
                OutboundDatagram {
                    receiver: b.device_id(),
                    port: "inbox".into(),
                    request_id: "r1".into(),
                    close_request_id: None,
                    data: Some(json!({ "n": 1 })),
                },
                &ctx,
            )
            .await;
        assert!(outcome.success);

        let got = b.receive("inbox", &ctx).await.expect("not cancelled");
        assert_eq!(got.sender, a.device_id());
        assert_eq!(got.data, Some(json!({ "n": 1 })));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn replies_flow_back_over_the_accepted_connection() {
        let a = layer(46712).await;
        let b = layer(46713).await;
        let ctx = NetworkContext::new();

        a.register_connection("tcp", b.device_id(), json!({ "addr": "127.0.0.1:46713" }))
            .await
            .expect("register");

        a.send(
            OutboundDatagram {
                receiver: b.device_id(),
                port: "ping".into(),
                request_id: "r1".into(),
                close_request_id: None,
                data: None,
            },
            &ctx,
        )
        .await;
        let ping = b.receive("ping", &ctx).await.expect("not cancelled");

        // B never registered A; the accepted connection is the route back.
        let outcome = b
            .send(
                OutboundDatagram {
                    receiver: ping.sender,
                    port: "pong".into(),
                    request_id: "r1".into(),
                    close_request_id: None,
                    data: None,
                },
                &ctx,
            )
            .await;
        assert!(outcome.success);
        let pong = a.receive("pong", &ctx).await.expect("not cancelled");
        assert_eq!(pong.sender, b.device_id());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn register_fails_when_nobody_listens() {
        let a = layer(46714).await;
        let err = a
            .register_connection(
                "tcp",
                Keypair::generate().device_id(),
                json!({ "addr": "127.0.0.1:1" }),
            )
            .await;
        assert!(err.is_err());
        a.shutdown().await;
    }
}
