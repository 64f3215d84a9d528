// Weft node: datagram routing daemon with a TCP transport driver.

mod config;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use weft_core::permissions::{AuthorityKind, PermissionInput};
use weft_core::{
    DeviceId, Keypair, Matcher, MemoryStore, NetworkContext, NetworkLayer, Permission,
    PermissionCache, RootIdentity, RpcDefinition, RpcError,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const PRUNE_MAX_IDLE: Duration = Duration::from_secs(300);
const PRUNE_FLOOR: usize = 32;

/// Request payload for the permission-granting RPC.
#[derive(Debug, Serialize, Deserialize)]
struct AskPermission {
    resource_id: Vec<String>,
    action_id: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("weft-node {VERSION}");
            return Ok(());
        }
    }

    let cfg = config::load();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        cfg.log_filter
            .as_deref()
            .unwrap_or("info")
            .into()
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let keypair = Arc::new(load_or_create_keypair()?);
    tracing::info!(device_id = %keypair.device_id(), version = VERSION, "starting weft node");

    let net = Arc::new(NetworkLayer::new(keypair, Arc::new(MemoryStore::new())));
    net.add_connection_driver(&transport::TcpFactory::new(cfg.listen_port));

    for peer in &cfg.peers {
        let device_id: DeviceId = match peer.device_id.parse() {
            Ok(id) => id,
            Err(_) => {
                tracing::warn!(device_id = %peer.device_id, "invalid peer device id in config");
                continue;
            }
        };
        if let Err(err) = net
            .register_connection(
                transport::DRIVER_ID,
                device_id,
                serde_json::json!({ "addr": peer.addr }),
            )
            .await
        {
            tracing::warn!(peer = %device_id, error = %err, "could not register configured peer");
        }
    }

    let ctx = NetworkContext::new();

    // This node's keypair doubles as its permission-granting authority.
    let root = Arc::new(RootIdentity {
        id: net.device_id().to_string(),
        keypair: Keypair::from_seed(net.keypair().to_seed()),
    });
    let cache = Arc::new(PermissionCache::new(Arc::new(MemoryStore::new())));

    // Peers ask this node to grant them access to a resource. Grants are
    // idempotent per scope, so repeated asks return the same certificate.
    {
        let net = net.clone();
        let ctx = ctx.child();
        let cache = cache.clone();
        let root = root.clone();
        tokio::spawn(async move {
            let ask = RpcDefinition::<AskPermission, Permission>::new("weft.permission.ask");
            ask.serve(&net, &ctx, move |request, responder| {
                let cache = cache.clone();
                let root = root.clone();
                async move {
                    let input = PermissionInput {
                        device_id: vec![Matcher::exact(request.peer.to_string())],
                        user_id: vec![Matcher::exact(root.id.clone())],
                        resource_id: request.input.resource_id.into_iter().map(Matcher::exact).collect(),
                        action_id: request.input.action_id.into_iter().map(Matcher::exact).collect(),
                        expires_at: None,
                        allow: true,
                    };
                    let permission = cache
                        .create_permission(&input, AuthorityKind::UserRoot, &root)
                        .await
                        .map_err(|err| RpcError::Handler(err.to_string()))?;
                    tracing::info!(peer = %request.peer, "granted permission");
                    responder.send(&permission).await
                }
            })
            .await;
        });
    }

    // Diagnostics RPC: echoes whatever a peer sends.
    {
        let net = net.clone();
        let ctx = ctx.child();
        tokio::spawn(async move {
            let echo = RpcDefinition::<serde_json::Value, serde_json::Value>::new("weft.echo");
            echo.serve(&net, &ctx, |request, responder| async move {
                tracing::debug!(peer = %request.peer, "echo");
                responder.send(&request.input).await
            })
            .await;
        });
    }

    // Log connectivity events.
    {
        let net = net.clone();
        let ctx = ctx.child();
        tokio::spawn(async move {
            let status = net.status_updates();
            while let Ok(update) = status.pop_cancellable(ctx.token()).await {
                tracing::info!(?update, "network status");
            }
        });
    }

    // Keep the port table from growing without bound.
    {
        let net = net.clone();
        let ctx = ctx.child();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.token().cancelled() => break,
                    _ = tokio::time::sleep(PRUNE_INTERVAL) => {
                        net.prune_idle_ports(PRUNE_MAX_IDLE, PRUNE_FLOOR);
                    }
                }
            }
        });
    }

    shutdown_signal().await?;
    tracing::info!("shutting down");
    ctx.cancel();
    net.shutdown().await;
    Ok(())
}

fn key_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/weft/device.key"))
}

/// Load the device identity from disk, creating and persisting one on first
/// run so the device id stays stable across restarts.
fn load_or_create_keypair() -> anyhow::Result<Keypair> {
    let Some(path) = key_path() else {
        tracing::warn!("HOME not set, using an ephemeral identity");
        return Ok(Keypair::generate());
    };
    if path.exists() {
        let bytes = std::fs::read(&path)
            .with_context(|| format!("reading device key {}", path.display()))?;
        let seed = <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| anyhow::anyhow!("corrupt device key at {}", path.display()))?;
        return Ok(Keypair::from_seed(seed));
    }

    let keypair = Keypair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(&path, keypair.to_seed())
        .with_context(|| format!("writing device key {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    tracing::info!(path = %path.display(), "created device identity");
    Ok(keypair)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
