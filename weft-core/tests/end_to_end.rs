//! Two network layers wired through the in-process loopback driver,
//! exercising RPC and permission gating end to end.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use weft_core::loopback::LoopbackHub;
use weft_core::permissions::{create_permission, AuthorityKind, PermissionInput};
use weft_core::{
    Action, Keypair, Matcher, MemoryStore, NetworkContext, NetworkLayer, Permission,
    PermissionCache, RootIdentity, RpcDefinition,
};

fn layer(hub: &Arc<LoopbackHub>) -> Arc<NetworkLayer> {
    let net = Arc::new(NetworkLayer::new(
        Arc::new(Keypair::generate()),
        Arc::new(MemoryStore::new()),
    ));
    net.add_connection_driver(&hub.factory());
    net
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoIn {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoOut {
    text: String,
}

#[tokio::test]
async fn echo_rpc_across_two_layers() {
    let hub = LoopbackHub::new();
    let caller = layer(&hub);
    let callee = layer(&hub);
    let ctx = NetworkContext::new();

    let server = {
        let callee = callee.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let echo = RpcDefinition::<EchoIn, EchoOut>::new("echo");
            echo.single_exec(&callee, &ctx, |request, responder| async move {
                responder
                    .send(&EchoOut {
                        text: request.input.text,
                    })
                    .await
            })
            .await
        })
    };

    let echo = RpcDefinition::<EchoIn, EchoOut>::new("echo");
    let mut stream = echo
        .call(&caller, callee.device_id(), &EchoIn { text: "hi".into() }, &ctx)
        .await
        .expect("call");

    let mut got = Vec::new();
    while let Some(chunk) = stream.next(&ctx).await.expect("not cancelled") {
        got.push(chunk.payload.expect("valid payload").text);
    }
    assert_eq!(got, vec!["hi".to_string()]);
    server.await.expect("join").expect("handler ok");
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadNoteIn {
    note_id: String,
    permission: Permission,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
enum ReadNoteOut {
    Content(String),
    Denied,
}

/// A handler that gates on a signed permission carried in the request.
#[tokio::test]
async fn permission_gated_rpc() {
    let hub = LoopbackHub::new();
    let caller = layer(&hub);
    let callee = layer(&hub);
    let ctx = NetworkContext::new();

    let root = RootIdentity {
        id: "user-1".into(),
        keypair: Keypair::generate(),
    };
    let identity = root.identity();

    let granted = create_permission(
        &PermissionInput {
            device_id: vec![Matcher::Any],
            user_id: vec![Matcher::exact("user-1")],
            resource_id: vec![Matcher::exact("notes"), Matcher::AnyRemainingSlots],
            action_id: vec![Matcher::exact("read")],
            expires_at: None,
            allow: true,
        },
        AuthorityKind::UserRoot,
        &root,
    )
    .expect("create permission");

    let server = {
        let callee = callee.clone();
        let ctx = ctx.clone();
        let cache = Arc::new(PermissionCache::new(Arc::new(MemoryStore::new())));
        tokio::spawn(async move {
            let read = RpcDefinition::<ReadNoteIn, ReadNoteOut>::new("notes.read");
            let mut served = 0;
            while served < 2 {
                let cache = cache.clone();
                let identity = identity.clone();
                let result = read
                    .single_exec(&callee, &ctx, |request, responder| async move {
                        let action = Action {
                            device_id: request.peer.to_string(),
                            user_id: "user-1".into(),
                            resource_id: vec!["notes".into(), request.input.note_id.clone()],
                            action_id: vec!["read".into()],
                        };
                        let verdict = cache
                            .verify_permissions(&request.input.permission, &action, &identity)
                            .await
                            .map_err(|err| weft_core::RpcError::Handler(err.to_string()))?;
                        let out = if verdict.allowed() {
                            ReadNoteOut::Content(format!("note {}", request.input.note_id))
                        } else {
                            ReadNoteOut::Denied
                        };
                        responder.send(&out).await
                    })
                    .await;
                result.expect("handler ok");
                served += 1;
            }
        })
    };

    let read = RpcDefinition::<ReadNoteIn, ReadNoteOut>::new("notes.read");

    // Valid permission: read succeeds.
    let mut stream = read
        .call(
            &caller,
            callee.device_id(),
            &ReadNoteIn {
                note_id: "abc".into(),
                permission: granted.clone(),
            },
            &ctx,
        )
        .await
        .expect("call");
    let chunk = stream.next(&ctx).await.expect("not cancelled").expect("chunk");
    assert_eq!(
        chunk.payload.expect("valid payload"),
        ReadNoteOut::Content("note abc".into())
    );
    assert!(stream.next(&ctx).await.expect("not cancelled").is_none());

    // Tampered permission: certificate fails, read denied.
    let mut forged = granted.clone();
    forged.resource_id = vec![Matcher::AnyRemainingSlots];
    let mut stream = read
        .call(
            &caller,
            callee.device_id(),
            &ReadNoteIn {
                note_id: "abc".into(),
                permission: forged,
            },
            &ctx,
        )
        .await
        .expect("call");
    let chunk = stream.next(&ctx).await.expect("not cancelled").expect("chunk");
    assert_eq!(chunk.payload.expect("valid payload"), ReadNoteOut::Denied);
    assert!(stream.next(&ctx).await.expect("not cancelled").is_none());

    server.await.expect("join");
}

#[tokio::test]
async fn raw_listener_port_convention() {
    let hub = LoopbackHub::new();
    let sender = layer(&hub);
    let receiver = layer(&hub);
    let ctx = NetworkContext::new();

    let port = weft_core::listener_port("commands");
    let outcome = sender
        .send(
            weft_core::OutboundDatagram {
                receiver: receiver.device_id(),
                port: port.clone(),
                request_id: "tag-1".into(),
                close_request_id: None,
                data: Some(serde_json::json!({ "op": "ping" })),
            },
            &ctx,
        )
        .await;
    assert!(outcome.success);

    let got = receiver.receive(&port, &ctx).await.expect("not cancelled");
    assert_eq!(got.sender, sender.device_id());
    assert_eq!(got.data, Some(serde_json::json!({ "op": "ping" })));
}
