//! Streaming RPC on top of the network layer: request correlation by
//! request id, response streams on `rpc:{requestId}` ports, and a serve loop
//! that restarts failed handlers.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::channel::Cancelled;
use crate::datagram::{rpc_response_port, OutboundDatagram};
use crate::identity::DeviceId;
use crate::network::{NetworkContext, NetworkLayer};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("no driver accepted the datagram")]
    SendFailed,
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("handler failed: {0}")]
    Handler(String),
}

/// A response chunk that arrived but did not decode as the expected type.
/// Surfaced to the caller as data, not raised; the stream keeps going.
#[derive(Debug, thiserror::Error)]
#[error("invalid rpc payload: {reason}")]
pub struct ValidationError {
    pub reason: String,
    pub raw: Option<Value>,
}

/// One element of an RPC response stream.
#[derive(Debug)]
pub struct RpcChunk<Out> {
    pub sender: DeviceId,
    pub payload: Result<Out, ValidationError>,
}

/// A decoded request, handed to the handler.
#[derive(Debug)]
pub struct RpcRequest<In> {
    pub peer: DeviceId,
    pub request_id: String,
    pub input: In,
}

/// A named RPC with typed input and output. The name doubles as the request
/// port; both sides construct the same definition.
pub struct RpcDefinition<In, Out> {
    name: String,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> RpcDefinition<In, Out>
where
    In: Serialize + DeserializeOwned,
    Out: Serialize + DeserializeOwned,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a request to `receiver` and return the response stream. The
    /// request id is a fresh UUID; responses arrive on `rpc:{requestId}`.
    pub async fn call<'n>(
        &self,
        net: &'n NetworkLayer,
        receiver: DeviceId,
        input: &In,
        ctx: &NetworkContext,
    ) -> Result<RpcCallStream<'n, Out>, RpcError> {
        let request_id = Uuid::new_v4().to_string();
        let data = serde_json::to_value(input)?;
        let outcome = net
            .send(
                OutboundDatagram {
                    receiver,
                    port: self.name.clone(),
                    request_id: request_id.clone(),
                    close_request_id: None,
                    data: Some(data),
                },
                ctx,
            )
            .await;
        if !outcome.success {
            return Err(RpcError::SendFailed);
        }
        Ok(RpcCallStream {
            net,
            port: rpc_response_port(&request_id),
            request_id,
            done: false,
            _marker: PhantomData,
        })
    }

    /// Receive and process exactly one request. A missing request id or an
    /// input that fails to decode is logged and dropped with no response;
    /// the caller owns its own timeout. The close sentinel is sent only
    /// after the handler returns `Ok`.
    pub async fn single_exec<'n, F, Fut>(
        &self,
        net: &'n NetworkLayer,
        ctx: &NetworkContext,
        handler: F,
    ) -> Result<(), RpcError>
    where
        F: FnOnce(RpcRequest<In>, RpcResponder<'n, Out>) -> Fut,
        Fut: Future<Output = Result<(), RpcError>>,
    {
        let datagram = net.receive(&self.name, ctx).await?;
        if datagram.request_id.is_empty() {
            tracing::error!(rpc = %self.name, sender = %datagram.sender,
                "request without request id, dropping");
            return Ok(());
        }
        let raw = datagram.data.clone().unwrap_or(Value::Null);
        let input: In = match serde_json::from_value(raw) {
            Ok(input) => input,
            Err(err) => {
                tracing::error!(rpc = %self.name, sender = %datagram.sender, error = %err,
                    "invalid rpc input, dropping request");
                return Ok(());
            }
        };

        let peer = datagram.sender;
        let request_id = datagram.request_id;
        let responder = RpcResponder {
            net,
            receiver: peer,
            port: rpc_response_port(&request_id),
            request_id: request_id.clone(),
            ctx: ctx.clone(),
            _marker: PhantomData,
        };
        handler(
            RpcRequest {
                peer,
                request_id: request_id.clone(),
                input,
            },
            responder,
        )
        .await?;

        // Terminate the caller's stream.
        let outcome = net
            .send(
                OutboundDatagram {
                    receiver: peer,
                    port: rpc_response_port(&request_id),
                    request_id,
                    close_request_id: Some(true),
                    data: None,
                },
                ctx,
            )
            .await;
        if !outcome.success {
            return Err(RpcError::SendFailed);
        }
        Ok(())
    }

    /// Handle requests one at a time until the context is cancelled. Handler
    /// failures are logged and the loop restarts with capped exponential
    /// backoff; requests are never processed concurrently.
    pub async fn serve<'n, F, Fut>(&self, net: &'n NetworkLayer, ctx: &NetworkContext, mut handler: F)
    where
        F: FnMut(RpcRequest<In>, RpcResponder<'n, Out>) -> Fut,
        Fut: Future<Output = Result<(), RpcError>>,
    {
        const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
        const MAX_BACKOFF: Duration = Duration::from_secs(5);

        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.single_exec(net, ctx, &mut handler).await {
                Ok(()) => backoff = INITIAL_BACKOFF,
                Err(RpcError::Cancelled(_)) => return,
                Err(err) => {
                    tracing::error!(rpc = %self.name, error = %err, "rpc handler failed, restarting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
            if ctx.is_cancelled() {
                return;
            }
        }
    }
}

/// Lazily consumed RPC response stream. Each `next` suspends until the peer
/// yields another value or closes the request id.
pub struct RpcCallStream<'n, Out> {
    net: &'n NetworkLayer,
    port: String,
    request_id: String,
    done: bool,
    _marker: PhantomData<fn() -> Out>,
}

impl<Out: DeserializeOwned> RpcCallStream<'_, Out> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next chunk, or `None` once the close sentinel arrives. A chunk that
    /// fails to decode is yielded as `Err(ValidationError)` inside the chunk.
    pub async fn next(&mut self, ctx: &NetworkContext) -> Result<Option<RpcChunk<Out>>, Cancelled> {
        if self.done {
            return Ok(None);
        }
        let datagram = self.net.receive(&self.port, ctx).await?;
        if datagram.is_close() {
            self.done = true;
            return Ok(None);
        }
        let raw = datagram.data;
        let payload = serde_json::from_value::<Out>(raw.clone().unwrap_or(Value::Null)).map_err(
            |err| ValidationError {
                reason: err.to_string(),
                raw,
            },
        );
        Ok(Some(RpcChunk {
            sender: datagram.sender,
            payload,
        }))
    }
}

/// Callee-side handle for yielding response values to the caller.
pub struct RpcResponder<'n, Out> {
    net: &'n NetworkLayer,
    receiver: DeviceId,
    port: String,
    request_id: String,
    ctx: NetworkContext,
    _marker: PhantomData<fn(&Out)>,
}

impl<Out: Serialize> RpcResponder<'_, Out> {
    pub fn peer(&self) -> DeviceId {
        self.receiver
    }

    /// Yield one value into the caller's response stream.
    pub async fn send(&self, value: &Out) -> Result<(), RpcError> {
        let data = serde_json::to_value(value)?;
        let outcome = self
            .net
            .send(
                OutboundDatagram {
                    receiver: self.receiver,
                    port: self.port.clone(),
                    request_id: self.request_id.clone(),
                    close_request_id: None,
                    data: Some(data),
                },
                &self.ctx,
            )
            .await;
        if !outcome.success {
            return Err(RpcError::SendFailed);
        }
        Ok(())
    }
}
