//! RPC server: accept loop, per-connection tasks, deadline enforcement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prism_capabilities::{OpContext, PrismError, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::wire::{Request, Response};
use crate::DEFAULT_DEADLINE_MS;

/// Service backing an RPC endpoint. One implementor per plane (launcher
/// control plane, pattern lifecycle plane, pattern data plane); the
/// implementor dispatches on the method name.
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Handle a unary request
    async fn handle(
        &self,
        ctx: &OpContext,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Is `method` a server-push stream?
    fn is_stream(&self, _method: &str) -> bool {
        false
    }

    /// Open a stream for a streaming method. Frames pulled from the
    /// receiver are forwarded to the client until it closes.
    async fn handle_stream(
        &self,
        _ctx: &OpContext,
        method: &str,
        _params: serde_json::Value,
    ) -> Result<mpsc::Receiver<serde_json::Value>> {
        Err(PrismError::not_found(format!("unknown stream method: {method}")))
    }
}

/// TCP server speaking the JSON-lines protocol
pub struct RpcServer {
    listener: TcpListener,
    service: Arc<dyn RpcService>,
}

impl RpcServer {
    /// Bind to `addr` (use port 0 for an ephemeral port)
    pub async fn bind(addr: &str, service: Arc<dyn RpcService>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("rpc server shutting down");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "rpc connection accepted");
                        let service = self.service.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, service, conn_shutdown).await {
                                debug!(%peer, "rpc connection closed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("rpc accept failed: {e}");
                    }
                },
            }
        }
    }

    /// Serve on a background task; returns the bound address and a shutdown
    /// token.
    pub fn spawn(self) -> Result<(std::net::SocketAddr, CancellationToken)> {
        let addr = self.local_addr()?;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { self.serve(token).await });
        Ok((addr, shutdown))
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<dyn RpcService>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // All handler tasks funnel frames through one writer task.
    let (out_tx, mut out_rx) = mpsc::channel::<Response>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let mut line = match serde_json::to_vec(&frame) {
                Ok(line) => line,
                Err(e) => {
                    error!("rpc response serialization failed: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            if write_half.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("rpc request parse failed: {e}");
                continue;
            }
        };

        let deadline = Duration::from_millis(request.deadline_ms.unwrap_or(DEFAULT_DEADLINE_MS));
        let ctx = OpContext::with_timeout(deadline);
        let service = service.clone();
        let out = out_tx.clone();

        if service.is_stream(&request.method) {
            tokio::spawn(async move {
                match service.handle_stream(&ctx, &request.method, request.params).await {
                    Ok(mut items) => {
                        while let Some(item) = items.recv().await {
                            if out.send(Response::item(request.id, item)).await.is_err() {
                                return;
                            }
                        }
                        let _ = out.send(Response::done(request.id)).await;
                    }
                    Err(e) => {
                        let _ = out.send(Response::err(request.id, &e)).await;
                    }
                }
            });
        } else {
            tokio::spawn(async move {
                let method = request.method;
                let result = ctx
                    .run(&method, service.handle(&ctx, &method, request.params))
                    .await;
                let frame = match result {
                    Ok(Ok(value)) => Response::ok(request.id, value),
                    Ok(Err(e)) => Response::err(request.id, &e),
                    Err(timeout) => Response::err(request.id, &timeout),
                };
                let _ = out.send(frame).await;
            });
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
