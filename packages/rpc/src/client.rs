//! RPC client: correlation ids, per-call deadlines, push streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prism_capabilities::{PrismError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::wire::{Request, Response};

enum Pending {
    Unary(oneshot::Sender<Response>),
    Stream(mpsc::Sender<Response>),
}

struct ClientInner {
    out_tx: mpsc::Sender<Request>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

/// Client half of a JSON-lines RPC connection. Cheap to clone; all clones
/// share the connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PrismError::transient(format!("dial {addr}: {e}")))?;
        Ok(Self::from_stream(stream))
    }

    /// Connect with a bounded dial timeout
    pub async fn connect_timeout(addr: &str, timeout: Duration) -> Result<Self> {
        tokio::time::timeout(timeout, Self::connect(addr))
            .await
            .map_err(|_| PrismError::timeout(format!("dial {addr}")))?
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Request>(64);

        let inner = Arc::new(ClientInner {
            out_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: std::sync::atomic::AtomicBool::new(false),
        });

        // Writer task
        tokio::spawn(async move {
            while let Some(request) = out_rx.recv().await {
                let mut line = match serde_json::to_vec(&request) {
                    Ok(line) => line,
                    Err(_) => continue,
                };
                line.push(b'\n');
                if write_half.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: dispatch frames to pending calls by id
        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let frame: Response = match serde_json::from_str(&line) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!("rpc client frame parse failed: {e}");
                        continue;
                    }
                };
                let id = frame.id;
                let stream_done = frame.done || frame.err.is_some();
                let is_stream_frame = frame.item.is_some() || frame.done;

                let entry = {
                    let mut pending = reader_inner.pending.lock();
                    match pending.remove(&id) {
                        Some(Pending::Stream(tx)) if is_stream_frame && !stream_done => {
                            // Keep the stream registered for further frames.
                            pending.insert(id, Pending::Stream(tx.clone()));
                            Some(Pending::Stream(tx))
                        }
                        other => other,
                    }
                };

                match entry {
                    Some(Pending::Unary(tx)) => {
                        let _ = tx.send(frame);
                    }
                    Some(Pending::Stream(tx)) => {
                        let _ = tx.send(frame).await;
                    }
                    None => debug!("rpc client frame for unknown id {id}"),
                }
            }
            // Connection gone: fail everything outstanding.
            reader_inner
                .closed
                .store(true, std::sync::atomic::Ordering::SeqCst);
            reader_inner.pending.lock().clear();
        });

        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(std::sync::atomic::Ordering::SeqCst)
            || self.inner.out_tx.is_closed()
    }

    /// Unary call with typed params and result
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R> {
        let value = self
            .call_value(method, serde_json::to_value(params)?, timeout)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Unary call on raw JSON values
    pub async fn call_value(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, Pending::Unary(tx));

        let request = Request {
            id,
            method: method.to_string(),
            params,
            deadline_ms: Some(timeout.as_millis() as u64),
        };
        if self.inner.out_tx.send(request).await.is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(PrismError::transient("rpc connection closed"));
        }

        let frame = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(PrismError::transient("rpc connection closed")),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                return Err(PrismError::timeout(method));
            }
        };

        match (frame.ok, frame.err) {
            (Some(value), _) => Ok(value),
            (_, Some(err)) => Err(err.into()),
            _ => Err(PrismError::transient("malformed rpc response")),
        }
    }

    /// Open a server-push stream. Items arrive until the server sends a
    /// done frame, errors, or the connection drops.
    pub async fn subscribe<P: Serialize>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<RpcStream> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        self.inner.pending.lock().insert(id, Pending::Stream(tx));

        let request = Request {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
            deadline_ms: None,
        };
        if self.inner.out_tx.send(request).await.is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(PrismError::transient("rpc connection closed"));
        }

        Ok(RpcStream { receiver: rx })
    }
}

/// Receiving half of a push stream
pub struct RpcStream {
    receiver: mpsc::Receiver<Response>,
}

impl RpcStream {
    /// Next item; `Ok(None)` on clean end of stream
    pub async fn next(&mut self) -> Result<Option<serde_json::Value>> {
        match self.receiver.recv().await {
            Some(frame) => {
                if let Some(err) = frame.err {
                    return Err(err.into());
                }
                if frame.done {
                    return Ok(None);
                }
                Ok(frame.item)
            }
            None => Ok(None),
        }
    }

    /// Next item deserialized as `T`; `Ok(None)` on end of stream
    pub async fn next_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.next().await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
