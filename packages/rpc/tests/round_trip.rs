//! End-to-end tests over a real loopback socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prism_capabilities::{OpContext, PrismError, Result};
use prism_rpc::{RpcClient, RpcServer, RpcService};
use tokio::sync::mpsc;

struct EchoService;

#[async_trait]
impl RpcService for EchoService {
    async fn handle(
        &self,
        _ctx: &OpContext,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        match method {
            "Echo" => Ok(params),
            "Missing" => Err(PrismError::not_found("no such thing")),
            "Slow" => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(serde_json::Value::Null)
            }
            other => Err(PrismError::validation(format!("unknown method: {other}"))),
        }
    }

    fn is_stream(&self, method: &str) -> bool {
        method == "Count"
    }

    async fn handle_stream(
        &self,
        _ctx: &OpContext,
        _method: &str,
        params: serde_json::Value,
    ) -> Result<mpsc::Receiver<serde_json::Value>> {
        let n = params["n"].as_u64().unwrap_or(0);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for i in 0..n {
                if tx.send(serde_json::json!(i)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

async fn start() -> RpcClient {
    let server = RpcServer::bind("127.0.0.1:0", Arc::new(EchoService))
        .await
        .unwrap();
    let (addr, _shutdown) = server.spawn().unwrap();
    RpcClient::connect(&addr.to_string()).await.unwrap()
}

#[tokio::test]
async fn echo_round_trip() {
    let client = start().await;
    let out: serde_json::Value = client
        .call("Echo", &serde_json::json!({"x": 7}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(out["x"], 7);
}

#[tokio::test]
async fn error_class_preserved() {
    let client = start().await;
    let err = client
        .call_value("Missing", serde_json::Value::Null, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn slow_handler_times_out() {
    let client = start().await;
    let err = client
        .call_value("Slow", serde_json::Value::Null, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn stream_delivers_items_then_done() {
    let client = start().await;
    let mut stream = client
        .subscribe("Count", &serde_json::json!({"n": 3}))
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(item) = stream.next().await.unwrap() {
        seen.push(item.as_u64().unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2]);
}

#[tokio::test]
async fn concurrent_calls_multiplex_one_connection() {
    let client = start().await;
    let mut handles = Vec::new();
    for i in 0..16u64 {
        let c = client.clone();
        handles.push(tokio::spawn(async move {
            let out: serde_json::Value = c
                .call("Echo", &serde_json::json!({"i": i}), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(out["i"], i);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}
