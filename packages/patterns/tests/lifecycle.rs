//! Lifecycle-law tests for the pattern runtime, driven over the real RPC
//! planes with the in-memory driver.

use std::sync::Arc;
use std::time::Duration;

use prism_patterns::runtime::lifecycle_methods;
use prism_patterns::{KeyValuePattern, LifecycleService, PatternConfig, PatternRuntime};
use prism_rpc::{RpcClient, RpcServer};
use prism_drivers::DriverSpec;

fn keyvalue_config() -> PatternConfig {
    let mut config = PatternConfig::new("keyvalue");
    config.keyvalue = Some(DriverSpec::new("memory"));
    config
}

fn runtime() -> Arc<PatternRuntime> {
    Arc::new(PatternRuntime::new(Arc::new(KeyValuePattern)))
}

#[tokio::test]
async fn initialize_is_idempotent_for_identical_config() {
    let runtime = runtime();
    runtime.initialize("keyvalue", keyvalue_config()).await.unwrap();
    runtime.initialize("keyvalue", keyvalue_config()).await.unwrap();

    let mut different = keyvalue_config();
    different.max_identities = 1;
    let err = runtime.initialize("keyvalue", different).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn wrong_pattern_name_is_a_validation_error() {
    let runtime = runtime();
    let err = runtime
        .initialize("consumer", keyvalue_config())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), prism_capabilities::ErrorKind::Validation);
}

#[tokio::test]
async fn start_before_initialize_is_a_conflict() {
    let runtime = runtime();
    assert!(runtime.start().await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn start_twice_returns_the_same_endpoint() {
    let runtime = runtime();
    runtime.initialize("keyvalue", keyvalue_config()).await.unwrap();
    let first = runtime.start().await.unwrap();
    let second = runtime.start().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn data_plane_serves_kv_round_trip() {
    let runtime = runtime();
    runtime.initialize("keyvalue", keyvalue_config()).await.unwrap();
    let addr = runtime.start().await.unwrap();
    let client = RpcClient::connect(&addr.to_string()).await.unwrap();
    let timeout = Duration::from_secs(5);

    client
        .call_value(
            "KeyValueBasic.Set",
            serde_json::json!({"key": "k", "value": [1, 2, 3]}),
            timeout,
        )
        .await
        .unwrap();
    let got = client
        .call_value("KeyValueBasic.Get", serde_json::json!({"key": "k"}), timeout)
        .await
        .unwrap();
    assert_eq!(got["found"], true);
    assert_eq!(got["value"], serde_json::json!([1, 2, 3]));

    client
        .call_value("KeyValueBasic.Delete", serde_json::json!({"key": "k"}), timeout)
        .await
        .unwrap();
    let exists = client
        .call_value("KeyValueBasic.Exists", serde_json::json!({"key": "k"}), timeout)
        .await
        .unwrap();
    assert_eq!(exists["exists"], false);
    let got = client
        .call_value("KeyValueBasic.Get", serde_json::json!({"key": "k"}), timeout)
        .await
        .unwrap();
    assert_eq!(got["found"], false);
}

#[tokio::test]
async fn drain_then_stop_is_always_safe() {
    let runtime = runtime();
    runtime.initialize("keyvalue", keyvalue_config()).await.unwrap();
    runtime.start().await.unwrap();

    let summary = runtime.drain(Duration::from_secs(1), "test").await.unwrap();
    assert_eq!(summary.aborted_operations, 0);

    runtime.stop().await.unwrap();
    // Stop after Stop is a no-op.
    runtime.stop().await.unwrap();

    // After Stop, health reports down and re-initialization is refused.
    let health = runtime.health_check().await;
    assert_eq!(health.status, prism_capabilities::HealthStatus::Unhealthy);
    assert!(runtime
        .initialize("keyvalue", keyvalue_config())
        .await
        .unwrap_err()
        .is_conflict());
}

#[tokio::test]
async fn lifecycle_rpc_surface_round_trips() {
    let runtime = runtime();
    let service = Arc::new(LifecycleService::new(runtime));
    let server = RpcServer::bind("127.0.0.1:0", service).await.unwrap();
    let (addr, _shutdown) = server.spawn().unwrap();
    let client = RpcClient::connect(&addr.to_string()).await.unwrap();
    let timeout = Duration::from_secs(5);

    let reply = client
        .call_value(
            lifecycle_methods::INITIALIZE,
            serde_json::json!({
                "name": "keyvalue",
                "version": "0.1.0",
                "config": keyvalue_config(),
            }),
            timeout,
        )
        .await
        .unwrap();
    assert_eq!(reply["success"], true);

    let started = client
        .call_value(lifecycle_methods::START, serde_json::Value::Null, timeout)
        .await
        .unwrap();
    let endpoint = started["data_endpoint"].as_str().unwrap().to_string();
    assert!(!endpoint.is_empty());

    let interfaces = client
        .call_value(lifecycle_methods::GET_INTERFACES, serde_json::Value::Null, timeout)
        .await
        .unwrap();
    let names: Vec<&str> = interfaces
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"KeyValueBasicInterface"));

    let health = client
        .call_value(lifecycle_methods::HEALTH_CHECK, serde_json::Value::Null, timeout)
        .await
        .unwrap();
    assert_eq!(health["status"], "Healthy");

    client
        .call_value(
            lifecycle_methods::DRAIN,
            serde_json::json!({"timeout_secs": 1, "reason": "shutdown"}),
            timeout,
        )
        .await
        .unwrap();
    client
        .call_value(lifecycle_methods::STOP, serde_json::Value::Null, timeout)
        .await
        .unwrap();
}
