use std::time::Duration;

use rulecore::compression::CompressionAlgorithm;
use rulecore::config::{BatcherConfig, PoolConfig, RemoteLoaderConfig};
use rulecore::loader::{RemoteLoader, RuleLoader};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pool_config() -> PoolConfig {
    PoolConfig {
        max_connections: 4,
        max_requests_per_connection: 1000,
        keep_alive_timeout: Duration::from_secs(30),
        request_timeout: Duration::from_secs(5),
        queue_timeout: Duration::from_secs(2),
        max_retries: 1,
        retry_delay: Duration::from_millis(5),
        retry_on_timeout: false,
    }
}

fn batcher_config(enabled: bool) -> BatcherConfig {
    BatcherConfig {
        max_batch_size: 10,
        max_wait_time: Duration::from_millis(20),
        max_concurrent_batches: 2,
        enable_auto_batching: enabled,
    }
}

fn remote_config(base_url: &str, batching: bool) -> RemoteLoaderConfig {
    RemoteLoaderConfig {
        api_url: base_url.to_string(),
        api_key: "test-key".to_string(),
        project_id: "proj-1".to_string(),
        http_timeout: Duration::from_secs(5),
        enable_connection_pooling: true,
        enable_request_batching: batching,
        enable_compression: false,
        compression_algorithm: CompressionAlgorithm::Gzip,
    }
}

fn encode(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

#[tokio::test]
async fn fetches_single_rule_from_registry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/projects/proj-1/rules/pricing-v1"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "pricing-v1",
            "name": "pricing",
            "version": "1.0.0",
            "tags": ["pricing"],
            "lastModified": "2023-11-14T22:13:20Z",
            "content": encode(b"{\"kind\":\"noop\"}"),
        })))
        .mount(&server)
        .await;

    let loader = RemoteLoader::new(
        remote_config(&server.uri(), false),
        pool_config(),
        batcher_config(false),
    )
    .unwrap();

    let (bytes, metadata) = loader.load("pricing-v1").await.unwrap();
    assert_eq!(bytes, b"{\"kind\":\"noop\"}");
    assert_eq!(metadata.version, "1.0.0");
    assert!(metadata.tags.contains("pricing"));
}

#[tokio::test]
async fn missing_rule_surfaces_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/projects/proj-1/rules/ghost"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let loader = RemoteLoader::new(
        remote_config(&server.uri(), false),
        pool_config(),
        batcher_config(false),
    )
    .unwrap();

    let err = loader.load("ghost").await.unwrap_err();
    assert!(matches!(err, rulecore::loader::LoaderError::NotFound(_)));
}

#[tokio::test]
async fn list_ids_reads_registry_index() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/projects/proj-1/rules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rules": [
                {
                    "id": "a",
                    "version": "1.0.0",
                    "tags": [],
                    "lastModified": "2023-11-14T22:13:20Z",
                    "content": encode(b"{}"),
                },
                {
                    "id": "b",
                    "version": "1.0.0",
                    "tags": [],
                    "lastModified": "2023-11-14T22:13:20Z",
                    "content": encode(b"{}"),
                },
            ],
        })))
        .mount(&server)
        .await;

    let loader = RemoteLoader::new(
        remote_config(&server.uri(), false),
        pool_config(),
        batcher_config(false),
    )
    .unwrap();

    let mut ids = loader.list_ids().await.unwrap();
    ids.sort();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn batch_fetch_reports_one_rule_failing_without_failing_the_rest() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/projects/proj-1/rules/batch"))
        .and(body_json(serde_json::json!({"ruleIds": ["ok", "bad"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rules": [
                {
                    "id": "ok",
                    "version": "1.0.0",
                    "tags": [],
                    "lastModified": "2023-11-14T22:13:20Z",
                    "content": encode(b"{\"kind\":\"noop\"}"),
                },
            ],
            "errors": [
                {"ruleId": "bad", "error": "rule archived"},
            ],
        })))
        .mount(&server)
        .await;

    let loader = RemoteLoader::new(
        remote_config(&server.uri(), false),
        pool_config(),
        batcher_config(false),
    )
    .unwrap();

    let result = loader
        .load_many(&["ok".to_string(), "bad".to_string()])
        .await
        .unwrap();

    assert_eq!(result.len(), 1);
    assert!(result.contains_key("ok"));
}

#[tokio::test]
async fn check_versions_reports_needs_update_per_rule() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/projects/proj-1/rules/versions/check"))
        .and(body_json(serde_json::json!({
            "rules": [{"ruleId": "pricing-v1", "currentVersion": "1.0.0"}],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rules": [
                {
                    "ruleId": "pricing-v1",
                    "currentVersion": "1.0.0",
                    "latestVersion": "1.1.0",
                    "needsUpdate": true,
                },
            ],
        })))
        .mount(&server)
        .await;

    let loader = RemoteLoader::new(
        remote_config(&server.uri(), false),
        pool_config(),
        batcher_config(false),
    )
    .unwrap();

    let mut current = std::collections::HashMap::new();
    current.insert("pricing-v1".to_string(), "1.0.0".to_string());

    let result = loader.check_versions(&current).await.unwrap();
    assert_eq!(result.get("pricing-v1"), Some(&true));
}
