use std::io::Write;

use rulecore::config::LocalLoaderConfig;
use rulecore::loader::{LocalLoader, LoaderError, RuleLoader};

fn config(root: &std::path::Path) -> LocalLoaderConfig {
    LocalLoaderConfig {
        root: root.to_string_lossy().to_string(),
        recursive: true,
        extension: ".json".to_string(),
        metadata_suffix: ".meta.json".to_string(),
        enable_hot_reload: false,
    }
}

#[tokio::test]
async fn recursive_scan_finds_nested_rules() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("nested")).unwrap();
    std::fs::File::create(dir.path().join("top.json"))
        .unwrap()
        .write_all(b"{}")
        .unwrap();
    std::fs::File::create(dir.path().join("nested/inner.json"))
        .unwrap()
        .write_all(b"{}")
        .unwrap();

    let loader = LocalLoader::new(config(dir.path()));
    let mut ids = loader.list_ids().await.unwrap();
    ids.sort();
    assert_eq!(ids, vec!["nested/inner".to_string(), "top".to_string()]);
}

#[tokio::test]
async fn path_traversal_is_rejected_even_when_the_target_exists() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::fs::File::create(outside.path().join("secret.json"))
        .unwrap()
        .write_all(b"{\"secret\":true}")
        .unwrap();

    let loader = LocalLoader::new(config(dir.path()));
    let err = loader.load("../secret").await.unwrap_err();
    assert!(matches!(err, rulecore::loader::LoaderError::PathTraversal(_)));
}

#[tokio::test]
async fn load_many_skips_missing_without_erroring() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::File::create(dir.path().join("present.json"))
        .unwrap()
        .write_all(b"{\"kind\":\"noop\"}")
        .unwrap();

    let loader = LocalLoader::new(config(dir.path()));
    let result = loader
        .load_many(&["present".to_string(), "absent".to_string()])
        .await
        .unwrap();

    assert_eq!(result.len(), 1);
    assert!(result.contains_key("present"));
}

#[tokio::test]
async fn invalid_sidecar_json_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::File::create(dir.path().join("broken.json"))
        .unwrap()
        .write_all(b"{\"a\":1}")
        .unwrap();
    std::fs::File::create(dir.path().join("broken.meta.json"))
        .unwrap()
        .write_all(b"not json")
        .unwrap();

    let loader = LocalLoader::new(config(dir.path()));
    let err = loader.load("broken").await.unwrap_err();
    assert!(matches!(err, LoaderError::InvalidMetadata { .. }));
}
