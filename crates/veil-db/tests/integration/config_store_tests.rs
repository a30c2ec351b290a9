use std::sync::Arc;

use serde_json::json;
use veil_core::config::DispatcherConfig;
use veil_core::dispatcher::{Dispatcher, JobOutcome};
use veil_core::error::ErrorKind;
use veil_core::models::ParserConfig;
use veil_core::parsers::register_builtin_parsers;
use veil_core::proxy::ProxyPool;
use veil_core::registry::ParserRegistry;
use veil_core::traits::ConfigStore;
use veil_db::NewProxy;

use crate::integration::common::setup_test_db;

fn dummy_config() -> ParserConfig {
    ParserConfig::new("w1", "s1", "dummy")
        .with_option("urls", json!(["https://example.com/a"]))
        .with_user_agents(["Agent-A", "Agent-B"])
        .with_cookie("session", "abc123")
}

#[tokio::test]
async fn upsert_and_load_config() {
    let (db, _container) = setup_test_db().await;
    let repo = db.config_repo();

    repo.upsert(&dummy_config()).await.unwrap();

    let loaded = repo
        .load_config("w1", "s1")
        .await
        .unwrap()
        .expect("Should find the config");
    assert_eq!(loaded, dummy_config());
}

#[tokio::test]
async fn missing_config_is_none() {
    let (db, _container) = setup_test_db().await;
    let repo = db.config_repo();

    assert!(repo.load_config("w1", "nope").await.unwrap().is_none());
}

#[tokio::test]
async fn upsert_replaces_existing_config() {
    let (db, _container) = setup_test_db().await;
    let repo = db.config_repo();

    repo.upsert(&dummy_config()).await.unwrap();
    repo.upsert(&dummy_config().with_render(true).with_option("urls", json!("https://b.test")))
        .await
        .unwrap();

    let loaded = repo.get("w1", "s1").await.unwrap().unwrap();
    assert!(loaded.use_render);
    assert_eq!(loaded.options["urls"], "https://b.test");
    assert_eq!(repo.list("w1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn paused_source_round_trips_and_is_skipped() {
    let (db, _container) = setup_test_db().await;
    let repo = db.config_repo();
    repo.upsert(&dummy_config()).await.unwrap();

    assert!(repo.set_active("w1", "s1", false).await.unwrap());
    assert!(!repo.set_active("w1", "nope", false).await.unwrap());
    let loaded = repo.get("w1", "s1").await.unwrap().unwrap();
    assert!(!loaded.is_active);
    assert_eq!(loaded, dummy_config().with_active(false));

    let mut registry = ParserRegistry::new();
    register_builtin_parsers(&mut registry).unwrap();
    let proxy_repo = db.proxy_repo();
    let dispatcher = Dispatcher::new(
        repo.clone(),
        registry.freeze(),
        ProxyPool::new(Arc::new(proxy_repo)),
        DispatcherConfig::default(),
    );

    // No proxies exist, so only a skip can succeed here.
    let outcome = dispatcher.run_job("w1", "s1").await;
    let JobOutcome::Succeeded { items, metadata } = outcome else {
        panic!("expected a skipped success, got {outcome:?}");
    };
    assert!(items.is_empty());
    assert_eq!(metadata["inactive"], true);

    repo.upsert(&dummy_config()).await.unwrap();
    assert!(repo.get("w1", "s1").await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn list_and_delete_configs() {
    let (db, _container) = setup_test_db().await;
    let repo = db.config_repo();

    for source in ["zeta", "alpha"] {
        repo.upsert(&ParserConfig::new("w1", source, "dummy")).await.unwrap();
    }
    repo.upsert(&ParserConfig::new("w2", "other", "dummy")).await.unwrap();

    let sources: Vec<_> = repo
        .list("w1")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.source_name)
        .collect();
    assert_eq!(sources, vec!["alpha", "zeta"]);

    assert!(repo.delete("w1", "alpha").await.unwrap());
    assert!(!repo.delete("w1", "alpha").await.unwrap());
    assert_eq!(repo.list("w1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn dispatcher_runs_against_postgres_stores() {
    let (db, _container) = setup_test_db().await;
    let configs = db.config_repo();
    let proxies = db.proxy_repo();

    configs.upsert(&dummy_config()).await.unwrap();
    proxies.add(&NewProxy::new("w1", "10.0.0.1", 1080)).await.unwrap();
    proxies.add(&NewProxy::new("w1", "10.0.0.2", 1080)).await.unwrap();

    let mut registry = ParserRegistry::new();
    register_builtin_parsers(&mut registry).unwrap();
    let pool = ProxyPool::new(Arc::new(proxies.clone()));
    let dispatcher = Dispatcher::new(
        configs,
        registry.freeze(),
        pool,
        DispatcherConfig::default(),
    );

    let outcome = dispatcher.run_job("w1", "s1").await;
    let JobOutcome::Succeeded { items, metadata } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(metadata["workspace"], "w1");
    assert_eq!(metadata["source"], "s1");
    assert_eq!(items[0]["proxy"], "socks5://10.0.0.1:1080");

    // Every proxy is back to available in the database.
    let stored = proxies.list("w1").await.unwrap();
    assert!(stored.iter().all(|p| p.health.as_str() == "available"));

    let missing = dispatcher.run_job("w1", "missing").await;
    assert_eq!(missing.error_kind(), Some(ErrorKind::ConfigNotFound));
}
