//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::context::RunContext;
use crate::dispatcher::{DispatchEvent, DispatchReporter};
use crate::error::AppError;
use crate::models::{
    JsonObject, ParserConfig, ParserRunResult, ProxyClaim, ProxyHealth, ProxyRecord,
    ProxySettlement,
};
use crate::parser::Parser;
use crate::render::{PageRequest, RenderProvider, RenderedPage, StaticRenderProvider};
use crate::traits::{ConfigStore, ProxyStore};

/// `n` available proxies for `workspace` with ids `1..=n` on `127.0.0.1:9001..`.
pub fn make_proxies(workspace: &str, n: i64) -> Vec<ProxyRecord> {
    (1..=n)
        .map(|id| ProxyRecord::new(id, workspace, "127.0.0.1", 9000 + id as u16))
        .collect()
}

// ---------------------------------------------------------------------------
// MockConfigStore
// ---------------------------------------------------------------------------

/// In-memory config store keyed by (workspace, source).
#[derive(Clone, Default)]
pub struct MockConfigStore {
    configs: Arc<Mutex<HashMap<(String, String), ParserConfig>>>,
    error: Arc<Mutex<Option<String>>>,
}

impl MockConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configs(configs: Vec<ParserConfig>) -> Self {
        let store = Self::new();
        for config in configs {
            store.insert(config);
        }
        store
    }

    pub fn insert(&self, config: ParserConfig) {
        self.configs.lock().unwrap().insert(
            (config.workspace_id.clone(), config.source_name.clone()),
            config,
        );
    }

    pub fn remove(&self, workspace: &str, source: &str) {
        self.configs
            .lock()
            .unwrap()
            .remove(&(workspace.to_string(), source.to_string()));
    }

    /// Make every subsequent load fail with a database error.
    pub fn fail_loads(&self, message: &str) {
        *self.error.lock().unwrap() = Some(message.to_string());
    }
}

impl ConfigStore for MockConfigStore {
    async fn load_config(
        &self,
        workspace: &str,
        source: &str,
    ) -> Result<Option<ParserConfig>, AppError> {
        if let Some(message) = self.error.lock().unwrap().clone() {
            return Err(AppError::DatabaseError(message));
        }
        Ok(self
            .configs
            .lock()
            .unwrap()
            .get(&(workspace.to_string(), source.to_string()))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// MockProxyStore
// ---------------------------------------------------------------------------

/// In-memory proxy store with the same claim and settle rules as the
/// database: one lock per operation, settles conditional on the lease.
#[derive(Clone, Default)]
pub struct MockProxyStore {
    proxies: Arc<Mutex<Vec<ProxyRecord>>>,
    history: Arc<Mutex<Vec<(i64, ProxyHealth)>>>,
    settle_error: Arc<Mutex<Option<String>>>,
    claim_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockProxyStore {
    pub fn with_proxies(proxies: Vec<ProxyRecord>) -> Self {
        Self {
            proxies: Arc::new(Mutex::new(proxies)),
            ..Self::default()
        }
    }

    /// Make every subsequent `settle` fail with a database error.
    pub fn fail_settles(&self, message: &str) {
        *self.settle_error.lock().unwrap() = Some(message.to_string());
    }

    /// Delay every claim's reply by `delay` after it has been committed,
    /// like a slow round trip to the database.
    pub fn set_claim_delay(&self, delay: Option<Duration>) {
        *self.claim_delay.lock().unwrap() = delay;
    }

    /// `(id, health)` of every committed transition, oldest first.
    pub fn transitions(&self) -> Vec<(i64, ProxyHealth)> {
        self.history.lock().unwrap().clone()
    }

    /// Current stored state of a record.
    pub fn stored(&self, id: i64) -> Option<ProxyRecord> {
        self.proxies
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }
}

#[async_trait]
impl ProxyStore for MockProxyStore {
    async fn load_proxies(&self, workspace: &str) -> Result<Vec<ProxyRecord>, AppError> {
        let mut records: Vec<_> = self
            .proxies
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.workspace_id == workspace && r.is_active)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn claim(&self, claim: &ProxyClaim) -> Result<Option<ProxyRecord>, AppError> {
        let claimed = {
            let now = Utc::now();
            let mut proxies = self.proxies.lock().unwrap();
            let next = proxies
                .iter_mut()
                .filter(|r| r.workspace_id == claim.workspace_id && r.is_claimable(now))
                .min_by_key(|r| (claim.after_id.is_some_and(|after| r.id <= after), r.id));
            next.map(|record| {
                record.health = ProxyHealth::InUse;
                record.failed_until = None;
                record.lease_id = Some(claim.lease_id);
                record.lease_until = Some(claim.lease_until);
                self.history.lock().unwrap().push((record.id, record.health));
                record.clone()
            })
        };

        let delay = *self.claim_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(claimed)
    }

    async fn settle(
        &self,
        lease_id: Uuid,
        settlement: ProxySettlement,
    ) -> Result<Option<ProxyRecord>, AppError> {
        if let Some(message) = self.settle_error.lock().unwrap().clone() {
            return Err(AppError::DatabaseError(message));
        }
        let mut proxies = self.proxies.lock().unwrap();
        let Some(record) = proxies
            .iter_mut()
            .find(|r| r.lease_id == Some(lease_id) && r.health == ProxyHealth::InUse)
        else {
            return Ok(None);
        };

        match settlement {
            ProxySettlement::Release => {
                record.health = ProxyHealth::Available;
                record.failed_until = None;
            }
            ProxySettlement::Fail { until } => {
                record.health = ProxyHealth::Failed;
                record.failed_until = Some(until);
            }
        }
        record.lease_id = None;
        record.lease_until = None;
        self.history.lock().unwrap().push((record.id, record.health));
        Ok(Some(record.clone()))
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Parser returning fixed items without touching the context.
#[derive(Clone)]
pub struct StaticParser {
    name: String,
    items: Vec<JsonObject>,
    required_option: Option<String>,
}

impl StaticParser {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Vec::new(),
            required_option: None,
        }
    }

    pub fn with_items(mut self, items: Vec<JsonObject>) -> Self {
        self.items = items;
        self
    }

    /// Declare an options schema requiring `key`.
    pub fn with_required_option(mut self, key: &str) -> Self {
        self.required_option = Some(key.to_string());
        self
    }
}

#[async_trait]
impl Parser for StaticParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn options_schema(&self) -> Option<serde_json::Value> {
        self.required_option
            .as_ref()
            .map(|key| json!({ "type": "object", "required": [key] }))
    }

    async fn parse(&self, _ctx: &mut RunContext) -> Result<ParserRunResult, AppError> {
        Ok(ParserRunResult::new(self.items.clone(), JsonObject::new()))
    }
}

type ErrorFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

/// Parser that acquires a proxy and then fails.
#[derive(Clone)]
pub struct FailingParser {
    name: String,
    error: ErrorFactory,
}

impl FailingParser {
    /// Fails with a generic parser error.
    pub fn named(name: &str) -> Self {
        Self::with_error(name, || AppError::ParserError("boom".into()))
    }

    pub fn with_error<F>(name: &str, error: F) -> Self
    where
        F: Fn() -> AppError + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            error: Arc::new(error),
        }
    }
}

#[async_trait]
impl Parser for FailingParser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn parse(&self, ctx: &mut RunContext) -> Result<ParserRunResult, AppError> {
        ctx.acquire_proxy().await?;
        Err((self.error)())
    }
}

/// Parser named `"slow"` that holds a proxy for `delay` before succeeding.
#[derive(Clone)]
pub struct SlowParser {
    delay: Duration,
}

impl SlowParser {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Parser for SlowParser {
    fn name(&self) -> &str {
        "slow"
    }

    async fn parse(&self, ctx: &mut RunContext) -> Result<ParserRunResult, AppError> {
        ctx.acquire_proxy().await?;
        tokio::time::sleep(self.delay).await;
        Ok(ParserRunResult::default())
    }
}

/// Parser that renders `options.url` (or `https://example.com`) and
/// returns its title.
#[derive(Clone)]
pub struct RenderingParser {
    name: String,
    hold: Option<Duration>,
}

impl RenderingParser {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hold: None,
        }
    }

    /// Keep the page open for `hold` after reading its title.
    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }
}

#[async_trait]
impl Parser for RenderingParser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn parse(&self, ctx: &mut RunContext) -> Result<ParserRunResult, AppError> {
        let url = ctx
            .option_as::<String>("url")?
            .unwrap_or_else(|| "https://example.com".to_string());
        ctx.acquire_proxy().await?;

        let page = ctx.render_page(&url, None, None).await?;
        let title = page.title().await?;
        if let Some(hold) = self.hold {
            tokio::time::sleep(hold).await;
        }
        page.close().await?;

        let mut item = JsonObject::new();
        item.insert("title".into(), json!(title));
        Ok(ParserRunResult::new(vec![item], JsonObject::new()))
    }
}

// ---------------------------------------------------------------------------
// SlowRenderProvider
// ---------------------------------------------------------------------------

/// Render provider that takes `delay` to open each page.
#[derive(Clone)]
pub struct SlowRenderProvider {
    delay: Duration,
    inner: StaticRenderProvider,
}

impl SlowRenderProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: StaticRenderProvider::new(),
        }
    }
}

#[async_trait]
impl RenderProvider for SlowRenderProvider {
    fn name(&self) -> &str {
        "slow"
    }

    async fn new_page(&self, request: PageRequest) -> Result<Box<dyn RenderedPage>, AppError> {
        tokio::time::sleep(self.delay).await;
        self.inner.new_page(request).await
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records the name of every event it receives.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DispatchReporter for MockReporter {
    fn report(&self, event: DispatchEvent<'_>) {
        let name = match event {
            DispatchEvent::JobLoading { .. } => "JobLoading",
            DispatchEvent::JobSkipped { .. } => "JobSkipped",
            DispatchEvent::JobRunning { .. } => "JobRunning",
            DispatchEvent::JobSucceeded { .. } => "JobSucceeded",
            DispatchEvent::JobFailed { .. } => "JobFailed",
            DispatchEvent::ProxyCleanupFailed { .. } => "ProxyCleanupFailed",
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}
