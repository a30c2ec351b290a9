//! Per-job entry point: load configuration, run the registered parser,
//! settle the proxy, and normalize the outcome.
//!
//! # Job phases
//!
//! ```text
//! LOADING --[config + parser resolved]--> RUNNING --[parse ok]--> SUCCEEDED
//!    |  |                                    |
//!    |  +--[source inactive]-----------------|-----------------------> SUCCEEDED (no items)
//!    +------------[error]------------------> +--[error/timeout/cancel]--> FAILED
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::context::RunContext;
use crate::error::{AppError, ErrorKind};
use crate::models::{JsonObject, ParserConfig};
use crate::parser::Parser;
use crate::proxy::ProxyPool;
use crate::registry::ParserRegistry;
use crate::render::{RenderProvider, render_provider};
use crate::traits::ConfigStore;

/// Phase of a single job invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Loading,
    Running,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Loading => "loading",
            JobPhase::Running => "running",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loading" => Ok(JobPhase::Loading),
            "running" => Ok(JobPhase::Running),
            "succeeded" => Ok(JobPhase::Succeeded),
            "failed" => Ok(JobPhase::Failed),
            _ => Err(format!("Unknown job phase: {}", s)),
        }
    }
}

/// Structured result of `run_job`. Never a raw error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        items: Vec<JsonObject>,
        metadata: JsonObject,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl JobOutcome {
    pub fn failed(error: &AppError) -> Self {
        JobOutcome::Failed {
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }

    pub fn phase(&self) -> JobPhase {
        match self {
            JobOutcome::Succeeded { .. } => JobPhase::Succeeded,
            JobOutcome::Failed { .. } => JobPhase::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            JobOutcome::Failed { kind, .. } => Some(*kind),
            JobOutcome::Succeeded { .. } => None,
        }
    }
}

/// Events emitted by the dispatcher for monitoring and notifications.
#[derive(Debug, Clone)]
pub enum DispatchEvent<'a> {
    JobLoading {
        run_id: Uuid,
        workspace: &'a str,
        source: &'a str,
    },
    JobSkipped {
        run_id: Uuid,
        workspace: &'a str,
        source: &'a str,
    },
    JobRunning {
        run_id: Uuid,
        parser: &'a str,
    },
    JobSucceeded {
        run_id: Uuid,
        workspace: &'a str,
        source: &'a str,
        items: usize,
    },
    JobFailed {
        run_id: Uuid,
        workspace: &'a str,
        source: &'a str,
        kind: ErrorKind,
        error: &'a str,
        retryable: bool,
    },
    ProxyCleanupFailed {
        run_id: Uuid,
        proxy_id: i64,
        error: &'a str,
    },
}

/// Trait for receiving dispatcher events (decoupled logging).
pub trait DispatchReporter: Send + Sync {
    fn report(&self, event: DispatchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatchReporter;

impl DispatchReporter for TracingDispatchReporter {
    fn report(&self, event: DispatchEvent<'_>) {
        match event {
            DispatchEvent::JobLoading {
                run_id,
                workspace,
                source,
            } => {
                tracing::debug!(%run_id, %workspace, %source, "Loading parser configuration");
            }
            DispatchEvent::JobSkipped {
                run_id,
                workspace,
                source,
            } => {
                tracing::info!(%run_id, %workspace, %source, "Source inactive; job skipped");
            }
            DispatchEvent::JobRunning { run_id, parser } => {
                tracing::info!(%run_id, %parser, "Running parser");
            }
            DispatchEvent::JobSucceeded {
                run_id,
                workspace,
                source,
                items,
            } => {
                tracing::info!(%run_id, %workspace, %source, %items, "Job succeeded");
            }
            DispatchEvent::JobFailed {
                run_id,
                workspace,
                source,
                kind,
                error,
                retryable,
            } => {
                tracing::warn!(%run_id, %workspace, %source, %kind, %error, %retryable, "Job failed");
            }
            DispatchEvent::ProxyCleanupFailed {
                run_id,
                proxy_id,
                error,
            } => {
                tracing::error!(%run_id, %proxy_id, %error, "Failed to settle proxy after job");
            }
        }
    }
}

/// Runs parser jobs for (workspace, source) pairs.
pub struct Dispatcher<C, R = TracingDispatchReporter>
where
    C: ConfigStore,
    R: DispatchReporter,
{
    configs: C,
    registry: Arc<ParserRegistry>,
    proxies: ProxyPool,
    renderer: Option<Arc<dyn RenderProvider>>,
    config: DispatcherConfig,
    reporter: R,
}

impl<C: ConfigStore> Dispatcher<C> {
    pub fn new(
        configs: C,
        registry: Arc<ParserRegistry>,
        proxies: ProxyPool,
        config: DispatcherConfig,
    ) -> Self {
        if proxies.lease() <= config.job_timeout {
            tracing::warn!(
                lease_secs = proxies.lease().as_secs(),
                job_timeout_secs = config.job_timeout.as_secs(),
                "Proxy lease does not outlive the job timeout; long jobs may lose their proxy"
            );
        }
        Self {
            configs,
            registry,
            proxies,
            renderer: None,
            config,
            reporter: TracingDispatchReporter,
        }
    }
}

impl<C, R> Dispatcher<C, R>
where
    C: ConfigStore,
    R: DispatchReporter,
{
    /// Use `provider` instead of the process-wide rendering provider.
    pub fn with_render_provider(mut self, provider: Arc<dyn RenderProvider>) -> Self {
        self.renderer = Some(provider);
        self
    }

    pub fn with_reporter<R2: DispatchReporter>(self, reporter: R2) -> Dispatcher<C, R2> {
        Dispatcher {
            configs: self.configs,
            registry: self.registry,
            proxies: self.proxies,
            renderer: self.renderer,
            config: self.config,
            reporter,
        }
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.registry
    }

    /// Run the configured parser for `(workspace, source)` once.
    pub async fn run_job(&self, workspace: &str, source: &str) -> JobOutcome {
        self.run_job_cancellable(workspace, source, CancellationToken::new())
            .await
    }

    /// Like [`run_job`](Self::run_job), aborting the parse when `cancel`
    /// fires. Cleanup runs the same way as for any other failure.
    pub async fn run_job_cancellable(
        &self,
        workspace: &str,
        source: &str,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("job", %run_id, %workspace, %source);
        self.dispatch(run_id, workspace, source, cancel)
            .instrument(span)
            .await
    }

    async fn dispatch(
        &self,
        run_id: Uuid,
        workspace: &str,
        source: &str,
        cancel: CancellationToken,
    ) -> JobOutcome {
        self.reporter.report(DispatchEvent::JobLoading {
            run_id,
            workspace,
            source,
        });

        let config = match self.load_config(workspace, source).await {
            Ok(config) => config,
            Err(e) => return self.fail(run_id, workspace, source, &e),
        };
        if !config.is_active {
            return self.skip(run_id, workspace, source);
        }
        let parser = match self.resolve_parser(&config) {
            Ok(parser) => parser,
            Err(e) => return self.fail(run_id, workspace, source, &e),
        };
        let config = Arc::new(config);

        self.reporter.report(DispatchEvent::JobRunning {
            run_id,
            parser: parser.name(),
        });

        let renderer = self.renderer.clone().or_else(render_provider);
        let mut ctx = RunContext::new(
            run_id,
            Arc::clone(&config),
            self.proxies.clone(),
            renderer,
            self.config.render_timeout,
            self.config.cooldown.clone(),
        );

        let job_timeout = self.config.job_timeout;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AppError::Cancelled),
            outcome = tokio::time::timeout(job_timeout, parser.parse(&mut ctx)) => {
                outcome.unwrap_or_else(|_| Err(AppError::Timeout(job_timeout.as_secs())))
            }
        };

        // The parse future is gone by now; whatever it left held is ours to settle.
        self.settle_proxy(run_id, &mut ctx, result.as_ref().err()).await;

        match result {
            Ok(run) => {
                let (items, mut metadata) = run.into_parts();
                metadata.insert("workspace".into(), Value::from(workspace));
                metadata.insert("source".into(), Value::from(source));
                metadata.insert("parser".into(), Value::from(config.parser_name.as_str()));
                metadata.insert("count".into(), Value::from(items.len()));

                self.reporter.report(DispatchEvent::JobSucceeded {
                    run_id,
                    workspace,
                    source,
                    items: items.len(),
                });
                JobOutcome::Succeeded { items, metadata }
            }
            Err(e) => self.fail(run_id, workspace, source, &e),
        }
    }

    async fn load_config(&self, workspace: &str, source: &str) -> Result<ParserConfig, AppError> {
        self.configs
            .load_config(workspace, source)
            .await?
            .ok_or_else(|| AppError::ConfigNotFound {
                workspace: workspace.to_string(),
                source_name: source.to_string(),
            })
    }

    /// Parser lookup and option validation.
    fn resolve_parser(&self, config: &ParserConfig) -> Result<Box<dyn Parser>, AppError> {
        let parser = self.registry.resolve(&config.parser_name)?;
        if let Some(schema) = parser.options_schema() {
            validate_options(&schema, &config.options)?;
        }
        Ok(parser)
    }

    /// Outcome for a deactivated source: no parser, no proxy, no items.
    fn skip(&self, run_id: Uuid, workspace: &str, source: &str) -> JobOutcome {
        self.reporter.report(DispatchEvent::JobSkipped {
            run_id,
            workspace,
            source,
        });
        let mut metadata = JsonObject::new();
        metadata.insert("workspace".into(), Value::from(workspace));
        metadata.insert("source".into(), Value::from(source));
        metadata.insert("inactive".into(), Value::Bool(true));
        metadata.insert("count".into(), Value::from(0));
        JobOutcome::Succeeded {
            items: Vec::new(),
            metadata,
        }
    }

    /// Release or fail the proxy still held by the run. Never masks the
    /// job's own error; settlement failures are only reported.
    async fn settle_proxy(&self, run_id: Uuid, ctx: &mut RunContext, error: Option<&AppError>) {
        let Some(record) = ctx.take_proxy() else {
            return;
        };

        let settled = match error {
            Some(e) if e.is_proxy_attributable() => {
                let cooldown = self.config.cooldown.for_error(e);
                self.proxies.mark_failed(&record, cooldown).await
            }
            _ => self.proxies.release(&record).await,
        };

        if let Err(cleanup) = settled {
            let message = cleanup.to_string();
            self.reporter.report(DispatchEvent::ProxyCleanupFailed {
                run_id,
                proxy_id: record.id,
                error: &message,
            });
        }
    }

    fn fail(&self, run_id: Uuid, workspace: &str, source: &str, error: &AppError) -> JobOutcome {
        let message = error.to_string();
        self.reporter.report(DispatchEvent::JobFailed {
            run_id,
            workspace,
            source,
            kind: error.kind(),
            error: &message,
            retryable: error.is_retryable(),
        });
        JobOutcome::failed(error)
    }
}

/// Check `options` against a parser's JSON Schema.
fn validate_options(schema: &Value, options: &JsonObject) -> Result<(), AppError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| AppError::ValidationError(format!("Invalid options schema: {e}")))?;

    let instance = Value::Object(options.clone());
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::ValidationError(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::ProxyHealth;
    use crate::parsers::register_builtin_parsers;
    use crate::proxy::CooldownPolicy;
    use crate::render::StaticRenderProvider;
    use crate::testutil::*;

    struct Harness {
        dispatcher: Dispatcher<MockConfigStore, MockReporter>,
        proxies: ProxyPool,
        store: MockProxyStore,
        reporter_events: Arc<std::sync::Mutex<Vec<String>>>,
    }

    fn harness(configs: Vec<ParserConfig>, config: DispatcherConfig) -> Harness {
        let mut registry = ParserRegistry::new();
        register_builtin_parsers(&mut registry).unwrap();
        registry
            .register("failing", || Box::new(FailingParser::named("failing")))
            .unwrap();
        registry
            .register("network_failing", || {
                Box::new(FailingParser::with_error("network_failing", || {
                    AppError::NetworkError("connection reset".into())
                }))
            })
            .unwrap();
        registry
            .register("slow", || Box::new(SlowParser::new(Duration::from_secs(10))))
            .unwrap();
        registry
            .register("schema", || {
                Box::new(StaticParser::named("schema").with_required_option("urls"))
            })
            .unwrap();
        registry
            .register("renderer", || Box::new(RenderingParser::named("renderer")))
            .unwrap();
        registry
            .register("lingering_renderer", || {
                Box::new(
                    RenderingParser::named("lingering_renderer").with_hold(Duration::from_secs(10)),
                )
            })
            .unwrap();

        let store = MockProxyStore::with_proxies(make_proxies("w1", 2));
        let proxies = ProxyPool::new(Arc::new(store.clone()));
        let reporter = MockReporter::new();
        let reporter_events = Arc::clone(&reporter.events);

        let dispatcher = Dispatcher::new(
            MockConfigStore::with_configs(configs),
            registry.freeze(),
            proxies.clone(),
            config,
        )
        .with_reporter(reporter);

        Harness {
            dispatcher,
            proxies,
            store,
            reporter_events,
        }
    }

    fn dummy_config() -> ParserConfig {
        ParserConfig::new("w1", "s1", "dummy")
            .with_option(
                "urls",
                serde_json::json!(["https://example.com/alpha", "https://example.com/bravo"]),
            )
            .with_user_agents(["Agent-A", "Agent-B"])
            .with_cookie("session", "abc123")
    }

    async fn assert_no_proxy_in_use(proxies: &ProxyPool) {
        assert!(
            proxies
                .snapshot("w1")
                .await
                .unwrap()
                .iter()
                .all(|r| r.health != ProxyHealth::InUse)
        );
    }

    #[tokio::test]
    async fn dummy_job_succeeds_with_workspace_and_source_metadata() {
        let h = harness(vec![dummy_config()], DispatcherConfig::default());

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        let JobOutcome::Succeeded { items, metadata } = outcome else {
            panic!("expected success, got {outcome:?}");
        };

        assert_eq!(metadata["workspace"], "w1");
        assert_eq!(metadata["source"], "s1");
        assert_eq!(metadata["parser"], "dummy");
        assert_eq!(metadata["count"], 2);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["user_agent"], "Agent-A");
        assert_eq!(items[1]["user_agent"], "Agent-B");
        assert_eq!(items[0]["proxy"], "socks5://127.0.0.1:9001");
        assert_eq!(items[0]["cookie_header"], "session=abc123");
        assert!(items[0]["title"].is_null());

        assert_no_proxy_in_use(&h.proxies).await;
        assert_eq!(
            *h.reporter_events.lock().unwrap(),
            vec!["JobLoading", "JobRunning", "JobSucceeded"]
        );
    }

    #[tokio::test]
    async fn rendered_dummy_job_collects_titles() {
        let provider = StaticRenderProvider::new();
        let mut h = harness(vec![dummy_config().with_render(true)], DispatcherConfig::default());
        h.dispatcher = h.dispatcher.with_render_provider(Arc::new(provider.clone()));

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        let JobOutcome::Succeeded { items, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };

        assert_eq!(items[0]["title"], "title::https://example.com/alpha");
        assert_eq!(items[1]["title"], "title::https://example.com/bravo");

        let requests = provider.requests();
        assert_eq!(requests[0].identity, "Agent-A");
        assert_eq!(requests[0].cookies["session"], "abc123");
        assert_eq!(
            requests[0].proxy.as_ref().map(|p| p.server()),
            Some("socks5://127.0.0.1:9001".to_string())
        );
        assert_eq!(provider.closed().len(), 2);
    }

    #[tokio::test]
    async fn missing_config_fails_with_config_not_found() {
        let h = harness(vec![], DispatcherConfig::default());

        let outcome = h.dispatcher.run_job("w1", "nope").await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ConfigNotFound));
        assert!(matches!(outcome, JobOutcome::Failed { retryable: false, .. }));
    }

    #[tokio::test]
    async fn unregistered_parser_fails_with_parser_not_found() {
        let h = harness(
            vec![ParserConfig::new("w1", "s1", "ghost")],
            DispatcherConfig::default(),
        );

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ParserNotFound));
    }

    #[tokio::test]
    async fn parser_failure_releases_proxy() {
        let h = harness(
            vec![ParserConfig::new("w1", "s1", "failing")],
            DispatcherConfig::default(),
        );

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Parser));

        let snapshot = h.proxies.snapshot("w1").await.unwrap();
        assert!(snapshot.iter().all(|r| r.health == ProxyHealth::Available));
    }

    #[tokio::test]
    async fn network_failure_marks_proxy_failed() {
        let h = harness(
            vec![ParserConfig::new("w1", "s1", "network_failing")],
            DispatcherConfig::default(),
        );

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                kind: ErrorKind::Network,
                retryable: true,
                ..
            }
        ));

        let failed: Vec<_> = h
            .proxies
            .snapshot("w1")
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.health == ProxyHealth::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].failed_until.is_some());
    }

    #[tokio::test]
    async fn job_timeout_fails_and_cools_down_proxy() {
        let config = DispatcherConfig::default()
            .with_job_timeout(Duration::from_millis(50))
            .with_cooldown(CooldownPolicy::uniform(Duration::from_secs(60)));
        let h = harness(vec![ParserConfig::new("w1", "s1", "slow")], config);

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
        assert_no_proxy_in_use(&h.proxies).await;
        assert_eq!(
            h.proxies
                .snapshot("w1")
                .await
                .unwrap()
                .iter()
                .filter(|r| r.health == ProxyHealth::Failed)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn cancellation_runs_cleanup() {
        let h = harness(
            vec![ParserConfig::new("w1", "s1", "slow")],
            DispatcherConfig::default(),
        );
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcome = h.dispatcher.run_job_cancellable("w1", "s1", token).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
        assert!(
            h.proxies
                .snapshot("w1")
                .await
                .unwrap()
                .iter()
                .all(|r| r.health == ProxyHealth::Available)
        );
    }

    #[tokio::test]
    async fn exhausted_pool_is_retryable_failure() {
        let h = harness(vec![dummy_config()], DispatcherConfig::default());
        let _a = h.proxies.acquire("w1").await.unwrap();
        let _b = h.proxies.acquire("w1").await.unwrap();

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                kind: ErrorKind::PoolExhausted,
                retryable: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rendering_disabled_surfaces_as_fatal() {
        let h = harness(
            vec![ParserConfig::new("w1", "s1", "renderer")],
            DispatcherConfig::default(),
        );

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                kind: ErrorKind::RenderingDisabled,
                retryable: false,
                ..
            }
        ));
        assert_no_proxy_in_use(&h.proxies).await;
    }

    #[tokio::test]
    async fn options_failing_schema_are_rejected_before_parse() {
        let h = harness(
            vec![ParserConfig::new("w1", "s1", "schema")],
            DispatcherConfig::default(),
        );

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
        assert!(h.store.transitions().is_empty());
    }

    #[tokio::test]
    async fn cleanup_failure_does_not_mask_job_error() {
        let h = harness(
            vec![ParserConfig::new("w1", "s1", "failing")],
            DispatcherConfig::default(),
        );
        h.store.fail_settles("down");

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Parser));
        assert!(
            h.reporter_events
                .lock()
                .unwrap()
                .contains(&"ProxyCleanupFailed".to_string())
        );
    }

    #[tokio::test]
    async fn inactive_source_is_skipped_without_touching_proxies() {
        let h = harness(
            vec![ParserConfig::new("w1", "s1", "ghost").with_active(false)],
            DispatcherConfig::default(),
        );

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        let JobOutcome::Succeeded { items, metadata } = outcome else {
            panic!("expected a skipped success, got {outcome:?}");
        };
        assert!(items.is_empty());
        assert_eq!(metadata["inactive"], true);
        assert_eq!(metadata["workspace"], "w1");
        assert_eq!(metadata["source"], "s1");
        assert_eq!(metadata["count"], 0);

        assert!(h.store.transitions().is_empty());
        assert_eq!(
            *h.reporter_events.lock().unwrap(),
            vec!["JobLoading", "JobSkipped"]
        );
    }

    #[tokio::test]
    async fn timeout_during_proxy_claim_gives_the_proxy_back() {
        let config = DispatcherConfig::default().with_job_timeout(Duration::from_millis(50));
        let h = harness(vec![dummy_config()], config);
        h.store.set_claim_delay(Some(Duration::from_millis(300)));

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.store.transitions(),
            vec![(1, ProxyHealth::InUse), (1, ProxyHealth::Available)]
        );
        assert_no_proxy_in_use(&h.proxies).await;

        h.store.set_claim_delay(None);
        assert!(h.dispatcher.run_job("w1", "s1").await.is_success());
    }

    #[tokio::test]
    async fn job_timeout_closes_a_page_the_parser_still_holds() {
        let provider = StaticRenderProvider::new();
        let config = DispatcherConfig::default()
            .with_job_timeout(Duration::from_millis(50))
            .with_cooldown(CooldownPolicy::uniform(Duration::from_secs(60)));
        let mut h = harness(
            vec![
                ParserConfig::new("w1", "s1", "lingering_renderer")
                    .with_render(true)
                    .with_option("url", serde_json::json!("https://held.test")),
            ],
            config,
        );
        h.dispatcher = h.dispatcher.with_render_provider(Arc::new(provider.clone()));

        let outcome = h.dispatcher.run_job("w1", "s1").await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(provider.requests().len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(provider.closed(), vec!["https://held.test".to_string()]);
        assert_eq!(h.store.stored(1).unwrap().health, ProxyHealth::Failed);
    }

    #[tokio::test]
    async fn rerunning_a_job_rereads_configuration() {
        let h = harness(vec![dummy_config()], DispatcherConfig::default());
        assert!(h.dispatcher.run_job("w1", "s1").await.is_success());

        h.dispatcher.configs.remove("w1", "s1");
        assert_eq!(
            h.dispatcher.run_job("w1", "s1").await.error_kind(),
            Some(ErrorKind::ConfigNotFound)
        );
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = JobOutcome::failed(&AppError::PoolExhausted("w1".into()));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "pool_exhausted");
        assert_eq!(json["retryable"], true);
    }

    #[test]
    fn job_phase_roundtrip() {
        for phase in [
            JobPhase::Loading,
            JobPhase::Running,
            JobPhase::Succeeded,
            JobPhase::Failed,
        ] {
            let parsed: JobPhase = phase.as_str().parse().unwrap();
            assert_eq!(parsed, phase);
        }
        assert!(!JobPhase::Running.is_terminal());
        assert!(JobPhase::Failed.is_terminal());
    }
}
