use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::anti_detect::AntiDetectToolkit;
use crate::error::AppError;
use crate::models::{ParserConfig, ProxyRecord};
use crate::proxy::{CooldownPolicy, ProxyPool};
use crate::render::{PageRequest, RenderProvider, ScopedPage};

/// Everything a parser may touch during one job.
///
/// Created by the dispatcher per invocation and owned by it; the parser
/// only borrows it for the duration of `parse`. Whatever proxy is still
/// held when `parse` ends is returned to the pool by the dispatcher.
pub struct RunContext {
    run_id: Uuid,
    config: Arc<ParserConfig>,
    toolkit: AntiDetectToolkit,
    proxies: ProxyPool,
    held_proxy: Option<ProxyRecord>,
    renderer: Option<Arc<dyn RenderProvider>>,
    render_timeout: Duration,
    cooldown: CooldownPolicy,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        config: Arc<ParserConfig>,
        proxies: ProxyPool,
        renderer: Option<Arc<dyn RenderProvider>>,
        render_timeout: Duration,
        cooldown: CooldownPolicy,
    ) -> Self {
        let toolkit = AntiDetectToolkit::from_config(&config);
        Self {
            run_id,
            config,
            toolkit,
            proxies,
            held_proxy: None,
            renderer,
            render_timeout,
            cooldown,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn workspace(&self) -> &str {
        &self.config.workspace_id
    }

    pub fn source(&self) -> &str {
        &self.config.source_name
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    // -- Options --

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.config.options.get(key)
    }

    pub fn option_or(&self, key: &str, default: Value) -> Value {
        self.option(key).cloned().unwrap_or(default)
    }

    /// Decode an option into `T`; a present but malformed value is a
    /// [`AppError::ValidationError`].
    pub fn option_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        match self.option(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| AppError::ValidationError(format!("Option '{key}': {e}"))),
        }
    }

    // -- Anti-detect --

    pub fn toolkit(&self) -> &AntiDetectToolkit {
        &self.toolkit
    }

    pub fn toolkit_mut(&mut self) -> &mut AntiDetectToolkit {
        &mut self.toolkit
    }

    pub fn next_identity(&mut self) -> Result<String, AppError> {
        self.toolkit.next_identity()
    }

    pub fn cookie_header(&self) -> String {
        self.toolkit.cookie_header()
    }

    // -- Proxy --

    /// The proxy held for this run, acquiring one on first call.
    pub async fn acquire_proxy(&mut self) -> Result<ProxyRecord, AppError> {
        if let Some(record) = &self.held_proxy {
            return Ok(record.clone());
        }
        let record = self.proxies.acquire(&self.config.workspace_id).await?;
        self.held_proxy = Some(record.clone());
        Ok(record)
    }

    pub fn held_proxy(&self) -> Option<&ProxyRecord> {
        self.held_proxy.as_ref()
    }

    /// Hand the held proxy back early. `success == false` puts it on the
    /// default cooldown.
    pub async fn release_proxy(&mut self, success: bool) -> Result<(), AppError> {
        let Some(record) = self.held_proxy.take() else {
            return Ok(());
        };
        if success {
            self.proxies.release(&record).await
        } else {
            self.proxies.mark_failed(&record, self.cooldown.default).await
        }
    }

    /// Detach the held proxy so the dispatcher can settle it.
    pub(crate) fn take_proxy(&mut self) -> Option<ProxyRecord> {
        self.held_proxy.take()
    }

    // -- Rendering --

    /// Open a rendered page for `url`.
    ///
    /// Identity defaults to the next rotated user agent and cookies to the
    /// run's jar; the held proxy (if any) is passed to the engine.
    pub async fn render_page(
        &mut self,
        url: &str,
        identity: Option<&str>,
        cookies: Option<BTreeMap<String, String>>,
    ) -> Result<ScopedPage, AppError> {
        if !self.config.use_render {
            return Err(AppError::RenderingDisabled);
        }
        let renderer = self
            .renderer
            .clone()
            .ok_or_else(|| AppError::ConfigError("No rendering provider installed".into()))?;

        let identity = match identity {
            Some(identity) => identity.to_string(),
            None => self.toolkit.next_identity()?,
        };
        let request = PageRequest {
            url: url.to_string(),
            identity,
            cookies: cookies.unwrap_or_else(|| self.toolkit.cookies()),
            proxy: self.held_proxy.clone(),
        };

        tracing::debug!(%url, provider = %renderer.name(), "Rendering page");
        match tokio::time::timeout(self.render_timeout, renderer.new_page(request)).await {
            Ok(page) => page.map(ScopedPage::new),
            Err(_) => Err(AppError::RenderTimeout(self.render_timeout.as_secs())),
        }
    }
}
