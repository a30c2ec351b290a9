//! Page-rendering seam.
//!
//! Parsers never see a concrete engine: they ask their run context for a
//! page and get a [`ScopedPage`] back. The engine behind it is whatever
//! [`RenderProvider`] was installed with [`set_render_provider`] at
//! startup (or injected directly into the dispatcher in tests).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::error::AppError;
use crate::models::ProxyRecord;

/// Everything a provider needs to open a page as a given client identity.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: String,
    pub identity: String,
    pub cookies: BTreeMap<String, String>,
    pub proxy: Option<ProxyRecord>,
}

/// A loaded, fully-rendered page.
#[async_trait]
pub trait RenderedPage: Send + Sync {
    /// Current URL of the page.
    fn url(&self) -> &str;

    async fn title(&self) -> Result<Option<String>, AppError>;

    /// Rendered DOM serialized as HTML.
    async fn content(&self) -> Result<String, AppError>;

    async fn goto(&mut self, url: &str) -> Result<(), AppError>;

    /// Release engine resources (tab, context, session).
    async fn close(self: Box<Self>) -> Result<(), AppError>;
}

/// Factory for rendered pages, e.g. a headless browser.
#[async_trait]
pub trait RenderProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn new_page(&self, request: PageRequest) -> Result<Box<dyn RenderedPage>, AppError>;
}

/// Guard around a rendered page.
///
/// Call [`ScopedPage::close`] on the happy path. If the guard is dropped
/// while still open (early return, error, timeout cancellation), the close
/// is scheduled on the current tokio runtime.
pub struct ScopedPage {
    page: Option<Box<dyn RenderedPage>>,
}

impl ScopedPage {
    pub fn new(page: Box<dyn RenderedPage>) -> Self {
        Self { page: Some(page) }
    }

    fn page(&self) -> Result<&dyn RenderedPage, AppError> {
        self.page
            .as_deref()
            .ok_or_else(|| AppError::ParserError("Page already closed".into()))
    }

    pub fn url(&self) -> &str {
        self.page.as_deref().map_or("", |p| p.url())
    }

    pub async fn title(&self) -> Result<Option<String>, AppError> {
        self.page()?.title().await
    }

    pub async fn content(&self) -> Result<String, AppError> {
        self.page()?.content().await
    }

    pub async fn goto(&mut self, url: &str) -> Result<(), AppError> {
        match self.page.as_deref_mut() {
            Some(page) => page.goto(url).await,
            None => Err(AppError::ParserError("Page already closed".into())),
        }
    }

    pub async fn close(mut self) -> Result<(), AppError> {
        match self.page.take() {
            Some(page) => page.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for ScopedPage {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = page.close().await {
                        tracing::warn!(error = %e, "Failed to close dropped page");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(url = %page.url(), "Page dropped outside a runtime; engine resources leak");
            }
        }
    }
}

static PROVIDER: RwLock<Option<Arc<dyn RenderProvider>>> = RwLock::new(None);

/// Install the process-wide rendering provider. Replaces any previous one.
pub fn set_render_provider(provider: Arc<dyn RenderProvider>) {
    tracing::info!(provider = %provider.name(), "Rendering provider installed");
    *PROVIDER.write().unwrap_or_else(|p| p.into_inner()) = Some(provider);
}

/// Remove the process-wide rendering provider (test fixtures).
pub fn clear_render_provider() {
    *PROVIDER.write().unwrap_or_else(|p| p.into_inner()) = None;
}

/// The process-wide rendering provider, if one was installed.
pub fn render_provider() -> Option<Arc<dyn RenderProvider>> {
    PROVIDER.read().unwrap_or_else(|p| p.into_inner()).clone()
}

/// In-memory provider serving canned HTML per URL.
///
/// Useful for dry runs and tests; records every request it receives.
#[derive(Clone, Default)]
pub struct StaticRenderProvider {
    pages: Arc<BTreeMap<String, String>>,
    requests: Arc<Mutex<Vec<PageRequest>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl StaticRenderProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages<I, K, V>(pages: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pages: Arc::new(pages.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
            ..Self::default()
        }
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// URLs of pages that have been closed.
    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn html_for(&self, url: &str) -> String {
        self.pages.get(url).cloned().unwrap_or_else(|| {
            format!("<html><head><title>title::{url}</title></head><body></body></html>")
        })
    }
}

#[async_trait]
impl RenderProvider for StaticRenderProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn new_page(&self, request: PageRequest) -> Result<Box<dyn RenderedPage>, AppError> {
        let html = self.html_for(&request.url);
        let page = StaticPage {
            url: request.url.clone(),
            html,
            provider: self.clone(),
        };
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request);
        Ok(Box::new(page))
    }
}

struct StaticPage {
    url: String,
    html: String,
    provider: StaticRenderProvider,
}

#[async_trait]
impl RenderedPage for StaticPage {
    fn url(&self) -> &str {
        &self.url
    }

    async fn title(&self) -> Result<Option<String>, AppError> {
        Ok(extract_title(&self.html))
    }

    async fn content(&self) -> Result<String, AppError> {
        Ok(self.html.clone())
    }

    async fn goto(&mut self, url: &str) -> Result<(), AppError> {
        self.url = url.to_string();
        self.html = self.provider.html_for(url);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), AppError> {
        self.provider
            .closed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(self.url.clone());
        Ok(())
    }
}

/// Text of the first `<title>` element, trimmed.
pub fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    let title = document.select(&selector).next()?.text().collect::<String>();
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> PageRequest {
        PageRequest {
            url: url.to_string(),
            identity: "Agent-A".into(),
            cookies: BTreeMap::new(),
            proxy: None,
        }
    }

    #[test]
    fn extract_title_handles_attributes_and_case() {
        assert_eq!(
            extract_title("<HTML><Title lang=\"en\"> Hello </Title></HTML>"),
            Some("Hello".to_string())
        );
        assert_eq!(extract_title("<html><body>no title</body></html>"), None);
        assert_eq!(extract_title("<title></title>"), None);
    }

    #[test]
    fn extract_title_decodes_entities_and_ignores_body_text() {
        let html = "<html><head><title>Fish &amp; Chips</title></head>\
            <body><p>&lt;title&gt;fake&lt;/title&gt;</p></body></html>";
        assert_eq!(extract_title(html), Some("Fish & Chips".to_string()));
        assert_eq!(extract_title("<body><p>&lt;title&gt;fake&lt;/title&gt;</p></body>"), None);
    }

    #[tokio::test]
    async fn static_provider_serves_canned_pages() {
        let provider = StaticRenderProvider::with_pages([(
            "https://example.com/a",
            "<title>Alpha</title>",
        )]);

        let page = ScopedPage::new(provider.new_page(request("https://example.com/a")).await.unwrap());
        assert_eq!(page.title().await.unwrap(), Some("Alpha".to_string()));
        page.close().await.unwrap();

        assert_eq!(provider.requests().len(), 1);
        assert_eq!(provider.closed(), vec!["https://example.com/a".to_string()]);
    }

    #[tokio::test]
    async fn goto_navigates_within_the_same_page() {
        let provider = StaticRenderProvider::new();
        let mut page = ScopedPage::new(provider.new_page(request("https://a.test")).await.unwrap());
        page.goto("https://b.test").await.unwrap();
        assert_eq!(page.url(), "https://b.test");
        assert_eq!(page.title().await.unwrap(), Some("title::https://b.test".to_string()));
        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_page_is_closed_in_background() {
        let provider = StaticRenderProvider::new();
        {
            let _page = ScopedPage::new(provider.new_page(request("https://drop.test")).await.unwrap());
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(provider.closed(), vec!["https://drop.test".to_string()]);
    }

    #[test]
    fn provider_slot_can_be_set_and_cleared() {
        set_render_provider(Arc::new(StaticRenderProvider::new()));
        assert_eq!(render_provider().map(|p| p.name().to_string()), Some("static".into()));
        clear_render_provider();
        assert!(render_provider().is_none());
    }
}
