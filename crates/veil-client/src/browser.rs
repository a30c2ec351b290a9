use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, SetCookiesParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::target::{
    BrowserContextId, CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use url::Url;
use veil_core::error::AppError;
use veil_core::render::{PageRequest, RenderProvider, RenderedPage};

/// Rendering provider backed by headless Chromium over the DevTools Protocol.
///
/// One Chromium process is shared across clones. Every page gets its own
/// browser context, so identity, cookies and proxy never leak between
/// pages; closing the page disposes the context.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use veil_client::ChromiumRenderProvider;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = ChromiumRenderProvider::launch().await?;
/// veil_core::render::set_render_provider(Arc::new(provider));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChromiumRenderProvider {
    browser: Arc<Browser>,
}

impl ChromiumRenderProvider {
    /// Launches a headless Chromium browser.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH`,
    /// `$CHROME_BIN`, or one of the well-known install locations.
    pub async fn launch() -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // The snap wrapper rejects standard Chrome flags; prefer the real binary.
        if let Some(bin) = find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::ConfigError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
        })
    }

    async fn open_context(&self, request: &PageRequest) -> Result<BrowserContextId, AppError> {
        let mut params = CreateBrowserContextParams::default();
        if let Some(proxy) = &request.proxy {
            if proxy.credentials.is_some() {
                tracing::warn!(
                    proxy_id = proxy.id,
                    "Chromium cannot authenticate to proxies from the command line; credentials ignored"
                );
            }
            params.proxy_server = Some(proxy.server());
        }

        let response = self
            .browser
            .execute(params)
            .await
            .map_err(|e| AppError::ParserError(format!("Failed to create browser context: {e}")))?;
        Ok(response.result.browser_context_id)
    }

    async fn dispose_context(browser: &Browser, context: BrowserContextId) {
        if let Err(e) = browser.execute(DisposeBrowserContextParams::new(context)).await {
            tracing::warn!(error = %e, "Failed to dispose browser context");
        }
    }
}

#[async_trait]
impl RenderProvider for ChromiumRenderProvider {
    fn name(&self) -> &str {
        "chromium"
    }

    async fn new_page(&self, request: PageRequest) -> Result<Box<dyn RenderedPage>, AppError> {
        let context = self.open_context(&request).await?;
        // From here on the context is owned by `rendered`: an error or a
        // dropped future disposes it.
        let mut rendered = ChromiumPage::opening(&self.browser, context, &request.url);

        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = rendered.context.clone();
        match self.browser.new_page(target).await {
            Ok(page) => rendered.page = Some(page),
            Err(e) => {
                rendered.release().await.ok();
                return Err(AppError::ParserError(format!("Failed to open tab: {e}")));
            }
        }

        if let Err(e) = rendered.prepare(&request).await {
            rendered.release().await.ok();
            return Err(e);
        }
        Ok(Box::new(rendered))
    }
}

/// One tab inside its own browser context.
///
/// Both are released on [`close`](RenderedPage::close) or, failing that,
/// in the background when the value is dropped.
struct ChromiumPage {
    browser: Arc<Browser>,
    page: Option<Page>,
    context: Option<BrowserContextId>,
    url: String,
}

impl ChromiumPage {
    fn opening(browser: &Arc<Browser>, context: BrowserContextId, url: &str) -> Self {
        Self {
            browser: Arc::clone(browser),
            page: None,
            context: Some(context),
            url: url.to_string(),
        }
    }

    fn page(&self) -> Result<&Page, AppError> {
        self.page
            .as_ref()
            .ok_or_else(|| AppError::ParserError("Page already closed".into()))
    }

    async fn prepare(&mut self, request: &PageRequest) -> Result<(), AppError> {
        self.page()?
            .execute(SetUserAgentOverrideParams::new(request.identity.clone()))
            .await
            .map_err(|e| AppError::ParserError(format!("Failed to set user agent: {e}")))?;

        let cookies = scoped_cookies(&request.url, &request.cookies)?;
        if !cookies.is_empty() {
            self.page()?
                .execute(SetCookiesParams::new(cookies))
                .await
                .map_err(|e| AppError::ParserError(format!("Failed to set cookies: {e}")))?;
        }

        self.navigate(&request.url).await
    }

    async fn navigate(&mut self, url: &str) -> Result<(), AppError> {
        let page = self.page()?;
        page.goto(url)
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {url}: {e}")))?;

        // <body> present is a minimal signal that the main content rendered.
        page.find_element("body")
            .await
            .map_err(|e| AppError::NetworkError(format!("Page did not render body: {e}")))?;

        self.url = url.to_string();
        Ok(())
    }

    /// Close the tab, then dispose the context. The context is taken last
    /// so that an interrupted release still leaves it to `Drop`.
    async fn release(&mut self) -> Result<(), AppError> {
        let closed = match self.page.take() {
            Some(page) => page
                .close()
                .await
                .map_err(|e| AppError::ParserError(format!("Failed to close tab: {e}"))),
            None => Ok(()),
        };
        if let Some(context) = self.context.take() {
            ChromiumRenderProvider::dispose_context(&self.browser, context).await;
        }
        closed
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        if self.page.is_none() && self.context.is_none() {
            return;
        }
        let page = self.page.take();
        let context = self.context.take();
        let browser = Arc::clone(&self.browser);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(page) = page
                        && let Err(e) = page.close().await
                    {
                        tracing::debug!(error = %e, "Failed to close abandoned tab");
                    }
                    if let Some(context) = context {
                        ChromiumRenderProvider::dispose_context(&browser, context).await;
                    }
                });
            }
            Err(_) => {
                tracing::warn!(url = %self.url, "Chromium page dropped outside a runtime; its browser context stays open");
            }
        }
    }
}

#[async_trait]
impl RenderedPage for ChromiumPage {
    fn url(&self) -> &str {
        &self.url
    }

    async fn title(&self) -> Result<Option<String>, AppError> {
        self.page()?
            .get_title()
            .await
            .map_err(|e| AppError::ParserError(format!("Failed to read title: {e}")))
    }

    async fn content(&self) -> Result<String, AppError> {
        self.page()?
            .content()
            .await
            .map_err(|e| AppError::ParserError(format!("Failed to read page content: {e}")))
    }

    async fn goto(&mut self, url: &str) -> Result<(), AppError> {
        self.navigate(url).await
    }

    async fn close(mut self: Box<Self>) -> Result<(), AppError> {
        self.release().await
    }
}

/// Cookie params bound to the host and path of `url`.
fn scoped_cookies(
    url: &str,
    cookies: &std::collections::BTreeMap<String, String>,
) -> Result<Vec<CookieParam>, AppError> {
    if cookies.is_empty() {
        return Ok(Vec::new());
    }
    let parsed =
        Url::parse(url).map_err(|e| AppError::ValidationError(format!("Invalid URL: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::ValidationError(format!("URL has no host: {url}")))?;

    Ok(cookies
        .iter()
        .map(|(name, value)| {
            let mut cookie = CookieParam::new(name.clone(), value.clone());
            cookie.domain = Some(host.to_string());
            cookie.path = Some(cookie_path(&parsed));
            cookie.secure = Some(parsed.scheme() == "https");
            cookie
        })
        .collect())
}

/// Default cookie path: the URL's directory.
fn cookie_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Tries to locate the real Chrome/Chromium binary.
///
/// On systems where Chromium is installed via **snap**, the wrapper at
/// `/snap/bin/chromium` strips unknown CLI flags, breaking headless mode.
/// If nothing is found we return `None` and let `chromiumoxide` do its
/// own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    let candidates: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}
