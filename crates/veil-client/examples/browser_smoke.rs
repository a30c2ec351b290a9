/// Smoke-test for `ChromiumRenderProvider`.
///
/// Launches a headless Chromium, renders <https://example.com> as a custom
/// identity with a cookie, and checks the title and rendered HTML.
///
/// Run with:
///   cargo run -p veil-client --example browser_smoke --features browser
use std::collections::BTreeMap;

use veil_client::ChromiumRenderProvider;
use veil_core::render::{PageRequest, RenderProvider, ScopedPage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser…");
    let provider = ChromiumRenderProvider::launch().await?;

    let url = "https://example.com";
    println!("Rendering {url} …");
    let page = ScopedPage::new(
        provider
            .new_page(PageRequest {
                url: url.to_string(),
                identity: "Mozilla/5.0 (X11; Linux x86_64) VeilSmoke/0.1".to_string(),
                cookies: BTreeMap::from([("smoke".to_string(), "1".to_string())]),
                proxy: None,
            })
            .await?,
    );

    let title = page.title().await?;
    let html = page.content().await?;
    page.close().await?;

    assert_eq!(title.as_deref(), Some("Example Domain"));
    assert!(
        html.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in rendered HTML"
    );

    println!("OK: title {title:?}, {} bytes of rendered HTML", html.len());
    Ok(())
}
