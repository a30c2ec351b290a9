use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{Value, json};
use veil_core::context::RunContext;
use veil_core::error::AppError;
use veil_core::models::{JsonObject, ParserRunResult};
use veil_core::parser::Parser;

use crate::cleaner::HtmdCleaner;
use crate::fetcher::ReqwestFetcher;

/// Fetches each configured URL over HTTP and extracts page metadata.
///
/// Options:
/// - `urls` (required): a URL or a list of URLs
/// - `markdown`: also return the page body as Markdown (default `false`)
/// - `use_proxy`: route requests through a workspace proxy (default `true`)
///
/// Every request carries the toolkit's rotated user agent and cookie jar;
/// cookies set by responses are merged back into the jar for the next URL.
#[derive(Clone)]
pub struct HttpPageParser {
    fetcher: ReqwestFetcher,
    cleaner: HtmdCleaner,
}

impl HttpPageParser {
    pub const NAME: &'static str = "http_page";

    pub fn new(fetcher: ReqwestFetcher) -> Self {
        Self {
            fetcher,
            cleaner: HtmdCleaner::new(),
        }
    }
}

/// Fields pulled out of a page's `<head>`.
#[derive(Debug, Default, PartialEq)]
struct PageSummary {
    title: Option<String>,
    description: Option<String>,
    canonical: Option<String>,
}

fn summarize(html: &str) -> PageSummary {
    let document = Html::parse_document(html);
    PageSummary {
        title: first_text(&document, "title"),
        description: first_attr(&document, "meta[name='description']", "content"),
        canonical: first_attr(&document, "link[rel='canonical']", "href"),
    }
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn urls_option(ctx: &RunContext) -> Vec<String> {
    match ctx.option("urls") {
        Some(Value::String(url)) => vec![url.clone()],
        Some(Value::Array(urls)) => urls
            .iter()
            .filter_map(|u| u.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Parser for HttpPageParser {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn options_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["urls"],
            "properties": {
                "urls": {
                    "oneOf": [
                        { "type": "string", "minLength": 1 },
                        { "type": "array", "items": { "type": "string", "minLength": 1 }, "minItems": 1 }
                    ]
                },
                "markdown": { "type": "boolean" },
                "use_proxy": { "type": "boolean" }
            }
        }))
    }

    async fn parse(&self, ctx: &mut RunContext) -> Result<ParserRunResult, AppError> {
        let urls = urls_option(ctx);
        let markdown = ctx.option_as::<bool>("markdown")?.unwrap_or(false);
        let use_proxy = ctx.option_as::<bool>("use_proxy")?.unwrap_or(true);

        let proxy = if use_proxy {
            Some(ctx.acquire_proxy().await?)
        } else {
            None
        };

        let mut items = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            let headers = ctx.toolkit_mut().request_headers()?;
            let user_agent = headers
                .iter()
                .find(|(name, _)| *name == "User-Agent")
                .map(|(_, value)| value.clone());

            let page = self.fetcher.fetch(url, &headers, proxy.as_ref()).await?;
            ctx.toolkit_mut().update_cookies(page.cookies.iter().cloned());

            let summary = summarize(&page.body);
            tracing::debug!(%url, status = page.status, title = ?summary.title, "Fetched page");

            let mut item = JsonObject::new();
            item.insert("index".into(), json!(index + 1));
            item.insert("url".into(), json!(url));
            item.insert("final_url".into(), json!(page.url));
            item.insert("status".into(), json!(page.status));
            item.insert("user_agent".into(), json!(user_agent));
            item.insert("title".into(), json!(summary.title));
            item.insert("description".into(), json!(summary.description));
            item.insert("canonical".into(), json!(summary.canonical));
            if markdown {
                item.insert("markdown".into(), json!(self.cleaner.clean(&page.body)?));
            }
            items.push(item);
        }

        let mut metadata = JsonObject::new();
        metadata.insert("proxy".into(), json!(proxy.map(|p| p.server())));
        metadata.insert("cookie_header".into(), json!(ctx.cookie_header()));
        Ok(ParserRunResult::new(items, metadata))
    }
}
