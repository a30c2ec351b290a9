use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::RunContext;
use crate::error::AppError;
use crate::models::{JsonObject, ParserRunResult};
use crate::parser::Parser;

/// Smoke-test parser: emits one deterministic item per configured URL.
///
/// Options:
/// - `urls`: a single URL or a list of URLs (default: none)
/// - `use_proxy`: acquire a workspace proxy for the run (default: `true`)
///
/// Each item reports the rotated user agent, the proxy and cookie header
/// in effect and, when the source renders pages, the page title.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyParser;

impl DummyParser {
    fn urls(ctx: &RunContext) -> Vec<String> {
        match ctx.option("urls") {
            Some(Value::String(url)) => vec![url.clone()],
            Some(Value::Array(urls)) => urls
                .iter()
                .map(|url| match url {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Parser for DummyParser {
    fn name(&self) -> &str {
        "dummy"
    }

    fn options_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "urls": {
                    "oneOf": [
                        { "type": "string" },
                        { "type": "array", "items": { "type": "string" } }
                    ]
                },
                "use_proxy": { "type": "boolean" }
            }
        }))
    }

    async fn parse(&self, ctx: &mut RunContext) -> Result<ParserRunResult, AppError> {
        let urls = Self::urls(ctx);
        let use_proxy = ctx.option_as::<bool>("use_proxy")?.unwrap_or(true);

        let proxy = if use_proxy {
            Some(ctx.acquire_proxy().await?.server())
        } else {
            None
        };
        let cookie_header = ctx.cookie_header();
        let render = ctx.config().use_render;

        let mut items = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            let user_agent = ctx.next_identity()?;

            let title = if render {
                let page = ctx.render_page(url, Some(&user_agent), None).await?;
                let title = page.title().await;
                page.close().await?;
                title?
            } else {
                None
            };

            let mut item = JsonObject::new();
            item.insert("index".into(), json!(index + 1));
            item.insert("url".into(), json!(url));
            item.insert("user_agent".into(), json!(user_agent));
            item.insert("proxy".into(), json!(proxy));
            item.insert("cookie_header".into(), json!(cookie_header));
            item.insert("title".into(), json!(title));
            items.push(item);
        }

        tracing::debug!(items = items.len(), "Dummy parser finished");
        Ok(ParserRunResult::new(items, JsonObject::new()))
    }
}
