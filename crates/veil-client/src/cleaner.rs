use std::sync::Arc;

use htmd::HtmlToMarkdown;
use veil_core::error::AppError;

/// Page chrome that never belongs in an extracted body.
const BOILERPLATE_TAGS: &[&str] = &[
    "head", "script", "style", "noscript", "template", "iframe", "svg", "nav", "header", "footer",
    "aside", "form",
];

/// Turns a fetched HTML page into Markdown for the `markdown` item field.
#[derive(Clone)]
pub struct HtmdCleaner {
    converter: Arc<HtmlToMarkdown>,
}

impl HtmdCleaner {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(BOILERPLATE_TAGS.to_vec())
            .build();
        Self {
            converter: Arc::new(converter),
        }
    }

    pub fn clean(&self, html: &str) -> Result<String, AppError> {
        let markdown = self
            .converter
            .convert(html)
            .map_err(|e| AppError::ParserError(format!("Markdown conversion failed: {e}")))?;
        Ok(collapse_blank_lines(&markdown))
    }
}

impl Default for HtmdCleaner {
    fn default() -> Self {
        Self::new()
    }
}

/// Trim trailing whitespace per line and keep at most one empty line in a row.
fn collapse_blank_lines(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut blank_run = 0;
    for line in markdown.trim().lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.truncate(out.trim_end().len());
    out
}
