use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::AppError;
use crate::models::ParserRunResult;

/// An extraction unit for one kind of content source.
///
/// Implementations are registered by name in a
/// [`ParserRegistry`](crate::registry::ParserRegistry) and run by the
/// [`Dispatcher`](crate::dispatcher::Dispatcher), which owns the
/// [`RunContext`] and cleans up its proxy no matter how `parse` ends.
#[async_trait]
pub trait Parser: Send + Sync {
    /// Unique registry name, e.g. `"dummy"`.
    fn name(&self) -> &str;

    /// JSON Schema the source's `options` must satisfy, if any.
    ///
    /// Checked by the dispatcher before `parse` is called.
    fn options_schema(&self) -> Option<serde_json::Value> {
        None
    }

    async fn parse(&self, ctx: &mut RunContext) -> Result<ParserRunResult, AppError>;
}
