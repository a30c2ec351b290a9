pub mod cleaner;
pub mod fetcher;
pub mod http_page;

#[cfg(feature = "browser")]
pub mod browser;

pub use cleaner::HtmdCleaner;
pub use fetcher::{FetchedPage, ReqwestFetcher};
pub use http_page::HttpPageParser;

#[cfg(feature = "browser")]
pub use browser::ChromiumRenderProvider;

use veil_core::error::AppError;
use veil_core::registry::ParserRegistry;

/// Register the HTTP-backed parsers, sharing `fetcher` between them.
pub fn register_parsers(
    registry: &mut ParserRegistry,
    fetcher: ReqwestFetcher,
) -> Result<(), AppError> {
    registry.register(HttpPageParser::NAME, move || {
        Box::new(HttpPageParser::new(fetcher.clone()))
    })?;
    Ok(())
}
