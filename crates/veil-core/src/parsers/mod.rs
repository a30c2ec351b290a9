//! Parsers shipped with the core crate.

mod dummy;

pub use dummy::DummyParser;

use crate::error::AppError;
use crate::registry::ParserRegistry;

/// Register every built-in parser.
pub fn register_builtin_parsers(registry: &mut ParserRegistry) -> Result<(), AppError> {
    registry.register_default::<DummyParser>()?;
    Ok(())
}
