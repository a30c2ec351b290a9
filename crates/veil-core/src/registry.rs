use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AppError;
use crate::parser::Parser;

/// Builds a fresh parser instance for each job.
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn Parser> + Send + Sync>;

/// Name-keyed table of parser factories.
///
/// Populated with explicit [`register`](Self::register) calls during
/// startup, then [`freeze`](Self::freeze)-d into a shared, read-only
/// handle before the first job is dispatched.
#[derive(Default)]
pub struct ParserRegistry {
    factories: HashMap<String, ParserFactory>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`.
    ///
    /// Fails with [`AppError::DuplicateName`] if the name is taken (the
    /// existing entry is kept), and with [`AppError::ValidationError`] if
    /// the name is blank or differs from the name the parser reports.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), AppError>
    where
        F: Fn() -> Box<dyn Parser> + Send + Sync + 'static,
    {
        if name.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Parser name must not be empty".into(),
            ));
        }
        if self.factories.contains_key(name) {
            return Err(AppError::DuplicateName(name.to_string()));
        }

        let probe = factory();
        if probe.name() != name {
            return Err(AppError::ValidationError(format!(
                "Parser registered as '{}' reports its name as '{}'",
                name,
                probe.name()
            )));
        }

        tracing::debug!(parser = %name, "Parser registered");
        self.factories.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Register a parser type under the name it reports.
    pub fn register_default<P>(&mut self) -> Result<(), AppError>
    where
        P: Parser + Default + 'static,
    {
        let name = P::default().name().to_string();
        self.register(&name, || Box::new(P::default()))
    }

    /// A fresh instance of the parser registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Box<dyn Parser>, AppError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| AppError::ParserNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// End of registration: share the registry read-only.
    pub fn freeze(self) -> Arc<ParserRegistry> {
        tracing::info!(parsers = ?self.names(), "Parser registry sealed");
        Arc::new(self)
    }
}
