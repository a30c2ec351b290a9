pub mod anti_detect;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod parser;
pub mod parsers;
pub mod proxy;
pub mod registry;
pub mod render;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use anti_detect::{AntiDetectToolkit, CookieJar, IdentityRotator};
pub use config::DispatcherConfig;
pub use context::RunContext;
pub use dispatcher::{
    DispatchEvent, DispatchReporter, Dispatcher, JobOutcome, JobPhase, TracingDispatchReporter,
};
pub use error::{AppError, ErrorKind};
pub use models::{
    JsonObject, ParserConfig, ParserRunResult, ProxyClaim, ProxyCredentials, ProxyHealth,
    ProxyProtocol, ProxyRecord, ProxySettlement,
};
pub use parser::Parser;
pub use proxy::{CooldownPolicy, DEFAULT_PROXY_LEASE, ProxyPool};
pub use registry::{ParserFactory, ParserRegistry};
pub use render::{
    PageRequest, RenderProvider, RenderedPage, ScopedPage, StaticRenderProvider,
    clear_render_provider, render_provider, set_render_provider,
};
pub use traits::{ConfigStore, ProxyStore};
