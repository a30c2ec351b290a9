use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use veil_client::ReqwestFetcher;
use veil_core::config::DispatcherConfig;
use veil_core::dispatcher::{Dispatcher, JobOutcome};
use veil_core::models::{ParserConfig, ProxyProtocol};
use veil_core::parsers::register_builtin_parsers;
use veil_core::proxy::ProxyPool;
use veil_core::registry::ParserRegistry;
use veil_db::{Database, DatabaseConfig, NewProxy};

#[derive(Parser)]
#[command(name = "veil", version, about = "Workspace-scoped parser framework")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured parser for a workspace source once
    Run {
        /// Workspace identifier
        #[arg(short, long, env = "VEIL_WORKSPACE")]
        workspace: String,

        /// Source name within the workspace
        #[arg(short, long)]
        source: String,

        /// Launch headless Chromium for sources with rendering enabled
        #[cfg(feature = "browser")]
        #[arg(long, default_value_t = false)]
        browser: bool,

        /// Allow fetching private/reserved addresses
        #[arg(long, default_value_t = false)]
        allow_private_urls: bool,
    },

    /// List registered parsers
    Parsers,

    /// Show persisted proxy health for a workspace
    Proxies {
        #[arg(short, long, env = "VEIL_WORKSPACE")]
        workspace: String,
    },

    /// Store a source's parser configuration from a JSON file
    Configure {
        #[arg(short, long, env = "VEIL_WORKSPACE")]
        workspace: String,

        #[arg(short, long)]
        source: String,

        /// JSON object with `parser_name` and optional `options`,
        /// `user_agents`, `cookies`, `use_render`, `is_active`
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Add a proxy to a workspace
    AddProxy {
        #[arg(short, long, env = "VEIL_WORKSPACE")]
        workspace: String,

        #[arg(long)]
        host: String,

        #[arg(long)]
        port: u16,

        /// http, https or socks5
        #[arg(long, default_value = "socks5")]
        protocol: ProxyProtocol,

        #[arg(long, requires = "password")]
        username: Option<String>,

        #[arg(long, env = "VEIL_PROXY_PASSWORD", requires = "username")]
        password: Option<String>,
    },

    /// Take a proxy out of rotation, or put it back with --enable
    ToggleProxy {
        /// Proxy id as shown by `veil proxies`
        id: i64,

        #[arg(long, default_value_t = false)]
        enable: bool,
    },

    /// Pause a source so its jobs are skipped, or resume it with --enable
    ToggleSource {
        #[arg(short, long, env = "VEIL_WORKSPACE")]
        workspace: String,

        #[arg(short, long)]
        source: String,

        #[arg(long, default_value_t = false)]
        enable: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("veil=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            workspace,
            source,
            #[cfg(feature = "browser")]
            browser,
            allow_private_urls,
        } => {
            #[cfg(feature = "browser")]
            if browser {
                install_browser().await?;
            }
            let outcome = cmd_run(&workspace, &source, allow_private_urls).await?;
            return Ok(if outcome.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Commands::Parsers => cmd_parsers()?,
        Commands::Proxies { workspace } => {
            let db = connect_db().await?;
            cmd_proxies(&db, &workspace).await?;
        }
        Commands::Configure {
            workspace,
            source,
            file,
        } => {
            let db = connect_db().await?;
            cmd_configure(&db, &workspace, &source, &file).await?;
        }
        Commands::AddProxy {
            workspace,
            host,
            port,
            protocol,
            username,
            password,
        } => {
            let db = connect_db().await?;
            let mut proxy = NewProxy::new(workspace, host, port).with_protocol(protocol);
            if let (Some(username), Some(password)) = (username, password) {
                proxy = proxy.with_credentials(username, password);
            }
            let record = db.proxy_repo().add(&proxy).await.context("Failed to add proxy")?;
            println!("Added proxy {} ({})", record.id, record.server());
        }
        Commands::ToggleProxy { id, enable } => {
            let db = connect_db().await?;
            if !db.proxy_repo().set_active(id, enable).await? {
                anyhow::bail!("No proxy with id {id}");
            }
            println!("Proxy {id} {}", if enable { "enabled" } else { "disabled" });
        }
        Commands::ToggleSource {
            workspace,
            source,
            enable,
        } => {
            let db = connect_db().await?;
            if !db.config_repo().set_active(&workspace, &source, enable).await? {
                anyhow::bail!("No configuration for workspace={workspace} source={source}");
            }
            println!("Source {source} {}", if enable { "resumed" } else { "paused" });
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    Database::open(&config)
        .await
        .context("Failed to open database")
}

fn build_registry(fetcher: ReqwestFetcher) -> Result<Arc<ParserRegistry>> {
    let mut registry = ParserRegistry::new();
    register_builtin_parsers(&mut registry)?;
    veil_client::register_parsers(&mut registry, fetcher)?;
    Ok(registry.freeze())
}

#[cfg(feature = "browser")]
async fn install_browser() -> Result<()> {
    let provider = veil_client::ChromiumRenderProvider::launch()
        .await
        .context("Failed to launch headless browser")?;
    veil_core::render::set_render_provider(Arc::new(provider));
    Ok(())
}

async fn cmd_run(workspace: &str, source: &str, allow_private_urls: bool) -> Result<JobOutcome> {
    let config = DispatcherConfig::from_env()?;
    let db = connect_db().await?;

    let mut fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    if allow_private_urls {
        fetcher = fetcher.allow_private_urls();
    }
    let registry = build_registry(fetcher)?;
    let proxies = ProxyPool::new(Arc::new(db.proxy_repo())).with_lease(config.proxy_lease);
    let dispatcher = Dispatcher::new(db.config_repo(), registry, proxies, config);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling job");
            trigger.cancel();
        }
    });

    let outcome = dispatcher.run_job_cancellable(workspace, source, cancel).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome)
}

fn cmd_parsers() -> Result<()> {
    let fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    for name in build_registry(fetcher)?.names() {
        println!("{name}");
    }
    Ok(())
}

async fn cmd_proxies(db: &Database, workspace: &str) -> Result<()> {
    let proxies = db.proxy_repo().list_all(workspace).await?;

    if proxies.is_empty() {
        println!("No proxies found for workspace={workspace}");
        return Ok(());
    }

    println!("Proxies for workspace {workspace}:\n");
    for proxy in &proxies {
        let until = proxy
            .failed_until
            .map(|t| format!(" until {}", t.format("%Y-%m-%d %H:%M:%S UTC")))
            .unwrap_or_default();
        let inactive = if proxy.is_active { "" } else { "  (inactive)" };
        println!(
            "  [{}] {}  {}{}{}",
            proxy.id,
            proxy.server(),
            proxy.health,
            until,
            inactive
        );
    }
    println!("\nTotal: {} proxies", proxies.len());
    Ok(())
}

async fn cmd_configure(db: &Database, workspace: &str, source: &str, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read config file: {}", file.display()))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&raw).context("Invalid JSON in config file")?;

    let object = value
        .as_object_mut()
        .context("Config file must contain a JSON object")?;
    object.insert("workspace_id".into(), workspace.into());
    object.insert("source_name".into(), source.into());
    let config: ParserConfig =
        serde_json::from_value(value).context("Config file does not describe a parser config")?;

    db.config_repo().upsert(&config).await?;
    tracing::info!(%workspace, %source, parser = %config.parser_name, "Configuration stored");
    Ok(())
}
