use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A single extracted record or metadata bag: a JSON object.
pub type JsonObject = Map<String, Value>;

/// Parser configuration for one (workspace, source) pair.
///
/// The store guarantees at most one config per pair; `options` is opaque
/// to the core and only interpreted by the parser itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
    pub workspace_id: String,
    pub source_name: String,
    pub parser_name: String,
    #[serde(default)]
    pub options: JsonObject,
    #[serde(default)]
    pub user_agents: Vec<String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub use_render: bool,
    /// Inactive sources are skipped without running the parser.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl ParserConfig {
    pub fn new(
        workspace_id: impl Into<String>,
        source_name: impl Into<String>,
        parser_name: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            source_name: source_name.into(),
            parser_name: parser_name.into(),
            options: JsonObject::new(),
            user_agents: Vec::new(),
            cookies: BTreeMap::new(),
            use_render: false,
            is_active: true,
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_user_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_render(mut self, use_render: bool) -> Self {
        self.use_render = use_render;
        self
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }
}

/// Outbound proxy protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    #[default]
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProxyProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "socks5" => Ok(ProxyProtocol::Socks5),
            _ => Err(format!("Unknown proxy protocol: {}", s)),
        }
    }
}

/// Health of a proxy record inside its workspace pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyHealth {
    #[default]
    Available,
    InUse,
    Failed,
}

impl ProxyHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyHealth::Available => "available",
            ProxyHealth::InUse => "in_use",
            ProxyHealth::Failed => "failed",
        }
    }
}

impl fmt::Display for ProxyHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProxyHealth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "available" => Ok(ProxyHealth::Available),
            "in_use" => Ok(ProxyHealth::InUse),
            "failed" => Ok(ProxyHealth::Failed),
            _ => Err(format!("Unknown proxy health: {}", s)),
        }
    }
}

/// Username/password pair for an authenticated proxy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// An outbound proxy belonging to a workspace.
///
/// `lease_id`/`lease_until` identify the current holder while the record is
/// `in_use`; a lease that ran out belongs to a holder that died.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: i64,
    pub workspace_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default)]
    pub health: ProxyHealth,
    pub failed_until: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub lease_id: Option<Uuid>,
    #[serde(default)]
    pub lease_until: Option<DateTime<Utc>>,
}

impl ProxyRecord {
    /// An available, active SOCKS5 proxy without credentials.
    pub fn new(id: i64, workspace_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            workspace_id: workspace_id.into(),
            host: host.into(),
            port,
            credentials: None,
            protocol: ProxyProtocol::Socks5,
            health: ProxyHealth::Available,
            failed_until: None,
            is_active: true,
            lease_id: None,
            lease_until: None,
        }
    }

    /// Whether a claim at `now` may hand this record out: available, past
    /// its cooldown, or held under an expired lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        match self.health {
            ProxyHealth::Available => true,
            ProxyHealth::Failed => self.failed_until.is_none_or(|until| until <= now),
            ProxyHealth::InUse => self.lease_until.is_none_or(|until| until <= now),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Proxy URL without credentials, e.g. `socks5://127.0.0.1:1080`.
    pub fn server(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Proxy URL including credentials when present.
    pub fn url(&self) -> String {
        match &self.credentials {
            Some(creds) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol, creds.username, creds.password, self.host, self.port
            ),
            None => self.server(),
        }
    }
}

/// Request to take the next claimable proxy of a workspace.
#[derive(Debug, Clone)]
pub struct ProxyClaim {
    pub workspace_id: String,
    /// Id handed out last; the claim prefers higher ids, then wraps around.
    pub after_id: Option<i64>,
    pub lease_id: Uuid,
    pub lease_until: DateTime<Utc>,
}

/// How a lease ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxySettlement {
    /// Back to `available`.
    Release,
    /// Out of rotation until the given instant.
    Fail { until: DateTime<Utc> },
}

/// Result of a successful parser run.
///
/// Immutable once built; the dispatcher produces an augmented copy
/// through [`ParserRunResult::into_parts`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserRunResult {
    items: Vec<JsonObject>,
    metadata: JsonObject,
}

impl ParserRunResult {
    pub fn new(items: Vec<JsonObject>, metadata: JsonObject) -> Self {
        Self { items, metadata }
    }

    pub fn items(&self) -> &[JsonObject] {
        &self.items
    }

    pub fn metadata(&self) -> &JsonObject {
        &self.metadata
    }

    pub fn into_parts(self) -> (Vec<JsonObject>, JsonObject) {
        (self.items, self.metadata)
    }
}
