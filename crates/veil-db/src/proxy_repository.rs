use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;
use veil_core::error::AppError;
use veil_core::models::{
    ProxyClaim, ProxyCredentials, ProxyHealth, ProxyProtocol, ProxyRecord, ProxySettlement,
};
use veil_core::traits::ProxyStore;

/// A proxy to add to a workspace.
#[derive(Debug, Clone)]
pub struct NewProxy {
    pub workspace_id: String,
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub credentials: Option<ProxyCredentials>,
}

impl NewProxy {
    pub fn new(workspace_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            host: host.into(),
            port,
            protocol: ProxyProtocol::Socks5,
            credentials: None,
        }
    }

    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = protocol;
        self
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
}

/// Repository for workspace proxies and their health.
///
/// Health transitions go through [`claim`](Self::claim) and
/// [`settle`](Self::settle) only. A claim locks one claimable row with
/// `FOR UPDATE SKIP LOCKED` and stamps it with the caller's lease; a
/// settle applies only while that lease is still on the row.
#[derive(Clone)]
pub struct ProxyRepository {
    pool: Pool<Postgres>,
}

const PROXY_COLUMNS: &str = "id, workspace_id, host, port, username, password, protocol, \
    health, failed_until, is_active, lease_id, lease_until";

impl ProxyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a proxy; it starts out available.
    pub async fn add(&self, proxy: &NewProxy) -> Result<ProxyRecord, AppError> {
        let (username, password) = match &proxy.credentials {
            Some(c) => (Some(c.username.as_str()), Some(c.password.as_str())),
            None => (None, None),
        };

        let row = sqlx::query_as::<_, ProxyRow>(&format!(
            r#"
            INSERT INTO workspace_proxies (workspace_id, host, port, username, password, protocol)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {PROXY_COLUMNS}
            "#
        ))
        .bind(&proxy.workspace_id)
        .bind(&proxy.host)
        .bind(i32::from(proxy.port))
        .bind(username)
        .bind(password)
        .bind(proxy.protocol.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.try_into()
    }

    /// Active proxies of a workspace in rotation order (insertion order).
    pub async fn list(&self, workspace: &str) -> Result<Vec<ProxyRecord>, AppError> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {PROXY_COLUMNS} FROM workspace_proxies \
             WHERE workspace_id = $1 AND is_active ORDER BY id"
        ))
        .bind(workspace)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Every proxy of a workspace, deactivated ones included.
    pub async fn list_all(&self, workspace: &str) -> Result<Vec<ProxyRecord>, AppError> {
        let rows = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {PROXY_COLUMNS} FROM workspace_proxies WHERE workspace_id = $1 ORDER BY id"
        ))
        .bind(workspace)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Take a proxy in or out of rotation. A held proxy stays with its
    /// holder until settled. Returns `true` if the proxy exists.
    pub async fn set_active(&self, id: i64, active: bool) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE workspace_proxies SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Lease the first claimable proxy after `claim.after_id`, wrapping
    /// around to the lowest id. Rows locked by a concurrent claim are
    /// skipped rather than waited on.
    pub async fn claim(&self, claim: &ProxyClaim) -> Result<Option<ProxyRecord>, AppError> {
        let row = sqlx::query_as::<_, ProxyRow>(&format!(
            r#"
            UPDATE workspace_proxies
            SET health = 'in_use', failed_until = NULL,
                lease_id = $2, lease_until = $3, updated_at = NOW()
            WHERE id = (
                SELECT id FROM workspace_proxies
                WHERE workspace_id = $1
                  AND is_active
                  AND (health = 'available'
                       OR (health = 'failed' AND (failed_until IS NULL OR failed_until <= NOW()))
                       OR (health = 'in_use' AND (lease_until IS NULL OR lease_until <= NOW())))
                ORDER BY (id <= $4), id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {PROXY_COLUMNS}
            "#
        ))
        .bind(&claim.workspace_id)
        .bind(claim.lease_id)
        .bind(claim.lease_until)
        .bind(claim.after_id.unwrap_or(0))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(TryInto::try_into).transpose()
    }

    /// End the lease `lease_id`. `None` if it is no longer on any row.
    pub async fn settle(
        &self,
        lease_id: Uuid,
        settlement: ProxySettlement,
    ) -> Result<Option<ProxyRecord>, AppError> {
        let (health, failed_until) = match settlement {
            ProxySettlement::Release => (ProxyHealth::Available, None),
            ProxySettlement::Fail { until } => (ProxyHealth::Failed, Some(until)),
        };

        let row = sqlx::query_as::<_, ProxyRow>(&format!(
            r#"
            UPDATE workspace_proxies
            SET health = $2, failed_until = $3,
                lease_id = NULL, lease_until = NULL, updated_at = NOW()
            WHERE lease_id = $1 AND health = 'in_use'
            RETURNING {PROXY_COLUMNS}
            "#
        ))
        .bind(lease_id)
        .bind(health.as_str())
        .bind(failed_until)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(TryInto::try_into).transpose()
    }

    /// Remove a proxy. Returns `true` if it existed.
    pub async fn remove(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM workspace_proxies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ProxyRow {
    id: i64,
    workspace_id: String,
    host: String,
    port: i32,
    username: Option<String>,
    password: Option<String>,
    protocol: String,
    health: String,
    failed_until: Option<DateTime<Utc>>,
    is_active: bool,
    lease_id: Option<Uuid>,
    lease_until: Option<DateTime<Utc>>,
}

impl TryFrom<ProxyRow> for ProxyRecord {
    type Error = AppError;

    fn try_from(row: ProxyRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port).map_err(|_| {
            AppError::DatabaseError(format!("Proxy {} has invalid port {}", row.id, row.port))
        })?;
        let protocol: ProxyProtocol = row.protocol.parse().map_err(AppError::DatabaseError)?;
        let health: ProxyHealth = row.health.parse().map_err(AppError::DatabaseError)?;
        let credentials = match (row.username, row.password) {
            (Some(username), Some(password)) => Some(ProxyCredentials { username, password }),
            _ => None,
        };

        Ok(ProxyRecord {
            id: row.id,
            workspace_id: row.workspace_id,
            host: row.host,
            port,
            credentials,
            protocol,
            health,
            failed_until: row.failed_until,
            is_active: row.is_active,
            lease_id: row.lease_id,
            lease_until: row.lease_until,
        })
    }
}

// -- Trait implementation --

#[async_trait]
impl ProxyStore for ProxyRepository {
    async fn load_proxies(&self, workspace: &str) -> Result<Vec<ProxyRecord>, AppError> {
        self.list(workspace).await
    }

    async fn claim(&self, claim: &ProxyClaim) -> Result<Option<ProxyRecord>, AppError> {
        ProxyRepository::claim(self, claim).await
    }

    async fn settle(
        &self,
        lease_id: Uuid,
        settlement: ProxySettlement,
    ) -> Result<Option<ProxyRecord>, AppError> {
        ProxyRepository::settle(self, lease_id, settlement).await
    }
}
