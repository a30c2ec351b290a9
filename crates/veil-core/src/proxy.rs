//! Per-workspace outbound proxy rotation with failure isolation.
//!
//! # Proxy states
//!
//! ```text
//! AVAILABLE --[claim]--> IN_USE --[release]--> AVAILABLE
//!     ^                    |  |
//!     |                    |  +--[lease expired]--> (claimable again)
//!     |                    +--[mark_failed]--> FAILED
//!     +-----------[cooldown elapsed]-------------+
//! ```
//!
//! The [`ProxyStore`] is the single arbiter: a claim is one atomic store
//! operation, and a release or failure only applies while the caller's
//! lease is still the current one. Worker processes sharing a store
//! therefore never hand out the same proxy twice, and a holder that dies
//! mid-job gives its proxy back when the lease runs out. The pool itself
//! only remembers, per workspace, which id it handed out last so that
//! sequential acquires walk the records round robin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ProxyClaim, ProxyRecord, ProxySettlement};
use crate::traits::ProxyStore;

/// Default upper bound on how long one job may hold a proxy.
pub const DEFAULT_PROXY_LEASE: Duration = Duration::from_secs(15 * 60);

/// How long a failed proxy sits out of rotation, per failure kind.
#[derive(Debug, Clone)]
pub struct CooldownPolicy {
    /// Connection refused/reset, DNS failures and the like.
    pub network: Duration,

    /// Rendering or whole-job timeouts.
    pub timeout: Duration,

    /// Everything else (e.g. a parser reporting a bad proxy explicitly).
    pub default: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            network: Duration::from_secs(300),
            timeout: Duration::from_secs(120),
            default: Duration::from_secs(60),
        }
    }
}

impl CooldownPolicy {
    pub fn uniform(cooldown: Duration) -> Self {
        Self {
            network: cooldown,
            timeout: cooldown,
            default: cooldown,
        }
    }

    pub fn for_error(&self, error: &AppError) -> Duration {
        match error {
            AppError::NetworkError(_) => self.network,
            AppError::RenderTimeout(_) | AppError::Timeout(_) => self.timeout,
            _ => self.default,
        }
    }
}

/// Round-robin allocator over every workspace's proxies.
///
/// Cheap to clone; clones share the same rotation cursors.
#[derive(Clone)]
pub struct ProxyPool {
    store: Arc<dyn ProxyStore>,
    cursors: Arc<Mutex<HashMap<String, i64>>>,
    lease: Duration,
}

impl ProxyPool {
    pub fn new(store: Arc<dyn ProxyStore>) -> Self {
        Self {
            store,
            cursors: Arc::new(Mutex::new(HashMap::new())),
            lease: DEFAULT_PROXY_LEASE,
        }
    }

    /// How long a claim stays valid without being settled. Must outlive
    /// the longest job, or a slow job loses its proxy to another worker.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Claim the next available proxy of `workspace`.
    ///
    /// Never waits: if nothing is claimable, fails with
    /// [`AppError::PoolExhausted`] and leaves retrying to the caller.
    /// Cancel-safe: if the returned future is dropped after the store
    /// committed the claim, the claim is released in the background.
    pub async fn acquire(&self, workspace: &str) -> Result<ProxyRecord, AppError> {
        let claim = ProxyClaim {
            workspace_id: workspace.to_string(),
            after_id: self.cursor(workspace),
            lease_id: Uuid::new_v4(),
            lease_until: Utc::now() + to_delta(self.lease),
        };

        let pending = PendingClaim::arm(&self.store, claim.lease_id);
        let claimed = self.store.claim(&claim).await;
        pending.disarm();

        let record = claimed?.ok_or_else(|| AppError::PoolExhausted(workspace.to_string()))?;
        self.cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(workspace.to_string(), record.id);

        tracing::debug!(%workspace, proxy_id = record.id, proxy = %record.server(), "Proxy acquired");
        Ok(record)
    }

    /// Return a held proxy to the rotation.
    ///
    /// A record whose lease is no longer current is left alone. An `Err`
    /// means the store could not be written; the proxy then stays held
    /// until its lease expires.
    pub async fn release(&self, record: &ProxyRecord) -> Result<(), AppError> {
        if self.settle(record, ProxySettlement::Release).await? {
            tracing::debug!(workspace = %record.workspace_id, proxy_id = record.id, "Proxy released");
        }
        Ok(())
    }

    /// Take a held proxy out of rotation for `cooldown`.
    pub async fn mark_failed(&self, record: &ProxyRecord, cooldown: Duration) -> Result<(), AppError> {
        let until = Utc::now() + to_delta(cooldown);
        if self.settle(record, ProxySettlement::Fail { until }).await? {
            tracing::warn!(
                workspace = %record.workspace_id,
                proxy_id = record.id,
                cooldown_secs = cooldown.as_secs(),
                "Proxy marked failed"
            );
        }
        Ok(())
    }

    /// The workspace's active records as the store currently sees them.
    pub async fn snapshot(&self, workspace: &str) -> Result<Vec<ProxyRecord>, AppError> {
        self.store.load_proxies(workspace).await
    }

    fn cursor(&self, workspace: &str) -> Option<i64> {
        self.cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(workspace)
            .copied()
    }

    async fn settle(&self, record: &ProxyRecord, settlement: ProxySettlement) -> Result<bool, AppError> {
        let lease_id = record.lease_id.ok_or_else(|| {
            AppError::ValidationError(format!("Proxy {} was not acquired from a pool", record.id))
        })?;

        match self.store.settle(lease_id, settlement).await? {
            Some(_) => Ok(true),
            None => {
                tracing::warn!(
                    workspace = %record.workspace_id,
                    proxy_id = record.id,
                    %lease_id,
                    "Lease no longer current; transition ignored"
                );
                Ok(false)
            }
        }
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::days(365))
}

/// Gives back a claim whose `acquire` was dropped before returning it.
struct PendingClaim {
    store: Option<Arc<dyn ProxyStore>>,
    lease_id: Uuid,
}

impl PendingClaim {
    fn arm(store: &Arc<dyn ProxyStore>, lease_id: Uuid) -> Self {
        Self {
            store: Some(Arc::clone(store)),
            lease_id,
        }
    }

    fn disarm(mut self) {
        self.store = None;
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let lease_id = self.lease_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match store.settle(lease_id, ProxySettlement::Release).await {
                        Ok(Some(record)) => tracing::info!(
                            workspace = %record.workspace_id,
                            proxy_id = record.id,
                            "Released proxy claimed by a cancelled acquire"
                        ),
                        Ok(None) => {}
                        Err(e) => tracing::warn!(
                            %lease_id,
                            error = %e,
                            "Failed to release abandoned claim; it frees up when the lease expires"
                        ),
                    }
                });
            }
            Err(_) => {
                tracing::warn!(%lease_id, "Claim abandoned outside a runtime; it frees up when the lease expires");
            }
        }
    }
}
