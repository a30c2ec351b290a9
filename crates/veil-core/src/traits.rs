use std::future::Future;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ParserConfig, ProxyClaim, ProxyRecord, ProxySettlement};

/// Read access to parser configuration snapshots.
pub trait ConfigStore: Send + Sync + Clone {
    /// Load the configuration for a (workspace, source) pair.
    ///
    /// Returns `None` when no configuration is stored.
    fn load_config(
        &self,
        workspace: &str,
        source: &str,
    ) -> impl Future<Output = Result<Option<ParserConfig>, AppError>> + Send;
}

/// Shared proxy state, the arbiter of which job holds which proxy.
///
/// Every worker process goes through the same store, so a claim must be
/// atomic against all of them: two concurrent claims never return the same
/// record. Settling is conditional on the lease, so a stale holder can
/// never overwrite the state written by a newer one.
///
/// Object-safe so the proxy pool can hold it behind an `Arc<dyn _>`
/// without leaking a type parameter into every parser's run context.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Active proxies of a workspace, in rotation order (by id).
    async fn load_proxies(&self, workspace: &str) -> Result<Vec<ProxyRecord>, AppError>;

    /// Mark the next claimable record `in_use` under the claim's lease.
    ///
    /// Records with an id above `after_id` come first, then the scan wraps
    /// to the lowest id. `None` when nothing is claimable.
    async fn claim(&self, claim: &ProxyClaim) -> Result<Option<ProxyRecord>, AppError>;

    /// End the lease `lease_id`. `None` when no record is held under it any
    /// more (already settled, or the lease expired and was re-claimed).
    async fn settle(
        &self,
        lease_id: Uuid,
        settlement: ProxySettlement,
    ) -> Result<Option<ProxyRecord>, AppError>;
}
