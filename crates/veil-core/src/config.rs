use std::time::Duration;

use crate::error::AppError;
use crate::proxy::{CooldownPolicy, DEFAULT_PROXY_LEASE};

/// Runtime limits applied by the dispatcher to every job.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound for a whole `parse` call.
    pub job_timeout: Duration,

    /// Upper bound for opening a single rendered page.
    pub render_timeout: Duration,

    pub cooldown: CooldownPolicy,

    /// How long a claimed proxy stays reserved without being settled.
    /// Always longer than `job_timeout`.
    pub proxy_lease: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            render_timeout: Duration::from_secs(30),
            cooldown: CooldownPolicy::default(),
            proxy_lease: DEFAULT_PROXY_LEASE,
        }
    }
}

impl DispatcherConfig {
    /// Read configuration from environment variables, falling back to the
    /// defaults for anything unset.
    ///
    /// - `VEIL_JOB_TIMEOUT_SECS`
    /// - `VEIL_RENDER_TIMEOUT_SECS`
    /// - `VEIL_PROXY_COOLDOWN_SECS` (default cooldown)
    /// - `VEIL_PROXY_NETWORK_COOLDOWN_SECS`
    /// - `VEIL_PROXY_TIMEOUT_COOLDOWN_SECS`
    /// - `VEIL_PROXY_LEASE_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| -> Result<Duration, AppError> {
            match lookup(key) {
                None => Ok(fallback),
                Some(raw) => {
                    let parsed: u64 = raw.trim().parse().map_err(|_| {
                        AppError::ConfigError(format!(
                            "Invalid {key} '{raw}': must be a non-negative integer"
                        ))
                    })?;
                    Ok(Duration::from_secs(parsed))
                }
            }
        };

        let job_timeout = secs("VEIL_JOB_TIMEOUT_SECS", defaults.job_timeout)?;
        if job_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "VEIL_JOB_TIMEOUT_SECS must be at least 1".into(),
            ));
        }

        let proxy_lease = secs("VEIL_PROXY_LEASE_SECS", defaults.proxy_lease)?;
        if proxy_lease <= job_timeout {
            return Err(AppError::ConfigError(format!(
                "VEIL_PROXY_LEASE_SECS ({}) must exceed the job timeout ({})",
                proxy_lease.as_secs(),
                job_timeout.as_secs()
            )));
        }

        Ok(Self {
            job_timeout,
            proxy_lease,
            render_timeout: secs("VEIL_RENDER_TIMEOUT_SECS", defaults.render_timeout)?,
            cooldown: CooldownPolicy {
                default: secs("VEIL_PROXY_COOLDOWN_SECS", defaults.cooldown.default)?,
                network: secs("VEIL_PROXY_NETWORK_COOLDOWN_SECS", defaults.cooldown.network)?,
                timeout: secs("VEIL_PROXY_TIMEOUT_COOLDOWN_SECS", defaults.cooldown.timeout)?,
            },
        })
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn with_cooldown(mut self, cooldown: CooldownPolicy) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_variables_use_defaults() {
        let config = DispatcherConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert_eq!(config.render_timeout, Duration::from_secs(30));
    }

    #[test]
    fn variables_override_defaults() {
        let config = DispatcherConfig::from_lookup(lookup(&[
            ("VEIL_JOB_TIMEOUT_SECS", "60"),
            ("VEIL_PROXY_NETWORK_COOLDOWN_SECS", "900"),
        ]))
        .unwrap();
        assert_eq!(config.job_timeout, Duration::from_secs(60));
        assert_eq!(config.cooldown.network, Duration::from_secs(900));
        assert_eq!(config.cooldown.default, Duration::from_secs(60));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = DispatcherConfig::from_lookup(lookup(&[("VEIL_RENDER_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));

        let err = DispatcherConfig::from_lookup(lookup(&[("VEIL_JOB_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn proxy_lease_must_outlive_the_job() {
        let config = DispatcherConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.proxy_lease, Duration::from_secs(900));

        let err = DispatcherConfig::from_lookup(lookup(&[
            ("VEIL_JOB_TIMEOUT_SECS", "600"),
            ("VEIL_PROXY_LEASE_SECS", "600"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(ref m) if m.contains("VEIL_PROXY_LEASE_SECS")));

        let config = DispatcherConfig::from_lookup(lookup(&[
            ("VEIL_JOB_TIMEOUT_SECS", "600"),
            ("VEIL_PROXY_LEASE_SECS", "1800"),
        ]))
        .unwrap();
        assert_eq!(config.proxy_lease, Duration::from_secs(1800));
    }
}
