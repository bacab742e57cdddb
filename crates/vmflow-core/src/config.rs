// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! The configuration is built once at startup and handed to every task through
//! the workflow context. Nothing reads service locations from global state.

use std::time::Duration;

/// Default per-request HTTP timeout, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Service locations and tunables shared by every job in the process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Compute-node API (agent task dispatch, tickets)
    pub cnapi_url: String,
    /// VM inventory and migration record service
    pub vmapi_url: String,
    /// Network service
    pub napi_url: String,
    /// Placement/allocation service
    pub allocator_url: String,
    /// Job service (used to cancel running jobs)
    pub jobs_url: String,
    /// Interval between polls of agent tasks, tickets and VM state
    pub task_poll_interval: Duration,
    /// Lifetime requested for waitlist tickets
    pub ticket_expiry: Duration,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Capacity of the detached progress notification queue
    pub notify_queue_size: usize,
    /// How long to wait for a cn-agent migration process to honour `stop`
    pub sync_stop_timeout: Duration,
    /// How often a running sync writes its progress to the migration record
    pub sync_progress_interval: Duration,
    /// Fabric NAT settings; `None` disables on-demand NAT provisioning
    pub fabric_nat: Option<FabricNatConfig>,
}

/// Settings for provisioning fabric NAT gateway instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricNatConfig {
    /// Network pool that NAT instances take their external address from
    pub nat_pool: String,
    /// Image used for NAT instances
    pub image_uuid: String,
    /// Package (billing id) used for NAT instances
    pub billing_id: String,
}

impl Config {
    /// Create a configuration with default tunables.
    pub fn new(
        cnapi_url: impl Into<String>,
        vmapi_url: impl Into<String>,
        napi_url: impl Into<String>,
    ) -> Self {
        let cnapi_url = cnapi_url.into();
        let vmapi_url = vmapi_url.into();
        Self {
            allocator_url: cnapi_url.clone(),
            jobs_url: vmapi_url.clone(),
            cnapi_url,
            vmapi_url,
            napi_url: napi_url.into(),
            task_poll_interval: Duration::from_millis(1_000),
            ticket_expiry: Duration::from_secs(600),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            notify_queue_size: 128,
            sync_stop_timeout: Duration::from_millis(5_000),
            sync_progress_interval: Duration::from_secs(10),
            fabric_nat: None,
        }
    }

    /// Set the allocator URL.
    pub fn with_allocator_url(mut self, url: impl Into<String>) -> Self {
        self.allocator_url = url.into();
        self
    }

    /// Set the job service URL.
    pub fn with_jobs_url(mut self, url: impl Into<String>) -> Self {
        self.jobs_url = url.into();
        self
    }

    /// Set the poll interval used by wait tasks.
    pub fn with_task_poll_interval(mut self, interval: Duration) -> Self {
        self.task_poll_interval = interval;
        self
    }

    /// Set the ticket expiry.
    pub fn with_ticket_expiry(mut self, expiry: Duration) -> Self {
        self.ticket_expiry = expiry;
        self
    }

    /// Set the sync process stop timeout.
    pub fn with_sync_stop_timeout(mut self, timeout: Duration) -> Self {
        self.sync_stop_timeout = timeout;
        self
    }

    /// Set how often sync progress is persisted.
    pub fn with_sync_progress_interval(mut self, interval: Duration) -> Self {
        self.sync_progress_interval = interval;
        self
    }

    /// Enable fabric NAT provisioning.
    pub fn with_fabric_nat(mut self, fabric_nat: FabricNatConfig) -> Self {
        self.fabric_nat = Some(fabric_nat);
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `VMFLOW_CNAPI_URL`, `VMFLOW_VMAPI_URL`, `VMFLOW_NAPI_URL`
    ///
    /// Optional (with defaults):
    /// - `VMFLOW_ALLOCATOR_URL` (default: the CNAPI URL)
    /// - `VMFLOW_JOBS_URL` (default: the VMAPI URL)
    /// - `VMFLOW_TASK_POLL_INTERVAL_MS` (default: 1000)
    /// - `VMFLOW_TICKET_EXPIRY_SECS` (default: 600)
    /// - `VMFLOW_REQUEST_TIMEOUT_MS` (default: 30000)
    /// - `VMFLOW_NOTIFY_QUEUE_SIZE` (default: 128)
    /// - `VMFLOW_SYNC_STOP_TIMEOUT_MS` (default: 5000)
    /// - `VMFLOW_SYNC_PROGRESS_INTERVAL_SECS` (default: 10)
    /// - `VMFLOW_NAT_POOL`, `VMFLOW_NAT_IMAGE`, `VMFLOW_NAT_BILLING_ID`
    ///   (all three or none)
    pub fn from_env() -> Result<Self, ConfigError> {
        let cnapi_url = required("VMFLOW_CNAPI_URL")?;
        let vmapi_url = required("VMFLOW_VMAPI_URL")?;
        let napi_url = required("VMFLOW_NAPI_URL")?;

        let allocator_url = std::env::var("VMFLOW_ALLOCATOR_URL").unwrap_or(cnapi_url.clone());
        let jobs_url = std::env::var("VMFLOW_JOBS_URL").unwrap_or(vmapi_url.clone());

        let task_poll_interval = Duration::from_millis(parse_or(
            "VMFLOW_TASK_POLL_INTERVAL_MS",
            1_000,
            "must be a positive integer",
        )?);
        let ticket_expiry = Duration::from_secs(parse_or(
            "VMFLOW_TICKET_EXPIRY_SECS",
            600,
            "must be a positive integer",
        )?);
        let request_timeout = Duration::from_millis(parse_or(
            "VMFLOW_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
            "must be a positive integer",
        )?);
        let notify_queue_size = parse_or(
            "VMFLOW_NOTIFY_QUEUE_SIZE",
            128,
            "must be a positive integer",
        )? as usize;
        if notify_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "VMFLOW_NOTIFY_QUEUE_SIZE",
                "must be greater than zero",
            ));
        }
        let sync_stop_timeout = Duration::from_millis(parse_or(
            "VMFLOW_SYNC_STOP_TIMEOUT_MS",
            5_000,
            "must be a positive integer",
        )?);
        let sync_progress_interval = Duration::from_secs(parse_or(
            "VMFLOW_SYNC_PROGRESS_INTERVAL_SECS",
            10,
            "must be a positive integer",
        )?);
        if sync_progress_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "VMFLOW_SYNC_PROGRESS_INTERVAL_SECS",
                "must be greater than zero",
            ));
        }

        let fabric_nat = match (
            std::env::var("VMFLOW_NAT_POOL").ok(),
            std::env::var("VMFLOW_NAT_IMAGE").ok(),
            std::env::var("VMFLOW_NAT_BILLING_ID").ok(),
        ) {
            (Some(nat_pool), Some(image_uuid), Some(billing_id)) => Some(FabricNatConfig {
                nat_pool,
                image_uuid,
                billing_id,
            }),
            (None, None, None) => None,
            _ => {
                return Err(ConfigError::Invalid(
                    "VMFLOW_NAT_POOL",
                    "VMFLOW_NAT_POOL, VMFLOW_NAT_IMAGE and VMFLOW_NAT_BILLING_ID must be set together",
                ));
            }
        };

        Ok(Self {
            cnapi_url,
            vmapi_url,
            napi_url,
            allocator_url,
            jobs_url,
            task_poll_interval,
            ticket_expiry,
            request_timeout,
            notify_queue_size,
            sync_stop_timeout,
            sync_progress_interval,
            fabric_nat,
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parse_or(key: &'static str, default: u64, reason: &'static str) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "VMFLOW_CNAPI_URL",
        "VMFLOW_VMAPI_URL",
        "VMFLOW_NAPI_URL",
        "VMFLOW_ALLOCATOR_URL",
        "VMFLOW_JOBS_URL",
        "VMFLOW_TASK_POLL_INTERVAL_MS",
        "VMFLOW_TICKET_EXPIRY_SECS",
        "VMFLOW_REQUEST_TIMEOUT_MS",
        "VMFLOW_NOTIFY_QUEUE_SIZE",
        "VMFLOW_SYNC_STOP_TIMEOUT_MS",
        "VMFLOW_SYNC_PROGRESS_INTERVAL_SECS",
        "VMFLOW_NAT_POOL",
        "VMFLOW_NAT_IMAGE",
        "VMFLOW_NAT_BILLING_ID",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn set_required(&mut self) {
            self.set("VMFLOW_CNAPI_URL", "http://cnapi.local");
            self.set("VMFLOW_VMAPI_URL", "http://vmapi.local");
            self.set("VMFLOW_NAPI_URL", "http://napi.local");
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set_required();

        let config = Config::from_env().unwrap();

        assert_eq!(config.cnapi_url, "http://cnapi.local");
        assert_eq!(config.allocator_url, "http://cnapi.local");
        assert_eq!(config.jobs_url, "http://vmapi.local");
        assert_eq!(config.task_poll_interval, Duration::from_millis(1_000));
        assert_eq!(config.ticket_expiry, Duration::from_secs(600));
        assert_eq!(config.notify_queue_size, 128);
        assert_eq!(config.sync_progress_interval, Duration::from_secs(10));
        assert!(config.fabric_nat.is_none());
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set_required();
        guard.set("VMFLOW_ALLOCATOR_URL", "http://cnapi.local:8080");
        guard.set("VMFLOW_TASK_POLL_INTERVAL_MS", "250");
        guard.set("VMFLOW_TICKET_EXPIRY_SECS", "60");
        guard.set("VMFLOW_NAT_POOL", "pool-1");
        guard.set("VMFLOW_NAT_IMAGE", "image-1");
        guard.set("VMFLOW_NAT_BILLING_ID", "pkg-1");

        let config = Config::from_env().unwrap();

        assert_eq!(config.allocator_url, "http://cnapi.local:8080");
        assert_eq!(config.task_poll_interval, Duration::from_millis(250));
        assert_eq!(config.ticket_expiry, Duration::from_secs(60));
        assert_eq!(
            config.fabric_nat,
            Some(FabricNatConfig {
                nat_pool: "pool-1".to_string(),
                image_uuid: "image-1".to_string(),
                billing_id: "pkg-1".to_string(),
            })
        );
    }

    #[test]
    fn test_config_missing_cnapi_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("VMFLOW_VMAPI_URL", "http://vmapi.local");
        guard.set("VMFLOW_NAPI_URL", "http://napi.local");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("VMFLOW_CNAPI_URL")));
        assert!(err.to_string().contains("VMFLOW_CNAPI_URL"));
    }

    #[test]
    fn test_config_invalid_poll_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set_required();
        guard.set("VMFLOW_TASK_POLL_INTERVAL_MS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("VMFLOW_TASK_POLL_INTERVAL_MS", _)
        ));
    }

    #[test]
    fn test_config_zero_queue_size_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set_required();
        guard.set("VMFLOW_NOTIFY_QUEUE_SIZE", "0");

        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_config_zero_sync_progress_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set_required();
        guard.set("VMFLOW_SYNC_PROGRESS_INTERVAL_SECS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("VMFLOW_SYNC_PROGRESS_INTERVAL_SECS", _)
        ));
    }

    #[test]
    fn test_config_partial_nat_settings_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set_required();
        guard.set("VMFLOW_NAT_POOL", "pool-1");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("VMFLOW_NAT_POOL", _)));
    }

    #[test]
    fn test_config_builder_chain() {
        let config = Config::new("http://c", "http://v", "http://n")
            .with_jobs_url("http://wf")
            .with_task_poll_interval(Duration::from_millis(5))
            .with_ticket_expiry(Duration::from_secs(30));

        assert_eq!(config.jobs_url, "http://wf");
        assert_eq!(config.allocator_url, "http://c");
        assert_eq!(config.task_poll_interval, Duration::from_millis(5));
        assert_eq!(config.ticket_expiry, Duration::from_secs(30));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
