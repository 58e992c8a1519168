//! Agent configuration
//!
//! All durations are stored in milliseconds so the TOML form stays flat; accessors return
//! [`Duration`]. Missing keys take the production defaults.

use crate::errors::{RaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the failover unit state machine and its background passes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Delay before a new primary's endpoint is published without a reconfiguration reply
    pub max_wait_before_publish_endpoint_ms: u64,
    /// Bound on graceful replica close during node shutdown; `0` disables graceful close
    pub graceful_replica_shutdown_max_duration_ms: u64,
    /// Poll interval of the node shutdown close sweep
    pub graceful_replica_close_completion_check_interval_ms: u64,
    /// Retention of closed, deleted failover units before they are removed
    pub deleted_failover_unit_tombstone_duration_ms: u64,
    /// Period of the tombstone cleanup pass
    pub tombstone_cleanup_interval_ms: u64,
    /// Period of the FM message retry pass
    pub fm_message_retry_interval_ms: u64,
    /// Minimum interval between two FM messages for one replica
    pub per_replica_minimum_interval_between_message_to_fm_ms: u64,
    /// Token refill interval of the node-wide FM message throttle
    pub per_node_minimum_interval_between_message_to_fm_ms: u64,
    /// Burst size of the node-wide FM message throttle
    pub fm_message_throttle_burst: u32,
    /// Resend interval for reconfiguration messages to peers and the replicator
    pub reconfiguration_message_retry_interval_ms: u64,
    /// How long Phase1 waits on up replicas that have not reported progress
    pub remote_replica_progress_query_wait_duration_ms: u64,
    /// Change-role failures before a health warning
    pub replica_change_role_failure_warning_report_threshold: u32,
    /// Change-role failures before the replica is restarted
    pub replica_change_role_failure_restart_threshold: u32,
    /// Open failures before a health warning
    pub replica_open_failure_warning_report_threshold: u32,
    /// Open failures before the replica is dropped
    pub replica_open_failure_max_retry_threshold: u32,
    /// Skip Phase3 when the previous and current configurations hold the same replicas
    pub enable_phase3_phase4_in_parallel: bool,
    /// Use deactivation info during primary election
    pub is_deactivation_info_enabled: bool,
    /// Maximum replicas carried in one ReplicaUp message
    pub max_fm_messages_per_replica_up: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_wait_before_publish_endpoint_ms: 30_000,
            graceful_replica_shutdown_max_duration_ms: 120_000,
            graceful_replica_close_completion_check_interval_ms: 5_000,
            deleted_failover_unit_tombstone_duration_ms: 12 * 60 * 60 * 1_000,
            tombstone_cleanup_interval_ms: 15 * 60 * 1_000,
            fm_message_retry_interval_ms: 30_000,
            per_replica_minimum_interval_between_message_to_fm_ms: 15_000,
            per_node_minimum_interval_between_message_to_fm_ms: 20,
            fm_message_throttle_burst: 100,
            reconfiguration_message_retry_interval_ms: 10_000,
            remote_replica_progress_query_wait_duration_ms: 15_000,
            replica_change_role_failure_warning_report_threshold: 1,
            replica_change_role_failure_restart_threshold: 10,
            replica_open_failure_warning_report_threshold: 1,
            replica_open_failure_max_retry_threshold: 40,
            enable_phase3_phase4_in_parallel: true,
            is_deactivation_info_enabled: true,
            max_fm_messages_per_replica_up: 100,
        }
    }
}

impl FailoverConfig {
    /// Parse a TOML document; absent keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: FailoverConfig = toml::from_str(content)?;
        if let Err(err) = config.validate() {
            tracing::warn!(error = %err, "rejected failover configuration");
            return Err(err);
        }
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to read config file");
            RaError::internal(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "loaded failover configuration");
        Ok(config)
    }

    /// Reject settings the state machine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.fm_message_retry_interval_ms == 0 {
            return Err(RaError::invalid("fm_message_retry_interval_ms must be > 0"));
        }
        if self.reconfiguration_message_retry_interval_ms == 0 {
            return Err(RaError::invalid(
                "reconfiguration_message_retry_interval_ms must be > 0",
            ));
        }
        if self.tombstone_cleanup_interval_ms == 0 {
            return Err(RaError::invalid("tombstone_cleanup_interval_ms must be > 0"));
        }
        if self.fm_message_throttle_burst == 0 {
            return Err(RaError::invalid("fm_message_throttle_burst must be > 0"));
        }
        if self.max_fm_messages_per_replica_up == 0 {
            return Err(RaError::invalid("max_fm_messages_per_replica_up must be > 0"));
        }
        if self.graceful_replica_shutdown_max_duration_ms > 0
            && self.graceful_replica_close_completion_check_interval_ms == 0
        {
            return Err(RaError::invalid(
                "graceful_replica_close_completion_check_interval_ms must be > 0 when graceful close is enabled",
            ));
        }
        if self.replica_change_role_failure_restart_threshold
            < self.replica_change_role_failure_warning_report_threshold
        {
            return Err(RaError::invalid(
                "change role restart threshold must not be below the warning threshold",
            ));
        }
        Ok(())
    }

    /// Endpoint publish delay
    pub fn max_wait_before_publish_endpoint(&self) -> Duration {
        Duration::from_millis(self.max_wait_before_publish_endpoint_ms)
    }

    /// Graceful close bound during node shutdown
    pub fn graceful_replica_shutdown_max_duration(&self) -> Duration {
        Duration::from_millis(self.graceful_replica_shutdown_max_duration_ms)
    }

    /// Poll interval of the node shutdown close sweep
    pub fn graceful_replica_close_completion_check_interval(&self) -> Duration {
        Duration::from_millis(self.graceful_replica_close_completion_check_interval_ms)
    }

    /// Tombstone retention
    pub fn deleted_failover_unit_tombstone_duration(&self) -> Duration {
        Duration::from_millis(self.deleted_failover_unit_tombstone_duration_ms)
    }

    /// Tombstone cleanup period
    pub fn tombstone_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.tombstone_cleanup_interval_ms)
    }

    /// FM message retry period
    pub fn fm_message_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fm_message_retry_interval_ms)
    }

    /// Per-replica FM message pacing
    pub fn per_replica_minimum_interval_between_message_to_fm(&self) -> Duration {
        Duration::from_millis(self.per_replica_minimum_interval_between_message_to_fm_ms)
    }

    /// Node-wide FM message throttle refill interval
    pub fn per_node_minimum_interval_between_message_to_fm(&self) -> Duration {
        Duration::from_millis(self.per_node_minimum_interval_between_message_to_fm_ms)
    }

    /// Reconfiguration message resend interval
    pub fn reconfiguration_message_retry_interval(&self) -> Duration {
        Duration::from_millis(self.reconfiguration_message_retry_interval_ms)
    }

    /// Phase1 wait bound for up replicas
    pub fn remote_replica_progress_query_wait_duration(&self) -> Duration {
        Duration::from_millis(self.remote_replica_progress_query_wait_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_defaults_are_valid() {
        let config = FailoverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_wait_before_publish_endpoint(), Duration::from_secs(30));
        assert_eq!(
            config.deleted_failover_unit_tombstone_duration(),
            Duration::from_secs(12 * 3600)
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = FailoverConfig::from_toml_str(
            "graceful_replica_shutdown_max_duration_ms = 0\nenable_phase3_phase4_in_parallel = false\n",
        )
        .unwrap();
        assert_eq!(config.graceful_replica_shutdown_max_duration(), Duration::ZERO);
        assert!(!config.enable_phase3_phase4_in_parallel);
        assert_eq!(config.replica_open_failure_max_retry_threshold, 40);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = FailoverConfig::from_toml_str("fm_message_throttle_burst = 0").unwrap_err();
        assert!(matches!(err, RaError::Invalid { .. }));

        let err = FailoverConfig::from_toml_str("fm_message_retry_interval_ms = \"soon\"")
            .unwrap_err();
        assert!(matches!(err, RaError::Invalid { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_wait_before_publish_endpoint_ms = 5000").unwrap();
        let config = FailoverConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.max_wait_before_publish_endpoint(), Duration::from_secs(5));

        let missing = FailoverConfig::load_from_file(Path::new("/nonexistent/ra.toml"));
        assert!(missing.is_err());
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn logged_while<F: FnOnce()>(f: F) -> String {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = log.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_load_and_rejection_are_logged() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "fm_message_retry_interval_ms = 1000").unwrap();
        let out = logged_while(|| {
            FailoverConfig::load_from_file(file.path()).unwrap();
        });
        assert!(out.contains("loaded failover configuration"), "{out}");

        let out = logged_while(|| {
            FailoverConfig::from_toml_str("max_fm_messages_per_replica_up = 0").unwrap_err();
        });
        assert!(out.contains("WARN"), "{out}");
        assert!(out.contains("rejected failover configuration"), "{out}");

        let out = logged_while(|| {
            FailoverConfig::load_from_file(Path::new("/nonexistent/ra.toml")).unwrap_err();
        });
        assert!(out.contains("failed to read config file"), "{out}");
    }
}
