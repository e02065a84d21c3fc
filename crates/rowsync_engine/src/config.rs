//! Configuration for the sync engine.

use rowsync_protocol::{ConflictResolutionPolicy, JSON_SERIALIZER_KEY};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Options shared by the local and remote orchestrators.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Root directory for per-session batch directories.
    pub batch_directory: PathBuf,
    /// Root directory for snapshots. Snapshots are disabled when `None`.
    pub snapshots_directory: Option<PathBuf>,
    /// Part size threshold in kilobytes. 0 disables splitting.
    pub batch_size_kb: u64,
    /// Policy applied to update/update conflicts.
    pub conflict_resolution_policy: ConflictResolutionPolicy,
    /// Disable constraints while applying changes.
    pub disable_constraints_on_apply_changes: bool,
    /// Purge tombstones after a successful apply.
    pub clean_metadatas: bool,
    /// Delete consumed batch directories at the end of a session.
    pub clean_folder: bool,
    /// Name of the scope info table.
    pub scope_info_table_name: String,
    /// Serializer key for batch parts.
    pub serializer: String,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncOptions {
    /// Creates options writing batches under the given directory.
    pub fn new(batch_directory: impl Into<PathBuf>) -> Self {
        Self {
            batch_directory: batch_directory.into(),
            snapshots_directory: None,
            batch_size_kb: 5000,
            conflict_resolution_policy: ConflictResolutionPolicy::ServerWins,
            disable_constraints_on_apply_changes: false,
            clean_metadatas: true,
            clean_folder: true,
            scope_info_table_name: "scope_info".to_string(),
            serializer: JSON_SERIALIZER_KEY.to_string(),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the snapshots directory.
    pub fn with_snapshots_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.snapshots_directory = Some(directory.into());
        self
    }

    /// Sets the part size threshold.
    pub fn with_batch_size_kb(mut self, batch_size_kb: u64) -> Self {
        self.batch_size_kb = batch_size_kb;
        self
    }

    /// Sets the conflict resolution policy.
    pub fn with_conflict_resolution_policy(mut self, policy: ConflictResolutionPolicy) -> Self {
        self.conflict_resolution_policy = policy;
        self
    }

    /// Disables constraints while applying changes.
    pub fn with_disable_constraints(mut self, disable: bool) -> Self {
        self.disable_constraints_on_apply_changes = disable;
        self
    }

    /// Enables or disables tombstone cleanup after apply.
    pub fn with_clean_metadatas(mut self, clean: bool) -> Self {
        self.clean_metadatas = clean;
        self
    }

    /// Enables or disables batch directory cleanup.
    pub fn with_clean_folder(mut self, clean: bool) -> Self {
        self.clean_folder = clean;
        self
    }

    /// Sets the scope info table name.
    pub fn with_scope_info_table_name(mut self, name: impl Into<String>) -> Self {
        self.scope_info_table_name = name.into();
        self
    }

    /// Sets the serializer key.
    pub fn with_serializer(mut self, serializer: impl Into<String>) -> Self {
        self.serializer = serializer.into();
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("rowsync").join("batches"))
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns the delay before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            Duration::from_secs_f64(capped + capped * 0.25 * jitter_fraction())
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Returns a fraction in `[0, 1)` from the random bits of a v4 uuid.
fn jitter_fraction() -> f64 {
    let bits = Uuid::new_v4().as_u128() as u32;
    f64::from(bits % 1000) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_builder() {
        let options = SyncOptions::new("/tmp/batches")
            .with_batch_size_kb(1)
            .with_snapshots_directory("/tmp/snapshots")
            .with_conflict_resolution_policy(ConflictResolutionPolicy::ClientWins)
            .with_clean_folder(false)
            .with_serializer("cbor");

        assert_eq!(options.batch_directory, PathBuf::from("/tmp/batches"));
        assert_eq!(options.batch_size_kb, 1);
        assert_eq!(
            options.snapshots_directory,
            Some(PathBuf::from("/tmp/snapshots"))
        );
        assert_eq!(
            options.conflict_resolution_policy,
            ConflictResolutionPolicy::ClientWins
        );
        assert!(!options.clean_folder);
        assert!(options.clean_metadatas);
        assert_eq!(options.serializer, "cbor");
        assert_eq!(options.scope_info_table_name, "scope_info");
    }

    #[test]
    fn default_batch_size() {
        assert_eq!(SyncOptions::default().batch_size_kb, 5000);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
