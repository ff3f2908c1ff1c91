use crate::store::RetryPolicy;

use serde::Deserialize;

use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings: where the database lives and how patient writers are.
/// Everything that dimensions a graph lives in
/// [`ChunkedGraphMeta`](crate::ChunkedGraphMeta) instead and never changes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub db_path: PathBuf,
    /// Sled page-cache size in bytes.
    pub cache_capacity: u64,
    /// A lease older than this is dead and may be taken over.
    pub lock_expiry: Duration,
    /// Attempts to acquire all leases of an edit before giving up.
    pub lock_max_tries: u32,
    /// Pause between acquisition attempts.
    pub lock_backoff: Duration,
    pub read_only: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("chunkedgraph-db"),
            cache_capacity: 512 * 1024 * 1024,
            lock_expiry: Duration::from_secs(60),
            lock_max_tries: 20,
            lock_backoff: Duration::from_millis(500),
            read_only: false,
        }
    }
}

impl RuntimeConfig {
    pub fn read_file(path: &str) -> Result<Self, ron::Error> {
        let reader = std::fs::File::open(path)?;

        ron::de::from_reader(reader)
    }

    /// Storage retries stop once they would outlive the lease.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            budget: self.lock_expiry,
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert!(config.lock_expiry > config.lock_backoff);
        assert!(!config.read_only);
    }

    #[test]
    fn partial_ron_files_fill_in_defaults() {
        let parsed: RuntimeConfig =
            ron::de::from_str(r#"(lock_max_tries: 3, read_only: true)"#).unwrap();
        assert_eq!(parsed.lock_max_tries, 3);
        assert!(parsed.read_only);
        assert_eq!(parsed.lock_expiry, Duration::from_secs(60));
    }
}
