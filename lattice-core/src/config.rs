#![forbid(unsafe_code)]

//! Lattice configuration handling. Parses a TOML file into a strongly-typed
//! structure. All tunables of the DHT engine live here; a default instance
//! is suitable for production-sized overlays.

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::DhtError;

/// Primary configuration structure shared across Lattice components.
///
/// Several layers of the network stack may run their own DHT instance, each
/// with its own `service_id`; RPC traffic is dispatched per service id so
/// the instances stay independent over a shared transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Service identifier of this DHT instance.
    pub service_id: String,

    /// Bucket capacity `k` of the routing table.
    pub nodes_per_bucket: usize,

    /// Maximum number of concurrently in-flight discovery requests.
    pub parallelism: usize,

    /// Discovery rounds without improvement before a session completes.
    pub no_progress_limit: u32,

    /// Wall-clock ceiling for one discovery session during a join.
    pub join_timeout_ms: u64,

    /// Capacity of the distance-sorted neighbor list.
    pub max_neighbor_list_size: usize,

    /// Number of contacts returned to closest-peers queries and considered
    /// as next-hop candidates when routing.
    pub closest_contacts_limit: usize,

    /// Number of nodes that should hold a replica of a stored entry.
    pub redundancy_factor: usize,

    /// TTL assigned to entries stored by this node.
    pub store_ttl_ms: u64,

    /// Upper bound applied to TTLs requested by remote storers.
    pub store_max_ttl_ms: u64,

    /// Interval of the background sweep that purges expired entries.
    pub ttl_sweep_interval_ms: u64,

    /// Interval of the periodic routing-table refresh after a join.
    pub table_refresh_interval_ms: u64,

    /// Per-RPC deadline.
    pub rpc_timeout_ms: u64,

    /// Wall-clock ceiling for one recursive operation.
    pub operation_timeout_ms: u64,

    /// Probability that an observed peer is admitted to the random list.
    pub random_contact_probability: f64,

    /// Failed probes tolerated before a contact is removed.
    pub max_contact_failures: u32,

    /// Bounds of the routed-message duplicate detector.
    pub duplicate_detector_max_size: usize,
    pub duplicate_detector_max_age_ms: u64,

    /// Initial and maximum delay of the rejoin backoff.
    pub rejoin_base_delay_ms: u64,
    pub rejoin_max_delay_ms: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            service_id: "layer0".to_string(),
            nodes_per_bucket: 8,
            parallelism: 3,
            no_progress_limit: 4,
            join_timeout_ms: 60_000,
            max_neighbor_list_size: 200,
            closest_contacts_limit: 5,
            redundancy_factor: 5,
            store_ttl_ms: 60_000,
            store_max_ttl_ms: 60_000,
            ttl_sweep_interval_ms: 1_000,
            table_refresh_interval_ms: 60_000,
            rpc_timeout_ms: 10_000,
            operation_timeout_ms: 15_000,
            random_contact_probability: 0.20,
            max_contact_failures: 2,
            duplicate_detector_max_size: 10_000,
            duplicate_detector_max_age_ms: 60_000,
            rejoin_base_delay_ms: 1_000,
            rejoin_max_delay_ms: 60_000,
        }
    }
}

impl DhtConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::DhtResult<Self> {
        let data = fs::read_to_string(&path).map_err(DhtError::from)?;
        let cfg = toml::from_str::<DhtConfig>(&data).map_err(DhtError::ConfigParse)?;
        Ok(cfg)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = DhtConfig::default();
        assert_eq!(cfg.nodes_per_bucket, 8);
        assert_eq!(cfg.parallelism, 3);
        assert!(cfg.redundancy_factor <= cfg.max_neighbor_list_size);
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "service_id = \"layer1\"\nnodes_per_bucket = 16").unwrap();
        let cfg = DhtConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.service_id, "layer1");
        assert_eq!(cfg.nodes_per_bucket, 16);
        // untouched fields keep their defaults
        assert_eq!(cfg.parallelism, 3);
    }

    #[test]
    fn rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nodes_per_bucket = \"not a number\"").unwrap();
        assert!(matches!(DhtConfig::from_file(file.path()), Err(DhtError::ConfigParse(_))));
    }
}
