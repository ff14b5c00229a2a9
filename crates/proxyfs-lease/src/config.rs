//! Lease manager configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunable parameters of the lease manager.
///
/// Durations are carried in milliseconds. A grant younger than
/// `min_lease_duration_ms` is immune from revocation; revocation latency is
/// bounded by `lease_interrupt_interval_ms * lease_interrupt_limit`; the
/// evict limits bound the number of live leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Minimum useful lifetime of a grant before it may be revoked.
    pub min_lease_duration_ms: u64,
    /// Delay between interrupt retransmissions to an unresponsive holder.
    pub lease_interrupt_interval_ms: u64,
    /// Retransmission attempts before a holder is declared dead.
    pub lease_interrupt_limit: u32,
    /// Eviction stops once the live lease count reaches this.
    pub lease_evict_low_limit: usize,
    /// Eviction starts once the live lease count exceeds this.
    pub lease_evict_high_limit: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            min_lease_duration_ms: 250,
            lease_interrupt_interval_ms: 250,
            lease_interrupt_limit: 20,
            lease_evict_low_limit: 100_000,
            lease_evict_high_limit: 100_010,
        }
    }
}

impl LeaseConfig {
    /// Loads a config from a TOML or JSON file, keyed by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: LeaseConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency of the parameters.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease_interrupt_limit == 0 {
            anyhow::bail!("lease_interrupt_limit must be nonzero");
        }
        if self.lease_interrupt_interval_ms == 0 {
            anyhow::bail!("lease_interrupt_interval_ms must be nonzero");
        }
        if self.lease_evict_high_limit < self.lease_evict_low_limit {
            anyhow::bail!(
                "lease_evict_high_limit ({}) below lease_evict_low_limit ({})",
                self.lease_evict_high_limit,
                self.lease_evict_low_limit
            );
        }
        Ok(())
    }

    /// Minimum grant lifetime as a `Duration`.
    pub fn min_lease_duration(&self) -> Duration {
        Duration::from_millis(self.min_lease_duration_ms)
    }

    /// Interrupt retransmission interval as a `Duration`.
    pub fn lease_interrupt_interval(&self) -> Duration {
        Duration::from_millis(self.lease_interrupt_interval_ms)
    }
}
