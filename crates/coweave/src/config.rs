//! Node configuration.

use coweave_sync::LoadConfig;

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Upper bound on one storage transaction-range request.
    pub max_transactions_per_load: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_transactions_per_load: 10_000,
        }
    }
}

/// Configuration for a [`LocalNode`](crate::LocalNode) and its pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeConfig {
    /// Peer load timeouts and retry policy.
    pub load: LoadConfig,
    /// Reconciliation pipeline settings.
    pub pipeline: PipelineConfig,
}
