use std::time::Duration;

use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};

use crate::{
    constants::TYPING_PROGRAM_ID,
    delegation::DelegationConfig,
    pipeline::{PipelineConfig, RereadMode},
    rpc::{ConnectionManager, LayerEndpointConfig, ReconnectConfig, RetryConfig, SolanaLayerRpc},
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base: LayerEndpointConfig,
    pub rollup: LayerEndpointConfig,
    pub program_id: Pubkey,
    /// Validator the session is pinned to on `delegate`.
    pub rollup_validator: Option<Pubkey>,
    pub commitment: CommitmentConfig,
    pub confirm_timeout: Duration,
    pub confirm_poll_interval: Duration,
    pub skip_preflight: bool,
    pub reread: RereadMode,
    pub propagation_delay: Duration,
    pub confirm_probe_attempts: u32,
    pub retry: RetryConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        let delegation = DelegationConfig::default();
        Self {
            base: LayerEndpointConfig::base_devnet(),
            rollup: LayerEndpointConfig::rollup_devnet(),
            program_id: TYPING_PROGRAM_ID,
            rollup_validator: pipeline.rollup_validator,
            commitment: pipeline.commitment,
            confirm_timeout: pipeline.confirm_timeout,
            confirm_poll_interval: pipeline.confirm_poll_interval,
            skip_preflight: pipeline.skip_preflight,
            reread: pipeline.reread,
            propagation_delay: delegation.propagation_delay,
            confirm_probe_attempts: delegation.confirm_probe_attempts,
            retry: RetryConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            commitment: self.commitment,
            confirm_timeout: self.confirm_timeout,
            confirm_poll_interval: self.confirm_poll_interval,
            skip_preflight: self.skip_preflight,
            reread: self.reread,
            rollup_validator: self.rollup_validator,
        }
    }

    pub fn delegation_config(&self) -> DelegationConfig {
        DelegationConfig {
            propagation_delay: self.propagation_delay,
            confirm_probe_attempts: self.confirm_probe_attempts,
            probe_retry: self.retry,
        }
    }

    pub fn connect(&self) -> ConnectionManager<SolanaLayerRpc> {
        ConnectionManager::connect(
            self.base.clone(),
            self.rollup.clone(),
            self.retry,
            self.reconnect.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_targets_devnet_with_fast_submission() {
        let config = SyncConfig::default();
        assert_eq!(config.program_id, TYPING_PROGRAM_ID);
        assert!(config.skip_preflight);
        assert_eq!(config.reread, RereadMode::Await);
        assert!(config.rollup.rpc_url.contains("magicblock"));

        let delegation = config.delegation_config();
        assert_eq!(delegation.propagation_delay, config.propagation_delay);
        assert!(delegation.confirm_probe_attempts > 0);
    }
}
