use async_trait::async_trait;
use log::debug;

use super::provisioner::{BackendProvisioner, SessionParams};
use crate::configuration::types::BackendConfig;
use crate::error_handling::types::ProvisionError;
use crate::transport::{ssh_backend, TransportChannel};

/// Provisions sessions onto a fixed, pre-existing sandbox host over SSH.
///
/// One shared backend is the simplest deployment; a per-session sandbox
/// orchestrator would implement the same trait.
pub struct SshBackendProvisioner {
    config: BackendConfig,
}

impl SshBackendProvisioner {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendProvisioner for SshBackendProvisioner {
    async fn provision(&self, params: &SessionParams) -> Result<TransportChannel, ProvisionError> {
        debug!(
            "[{}] Connecting backend leg to {} for attacker-claimed user '{}'",
            params.session_id, self.config.addr, params.username
        );
        ssh_backend::connect(
            &self.config.addr,
            &self.config.username,
            &self.config.password,
        )
        .await
    }
}
