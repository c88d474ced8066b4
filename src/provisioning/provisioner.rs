use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use uuid::Uuid;

use crate::configuration::types::ProvisionConfig;
use crate::error_handling::types::ProvisionError;
use crate::transport::TransportChannel;

/// What a provisioner gets to know about the session it serves.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: Uuid,
    pub peer_addr: SocketAddr,
    /// Username the attacker authenticated as. Provisioners may use it to
    /// pick or label a sandbox; it is never used as a backend credential.
    pub username: String,
}

/// Produces a ready, authenticated backend leg for one session.
#[async_trait]
pub trait BackendProvisioner: Send + Sync {
    async fn provision(&self, params: &SessionParams) -> Result<TransportChannel, ProvisionError>;
}

/// Runs the provisioner under the configured retry policy.
///
/// Each attempt is clamped to the per-attempt timeout; between attempts
/// the backoff doubles. Credential rejection by the backend is terminal
/// right away, retrying cannot fix a wrong password. When the budget runs
/// out the session gets `Exhausted` and is torn down.
pub async fn provision_with_retry(
    provisioner: &dyn BackendProvisioner,
    config: &ProvisionConfig,
    params: &SessionParams,
) -> Result<TransportChannel, ProvisionError> {
    let attempt_timeout = Duration::from_secs(config.attempt_timeout_secs);
    let mut backoff = Duration::from_millis(config.initial_backoff_ms);

    for attempt in 1..=config.attempts {
        match tokio::time::timeout(attempt_timeout, provisioner.provision(params)).await {
            Ok(Ok(channel)) => {
                info!(
                    "[{}] Backend provisioned on attempt {}",
                    params.session_id, attempt
                );
                return Ok(channel);
            }
            Ok(Err(ProvisionError::AuthFailed)) => {
                warn!(
                    "[{}] Backend rejected our credentials, not retrying",
                    params.session_id
                );
                return Err(ProvisionError::AuthFailed);
            }
            Ok(Err(e)) => {
                warn!(
                    "[{}] Provisioning attempt {}/{} failed: {}",
                    params.session_id, attempt, config.attempts, e
                );
            }
            Err(_) => {
                warn!(
                    "[{}] Provisioning attempt {}/{} timed out after {:?}",
                    params.session_id, attempt, config.attempts, attempt_timeout
                );
            }
        }
        if attempt < config.attempts {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
    Err(ProvisionError::Exhausted(config.attempts))
}
