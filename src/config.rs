//! Operator runtime configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Default kaniko executor used by build Jobs
pub const DEFAULT_BUILDER_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";
/// Default signer image used by sign Jobs
pub const DEFAULT_SIGNER_IMAGE: &str = "quay.io/edge-infrastructure/kernel-module-management-signimage:latest";

/// Settings shared by the controllers, filled from the command line
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace holding the leader election Lease
    pub operator_namespace: String,
    pub builder_image: String,
    pub signer_image: String,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
    /// Requeue interval after a retriable error
    pub retry_interval: Duration,
    /// Requeue interval after a non-retriable error
    pub error_backoff: Duration,
    pub leader_election: bool,
    /// Bind address of the health and metrics server
    pub http_addr: SocketAddr,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_namespace: "kmm-operator-system".to_string(),
            builder_image: DEFAULT_BUILDER_IMAGE.to_string(),
            signer_image: DEFAULT_SIGNER_IMAGE.to_string(),
            resync_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(15),
            error_backoff: Duration::from_secs(60),
            leader_election: true,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}
