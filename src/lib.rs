/// Relevo - client-side high availability for MariaDB/MySQL style drivers
///
/// A driver hands relevo a list of candidate hosts and an HA mode. Relevo
/// opens the connections a session needs, detects transport failures,
/// blacklists failing hosts, searches the topology for replacements and
/// replays the interrupted operation on the new connection.
///
/// Three HA modes are supported:
/// 1. Master-only: one writable connection, any candidate may take over
/// 2. Replication: a primary plus a replica connection with read/write splitting
/// 3. Aurora: like replication, but host roles are discovered live
pub mod config;
pub mod core;
pub mod error;
pub mod failover;
pub mod health;
pub mod protocol;
pub mod search;
pub mod utils;

use std::sync::Arc;

pub use crate::config::{Config, ConfigError, FailoverOptions};
pub use crate::core::{Blacklist, HaMode, HostAddress, HostRole, Topology};
pub use crate::error::{FailoverError, FailoverResult};
pub use crate::failover::{ActiveRole, FailoverSession, Policy, SessionStatus};
pub use crate::protocol::{Connector, IsolationLevel, Operation, Protocol, ProtocolHandle, QueryResult};

/// Open a session for a loaded configuration, sharing the process-wide blacklist
pub async fn connect(config: &Config, connector: Arc<dyn Connector>) -> FailoverResult<FailoverSession> {
    config.validate()?;
    FailoverSession::connect(config.topology(), config.failover_options(), connector).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::MockCluster;

    #[tokio::test]
    async fn test_connect_from_config() {
        let (cluster, hosts) = MockCluster::replication(1);
        let mut config = Config::default();
        config.topology.hosts = hosts.clone();
        config.failover.valid_connection_timeout_sec = 0;

        let session = connect(&config, Arc::new(cluster.connector())).await.unwrap();
        assert_eq!(session.mode(), HaMode::Replication);
        assert_eq!(session.status().current_host, Some(hosts[0].clone()));
        session.close().await;
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let (cluster, _hosts) = MockCluster::replication(1);
        let mut config = Config::default();
        config.failover.retries_all_down = 0;

        let result = connect(&config, Arc::new(cluster.connector())).await;
        assert!(matches!(result, Err(FailoverError::Config(_))));
    }
}
