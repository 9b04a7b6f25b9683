/// Session resynchronization and call replay after a connection switch
use crate::error::{FailoverError, FailoverResult};
use crate::protocol::{autocommit_directive, read_only_directive, Operation, Protocol, QueryResult};
use tracing::debug;

/// Result of handling a failed operation
#[derive(Debug)]
pub enum ReplayOutcome {
    /// The operation ran again on the current connection; carries its result
    Replayed(FailoverResult<QueryResult>),
    /// A connection is available but the operation was not run again
    NotReplayed,
    /// No connection could take over
    Unrecovered,
}

impl ReplayOutcome {
    /// Result the caller sees: the replay result, or the error that triggered failover
    pub fn into_result(self, original: FailoverError) -> FailoverResult<QueryResult> {
        match self {
            ReplayOutcome::Replayed(result) => result,
            ReplayOutcome::NotReplayed | ReplayOutcome::Unrecovered => Err(original),
        }
    }

    pub fn is_replayed(&self) -> bool {
        matches!(self, ReplayOutcome::Replayed(_))
    }
}

/// Copy session properties of `from` onto `to` before `to` becomes current
pub async fn sync_session(from: &dyn Protocol, to: &dyn Protocol) -> FailoverResult<()> {
    to.set_max_allowed_packet(from.max_allowed_packet());
    to.set_max_rows(from.max_rows());

    if let Some(level) = from.transaction_isolation() {
        to.set_transaction_isolation(level).await?;
    }

    if let Some(database) = from.database().filter(|db| !db.is_empty()) {
        to.select_database(&database).await?;
    }

    if from.autocommit() != to.autocommit() {
        to.execute_query(autocommit_directive(from.autocommit())).await?;
    }

    Ok(())
}

/// [`sync_session`], logging instead of failing
pub async fn sync_session_logged(from: &dyn Protocol, to: &dyn Protocol) {
    if let Err(e) = sync_session(from, to).await {
        debug!(
            "Error synchronizing session from {} to {}: {}",
            from.host_address(),
            to.host_address(),
            e
        );
    }
}

/// Issue the session read-only directive when the server understands it
pub async fn set_session_read_only(handle: &dyn Protocol, read_only: bool) -> FailoverResult<()> {
    if handle.version_at_least(10, 0, 0) {
        handle.execute_query(read_only_directive(read_only)).await?;
    }
    Ok(())
}

/// Run `operation` again on `handle` unless it must never be sent twice
pub async fn relaunch(operation: Option<&Operation>, handle: &dyn Protocol) -> ReplayOutcome {
    let operation = match operation {
        Some(operation) => operation,
        None => return ReplayOutcome::NotReplayed,
    };

    if !operation.is_replayable() {
        debug!("Not replaying destructive operation {}", operation);
        return ReplayOutcome::NotReplayed;
    }

    debug!("Replaying {} on {}", operation, handle.host_address());
    match operation.invoke(handle).await {
        Err(e) if e.is_connectivity() => {
            debug!("Replay of {} failed: {}", operation, e);
            ReplayOutcome::Unrecovered
        }
        result => ReplayOutcome::Replayed(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::MockCluster;
    use crate::protocol::{Connector, IsolationLevel};

    #[tokio::test]
    async fn test_sync_copies_session_properties() {
        let (cluster, hosts) = MockCluster::replication(1);
        let connector = cluster.connector();
        let from = connector.connect(&hosts[0]).await.unwrap();
        let to = connector.connect(&hosts[1]).await.unwrap();

        from.set_max_rows(500);
        from.set_max_allowed_packet(1024);
        from.set_transaction_isolation(IsolationLevel::ReadCommitted).await.unwrap();
        from.select_database("shop").await.unwrap();
        from.execute_query("set autocommit=0").await.unwrap();

        sync_session(from.as_ref(), to.as_ref()).await.unwrap();

        assert_eq!(to.max_rows(), 500);
        assert_eq!(to.max_allowed_packet(), 1024);
        assert_eq!(to.transaction_isolation(), Some(IsolationLevel::ReadCommitted));
        assert_eq!(to.database().as_deref(), Some("shop"));
        assert!(!to.autocommit());
        assert!(cluster.executed(&hosts[1]).contains(&"set autocommit=0".to_string()));
    }

    #[tokio::test]
    async fn test_sync_skips_unchanged_autocommit() {
        let (cluster, hosts) = MockCluster::replication(1);
        let connector = cluster.connector();
        let from = connector.connect(&hosts[0]).await.unwrap();
        let to = connector.connect(&hosts[1]).await.unwrap();

        sync_session(from.as_ref(), to.as_ref()).await.unwrap();
        assert!(cluster.executed(&hosts[1]).is_empty());
    }

    #[tokio::test]
    async fn test_destructive_operations_are_not_relaunched() {
        let (cluster, hosts) = MockCluster::replication(1);
        let handle = cluster.connector().connect(&hosts[1]).await.unwrap();

        for sql in ["KILL 1234", "ALTER SYSTEM CRASH"] {
            let outcome = relaunch(Some(&Operation::query(sql)), handle.as_ref()).await;
            assert!(matches!(outcome, ReplayOutcome::NotReplayed));
        }
        assert!(cluster.executed(&hosts[1]).is_empty());
    }

    #[tokio::test]
    async fn test_relaunch_replays_verbatim() {
        let (cluster, hosts) = MockCluster::replication(1);
        let handle = cluster.connector().connect(&hosts[1]).await.unwrap();

        let outcome = relaunch(Some(&Operation::query("SELECT @@server_id")), handle.as_ref()).await;
        let result = outcome.into_result(FailoverError::connectivity(&hosts[0], "eof")).unwrap();

        assert_eq!(result.first_value(), Some("2"));
        assert_eq!(cluster.executed(&hosts[1]), vec!["SELECT @@server_id"]);
    }

    #[tokio::test]
    async fn test_relaunch_on_dead_connection_is_unrecovered() {
        let (cluster, hosts) = MockCluster::replication(1);
        let handle = cluster.connector().connect(&hosts[1]).await.unwrap();
        cluster.stop(&hosts[1]);

        let outcome = relaunch(Some(&Operation::query("SELECT 1")), handle.as_ref()).await;
        assert!(matches!(outcome, ReplayOutcome::Unrecovered));

        let original = FailoverError::connectivity(&hosts[0], "eof");
        let err = outcome.into_result(original).unwrap_err();
        assert!(err.to_string().contains("mock-0"));
    }

    #[tokio::test]
    async fn test_read_only_directive_requires_version() {
        let (cluster, hosts) = MockCluster::replication(1);
        cluster.set_version(&hosts[1], (5, 5, 40));
        let handle = cluster.connector().connect(&hosts[1]).await.unwrap();

        set_session_read_only(handle.as_ref(), true).await.unwrap();
        assert!(cluster.executed(&hosts[1]).is_empty());

        cluster.set_version(&hosts[1], (10, 1, 0));
        set_session_read_only(handle.as_ref(), true).await.unwrap();
        assert_eq!(
            cluster.executed(&hosts[1]),
            vec!["SET SESSION TRANSACTION READ ONLY"]
        );
    }
}
