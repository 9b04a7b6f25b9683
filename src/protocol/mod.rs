/// Capabilities the failover engine may invoke on a live connection
///
/// The wire protocol itself lives outside this crate. A driver plugs in by
/// implementing [`Protocol`] for its connection type and [`Connector`] to open
/// new connections to a given host.
pub mod mock;
pub mod tcp;

use crate::core::{HostAddress, HostRole};
use crate::error::FailoverResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Shared handle on one live connection
pub type ProtocolHandle = Arc<dyn Protocol>;

/// Transaction isolation levels a session may carry over to a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Result of a replayable operation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub affected_rows: u64,
}

impl QueryResult {
    /// Result of a statement that returns no rows
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn affected(rows: u64) -> Self {
        Self {
            affected_rows: rows,
            ..Self::default()
        }
    }

    /// Single-cell result set
    pub fn scalar<C: Into<String>, V: Into<String>>(column: C, value: V) -> Self {
        Self {
            columns: vec![column.into()],
            rows: vec![vec![Some(value.into())]],
            affected_rows: 0,
        }
    }

    /// First cell of the first row, if any
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

/// A captured caller operation, replayed verbatim after a failover
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Plain SQL text
    ExecuteQuery(String),
    /// Statements sent together
    ExecuteBatch(Vec<String>),
    SelectDatabase(String),
    SetAutocommit(bool),
    SetTransactionIsolation(IsolationLevel),
    SetMaxRows(u32),
}

impl Operation {
    pub fn query<S: Into<String>>(sql: S) -> Self {
        Operation::ExecuteQuery(sql.into())
    }

    /// Whether the operation counts as a query for the retry-master budget
    pub fn is_query(&self) -> bool {
        matches!(self, Operation::ExecuteQuery(_) | Operation::ExecuteBatch(_))
    }

    /// Whether replaying the operation on another server is allowed.
    ///
    /// Server crash directives and `KILL` commands are never sent twice.
    pub fn is_replayable(&self) -> bool {
        match self {
            Operation::ExecuteQuery(sql) => !is_destructive(sql),
            Operation::ExecuteBatch(statements) => !statements.iter().any(|sql| is_destructive(sql)),
            _ => true,
        }
    }

    /// Run this operation on a connection
    pub async fn invoke(&self, protocol: &dyn Protocol) -> FailoverResult<QueryResult> {
        match self {
            Operation::ExecuteQuery(sql) => protocol.execute_query(sql).await,
            Operation::ExecuteBatch(statements) => {
                let mut total = QueryResult::ok();
                for sql in statements {
                    let result = protocol.execute_query(sql).await?;
                    total.affected_rows += result.affected_rows;
                    if !result.columns.is_empty() {
                        total.columns = result.columns;
                        total.rows = result.rows;
                    }
                }
                Ok(total)
            }
            Operation::SelectDatabase(database) => {
                protocol.select_database(database).await?;
                Ok(QueryResult::ok())
            }
            Operation::SetAutocommit(enabled) => {
                protocol.execute_query(autocommit_directive(*enabled)).await
            }
            Operation::SetTransactionIsolation(level) => {
                protocol.set_transaction_isolation(*level).await?;
                Ok(QueryResult::ok())
            }
            Operation::SetMaxRows(max) => {
                protocol.set_max_rows(*max);
                Ok(QueryResult::ok())
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ExecuteQuery(sql) => write!(f, "executeQuery({})", sql),
            Operation::ExecuteBatch(statements) => write!(f, "executeBatch({} statements)", statements.len()),
            Operation::SelectDatabase(database) => write!(f, "selectDatabase({})", database),
            Operation::SetAutocommit(enabled) => write!(f, "setAutocommit({})", enabled),
            Operation::SetTransactionIsolation(level) => {
                write!(f, "setTransactionIsolation({})", level.as_sql())
            }
            Operation::SetMaxRows(max) => write!(f, "setMaxRows({})", max),
        }
    }
}

fn is_destructive(sql: &str) -> bool {
    let command = sql.trim().to_uppercase();
    command == "ALTER SYSTEM CRASH" || command.starts_with("KILL")
}

/// Session-level autocommit statement
pub fn autocommit_directive(enabled: bool) -> &'static str {
    if enabled {
        "set autocommit=1"
    } else {
        "set autocommit=0"
    }
}

/// Session-level read-only statement
pub fn read_only_directive(read_only: bool) -> &'static str {
    if read_only {
        "SET SESSION TRANSACTION READ ONLY"
    } else {
        "SET SESSION TRANSACTION READ WRITE"
    }
}

/// Operations available on one connection bound to one host.
///
/// Implementations use interior mutability: a handle is shared between the
/// session and its background loops.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Host this connection is bound to
    fn host_address(&self) -> &HostAddress;

    /// Liveness check; `Err` means the transport is gone
    async fn ping(&self) -> FailoverResult<bool>;

    /// Role known for this connection (declared, or the last live check)
    fn is_primary(&self) -> bool;

    /// Ask the server whether it currently accepts writes
    async fn check_if_primary(&self) -> FailoverResult<bool>;

    async fn execute_query(&self, sql: &str) -> FailoverResult<QueryResult>;

    fn in_transaction(&self) -> bool;

    fn is_closed(&self) -> bool;

    async fn close(&self);

    fn max_allowed_packet(&self) -> u32;
    fn set_max_allowed_packet(&self, size: u32);

    fn max_rows(&self) -> u32;
    fn set_max_rows(&self, max: u32);

    /// `None` when the server default is in use
    fn transaction_isolation(&self) -> Option<IsolationLevel>;
    async fn set_transaction_isolation(&self, level: IsolationLevel) -> FailoverResult<()>;

    fn database(&self) -> Option<String>;
    async fn select_database(&self, database: &str) -> FailoverResult<()>;

    fn autocommit(&self) -> bool;

    fn read_only(&self) -> bool;
    fn set_read_only(&self, read_only: bool);

    fn version_at_least(&self, major: u32, minor: u32, patch: u32) -> bool;
}

/// Opens connections to candidate hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate a connection to `host`
    async fn connect(&self, host: &HostAddress) -> FailoverResult<ProtocolHandle>;
}

/// Role a connected handle reports, probing the server when roles are discovered live
pub async fn discover_role(handle: &dyn Protocol, live: bool) -> FailoverResult<HostRole> {
    let primary = if live {
        handle.check_if_primary().await?
    } else {
        handle.is_primary()
    };

    Ok(if primary {
        HostRole::Primary
    } else {
        HostRole::Replica
    })
}
