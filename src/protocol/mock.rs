/// In-memory simulated database cluster
///
/// Hosts can be stopped, restarted, promoted and demoted while sessions run
/// against them. Every statement a host receives is recorded so tests can
/// assert where an operation was executed or replayed.
use crate::core::{HostAddress, HostRole};
use crate::error::{FailoverError, FailoverResult};
use crate::protocol::{Connector, IsolationLevel, Protocol, ProtocolHandle, QueryResult};
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

const DEFAULT_MAX_ALLOWED_PACKET: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
struct MockServer {
    server_id: u32,
    up: bool,
    primary: bool,
    /// Bumped on every stop so connections opened before it stay broken
    generation: u64,
    version: (u32, u32, u32),
    executed: Vec<String>,
    connect_attempts: usize,
}

/// Simulated cluster shared by every mock connection
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    servers: Arc<Mutex<FnvHashMap<HostAddress, MockServer>>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// One primary followed by `replicas` replicas, ports 3306 upwards
    pub fn replication(replicas: usize) -> (Self, Vec<HostAddress>) {
        let cluster = Self::new();
        let mut hosts = vec![HostAddress::primary("mock-0", 3306)];
        for i in 1..=replicas {
            hosts.push(HostAddress::replica(format!("mock-{}", i), 3306 + i as u16));
        }
        for host in &hosts {
            cluster.add_host(host, host.role == HostRole::Primary);
        }
        (cluster, hosts)
    }

    /// `count` hosts that all accept writes, as in a multi-primary cluster
    pub fn multi_primary(count: usize) -> (Self, Vec<HostAddress>) {
        let cluster = Self::new();
        let hosts: Vec<HostAddress> = (0..count)
            .map(|i| HostAddress::primary(format!("mock-{}", i), 3306 + i as u16))
            .collect();
        for host in &hosts {
            cluster.add_host(host, true);
        }
        (cluster, hosts)
    }

    pub fn add_host(&self, host: &HostAddress, primary: bool) {
        let mut servers = self.servers.lock();
        let server_id = servers.len() as u32 + 1;
        servers.insert(
            host.clone(),
            MockServer {
                server_id,
                up: true,
                primary,
                generation: 0,
                version: (10, 0, 0),
                executed: Vec::new(),
                connect_attempts: 0,
            },
        );
    }

    /// Take a host down, breaking every connection to it
    pub fn stop(&self, host: &HostAddress) {
        self.update(host, |server| {
            server.up = false;
            server.generation += 1;
        });
    }

    pub fn start(&self, host: &HostAddress) {
        self.update(host, |server| server.up = true);
    }

    /// Make `host` the only writable server
    pub fn promote(&self, host: &HostAddress) {
        let mut servers = self.servers.lock();
        for (address, server) in servers.iter_mut() {
            server.primary = address == host;
        }
    }

    pub fn demote(&self, host: &HostAddress) {
        self.update(host, |server| server.primary = false);
    }

    pub fn set_version(&self, host: &HostAddress, version: (u32, u32, u32)) {
        self.update(host, |server| server.version = version);
    }

    pub fn is_up(&self, host: &HostAddress) -> bool {
        self.servers.lock().get(host).map(|s| s.up).unwrap_or(false)
    }

    pub fn server_id(&self, host: &HostAddress) -> Option<u32> {
        self.servers.lock().get(host).map(|s| s.server_id)
    }

    /// Statements received by a host, in order
    pub fn executed(&self, host: &HostAddress) -> Vec<String> {
        self.servers
            .lock()
            .get(host)
            .map(|s| s.executed.clone())
            .unwrap_or_default()
    }

    pub fn connect_attempts(&self, host: &HostAddress) -> usize {
        self.servers
            .lock()
            .get(host)
            .map(|s| s.connect_attempts)
            .unwrap_or(0)
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            cluster: self.clone(),
        }
    }

    fn update<F: FnOnce(&mut MockServer)>(&self, host: &HostAddress, f: F) {
        if let Some(server) = self.servers.lock().get_mut(host) {
            f(server);
        }
    }
}

#[derive(Debug, Clone)]
struct SessionVars {
    database: Option<String>,
    autocommit: bool,
    isolation: Option<IsolationLevel>,
    max_rows: u32,
    max_allowed_packet: u32,
    read_only: bool,
    in_transaction: bool,
    closed: bool,
    last_primary: bool,
}

/// Connection to one simulated host
#[derive(Debug)]
pub struct MockProtocol {
    cluster: MockCluster,
    address: HostAddress,
    generation: u64,
    vars: Mutex<SessionVars>,
}

impl MockProtocol {
    /// Open a connection on the current cluster state
    fn open(cluster: &MockCluster, address: &HostAddress) -> FailoverResult<Self> {
        let mut servers = cluster.servers.lock();
        let server = servers
            .get_mut(address)
            .ok_or_else(|| FailoverError::connectivity(address, "unknown host"))?;
        server.connect_attempts += 1;
        if !server.up {
            return Err(FailoverError::connectivity(address, "connection refused"));
        }

        Ok(Self {
            cluster: cluster.clone(),
            address: address.clone(),
            generation: server.generation,
            vars: Mutex::new(SessionVars {
                database: None,
                autocommit: true,
                isolation: None,
                max_rows: 0,
                max_allowed_packet: DEFAULT_MAX_ALLOWED_PACKET,
                read_only: false,
                in_transaction: false,
                closed: false,
                last_primary: server.primary,
            }),
        })
    }

    /// Run `f` against the server if this connection is still usable
    fn with_server<T, F: FnOnce(&mut MockServer) -> T>(&self, f: F) -> FailoverResult<T> {
        if self.vars.lock().closed {
            return Err(FailoverError::connectivity(&self.address, "connection closed"));
        }
        let mut servers = self.cluster.servers.lock();
        match servers.get_mut(&self.address) {
            Some(server) if server.up && server.generation == self.generation => Ok(f(server)),
            _ => Err(FailoverError::connectivity(&self.address, "connection reset by peer")),
        }
    }

    /// Mark the connection as inside a transaction
    pub fn begin(&self) {
        self.vars.lock().in_transaction = true;
    }
}

fn is_write(sql: &str) -> bool {
    const WRITES: [&str; 7] = ["INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "REPLACE"];
    let upper = sql.trim_start().to_uppercase();
    WRITES.iter().any(|w| upper.starts_with(w))
}

#[async_trait]
impl Protocol for MockProtocol {
    fn host_address(&self) -> &HostAddress {
        &self.address
    }

    async fn ping(&self) -> FailoverResult<bool> {
        self.with_server(|_| true)
    }

    fn is_primary(&self) -> bool {
        match self.address.role {
            HostRole::Primary => true,
            HostRole::Replica => false,
            HostRole::Unset => self.vars.lock().last_primary,
        }
    }

    async fn check_if_primary(&self) -> FailoverResult<bool> {
        let primary = self.with_server(|server| server.primary)?;
        let mut vars = self.vars.lock();
        vars.last_primary = primary;
        vars.read_only = !primary;
        Ok(primary)
    }

    async fn execute_query(&self, sql: &str) -> FailoverResult<QueryResult> {
        let read_only = self.vars.lock().read_only;
        let statement = sql.trim().to_string();
        let upper = statement.to_uppercase();

        let (server_id, primary) = self.with_server(|server| {
            server.executed.push(statement.clone());
            (server.server_id, server.primary)
        })?;

        if is_write(&statement) && (read_only || !primary) {
            return Err(FailoverError::query(format!(
                "host {} is running with read-only option",
                self.address
            )));
        }

        let mut vars = self.vars.lock();
        match upper.as_str() {
            "BEGIN" | "START TRANSACTION" => vars.in_transaction = true,
            "COMMIT" | "ROLLBACK" => vars.in_transaction = false,
            "SET AUTOCOMMIT=1" => vars.autocommit = true,
            "SET AUTOCOMMIT=0" => vars.autocommit = false,
            "SET SESSION TRANSACTION READ ONLY" => vars.read_only = true,
            "SET SESSION TRANSACTION READ WRITE" => vars.read_only = false,
            "SELECT @@SERVER_ID" => return Ok(QueryResult::scalar("@@server_id", server_id.to_string())),
            _ => {}
        }

        if is_write(&statement) {
            Ok(QueryResult::affected(1))
        } else {
            Ok(QueryResult::ok())
        }
    }

    fn in_transaction(&self) -> bool {
        self.vars.lock().in_transaction
    }

    fn is_closed(&self) -> bool {
        self.vars.lock().closed
    }

    async fn close(&self) {
        self.vars.lock().closed = true;
    }

    fn max_allowed_packet(&self) -> u32 {
        self.vars.lock().max_allowed_packet
    }

    fn set_max_allowed_packet(&self, size: u32) {
        self.vars.lock().max_allowed_packet = size;
    }

    fn max_rows(&self) -> u32 {
        self.vars.lock().max_rows
    }

    fn set_max_rows(&self, max: u32) {
        self.vars.lock().max_rows = max;
    }

    fn transaction_isolation(&self) -> Option<IsolationLevel> {
        self.vars.lock().isolation
    }

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> FailoverResult<()> {
        let statement = format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql());
        self.with_server(|server| server.executed.push(statement))?;
        self.vars.lock().isolation = Some(level);
        Ok(())
    }

    fn database(&self) -> Option<String> {
        self.vars.lock().database.clone()
    }

    async fn select_database(&self, database: &str) -> FailoverResult<()> {
        let statement = format!("USE {}", database);
        self.with_server(|server| server.executed.push(statement))?;
        self.vars.lock().database = Some(database.to_string());
        Ok(())
    }

    fn autocommit(&self) -> bool {
        self.vars.lock().autocommit
    }

    fn read_only(&self) -> bool {
        self.vars.lock().read_only
    }

    fn set_read_only(&self, read_only: bool) {
        self.vars.lock().read_only = read_only;
    }

    fn version_at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        self.cluster
            .servers
            .lock()
            .get(&self.address)
            .map(|server| server.version >= (major, minor, patch))
            .unwrap_or(false)
    }
}

/// Connector opening [`MockProtocol`] connections on a [`MockCluster`]
#[derive(Debug, Clone)]
pub struct MockConnector {
    cluster: MockCluster,
}

impl MockConnector {
    /// Open a connection keeping the concrete type, e.g. to start a transaction on it
    pub fn open(&self, host: &HostAddress) -> FailoverResult<Arc<MockProtocol>> {
        MockProtocol::open(&self.cluster, host).map(Arc::new)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &HostAddress) -> FailoverResult<ProtocolHandle> {
        let protocol: ProtocolHandle = self.open(host)?;
        Ok(protocol)
    }
}
