/// Transport-level probe connections
///
/// A [`TcpProtocol`] only knows whether its socket is still open. Roles are
/// taken from the topology and statements are rejected, which is enough for
/// reachability checks and for driving the search engine from the command line.
use crate::core::{HostAddress, HostRole};
use crate::error::{FailoverError, FailoverResult};
use crate::protocol::{Connector, IsolationLevel, Protocol, ProtocolHandle, QueryResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct ProbeSession {
    database: Option<String>,
    isolation: Option<IsolationLevel>,
    max_rows: u32,
    max_allowed_packet: u32,
    read_only: bool,
}

/// Socket-only connection to one host
#[derive(Debug)]
pub struct TcpProtocol {
    address: HostAddress,
    stream: Mutex<Option<TcpStream>>,
    session: Mutex<ProbeSession>,
}

impl TcpProtocol {
    pub fn new(address: HostAddress, stream: TcpStream) -> Self {
        Self {
            address,
            stream: Mutex::new(Some(stream)),
            session: Mutex::new(ProbeSession::default()),
        }
    }

    /// Non-blocking check that the peer has not closed the socket
    fn socket_alive(&self) -> FailoverResult<bool> {
        let stream = self.stream.lock();
        let stream = match stream.as_ref() {
            Some(stream) => stream,
            None => return Err(FailoverError::connectivity(&self.address, "connection closed")),
        };

        let mut buffer = [0u8; 256];
        match stream.try_read(&mut buffer) {
            Ok(0) => Err(FailoverError::connectivity(&self.address, "connection closed by peer")),
            // Pending server data (greeting or notice) still means the peer is there
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(e) => Err(FailoverError::connectivity(&self.address, e.to_string())),
        }
    }
}

#[async_trait]
impl Protocol for TcpProtocol {
    fn host_address(&self) -> &HostAddress {
        &self.address
    }

    async fn ping(&self) -> FailoverResult<bool> {
        self.socket_alive()
    }

    fn is_primary(&self) -> bool {
        self.address.role != HostRole::Replica
    }

    async fn check_if_primary(&self) -> FailoverResult<bool> {
        self.socket_alive()?;
        Ok(self.is_primary())
    }

    async fn execute_query(&self, _sql: &str) -> FailoverResult<QueryResult> {
        self.socket_alive()?;
        Err(FailoverError::query(format!(
            "probe connection to {} cannot execute statements",
            self.address
        )))
    }

    fn in_transaction(&self) -> bool {
        false
    }

    fn is_closed(&self) -> bool {
        self.stream.lock().is_none()
    }

    async fn close(&self) {
        if self.stream.lock().take().is_some() {
            debug!("Closed probe connection to {}", self.address);
        }
    }

    fn max_allowed_packet(&self) -> u32 {
        self.session.lock().max_allowed_packet
    }

    fn set_max_allowed_packet(&self, size: u32) {
        self.session.lock().max_allowed_packet = size;
    }

    fn max_rows(&self) -> u32 {
        self.session.lock().max_rows
    }

    fn set_max_rows(&self, max: u32) {
        self.session.lock().max_rows = max;
    }

    fn transaction_isolation(&self) -> Option<IsolationLevel> {
        self.session.lock().isolation
    }

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> FailoverResult<()> {
        self.socket_alive()?;
        self.session.lock().isolation = Some(level);
        Ok(())
    }

    fn database(&self) -> Option<String> {
        self.session.lock().database.clone()
    }

    async fn select_database(&self, database: &str) -> FailoverResult<()> {
        self.socket_alive()?;
        self.session.lock().database = Some(database.to_string());
        Ok(())
    }

    fn autocommit(&self) -> bool {
        true
    }

    fn read_only(&self) -> bool {
        self.session.lock().read_only
    }

    fn set_read_only(&self, read_only: bool) {
        self.session.lock().read_only = read_only;
    }

    fn version_at_least(&self, _major: u32, _minor: u32, _patch: u32) -> bool {
        false
    }
}

/// Opens [`TcpProtocol`] connections with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn configure_stream(stream: &TcpStream) -> Result<(), io::Error> {
        stream.set_nodelay(true)?;
        socket2::SockRef::from(stream).set_keepalive(true)?;
        Ok(())
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &HostAddress) -> FailoverResult<ProtocolHandle> {
        debug!("Connecting to {}", host);

        let target = (host.host.as_str(), host.port);
        match timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = Self::configure_stream(&stream) {
                    warn!("Failed to configure stream to {}: {}", host, e);
                }
                debug!("Connected to {}", host);
                Ok(Arc::new(TcpProtocol::new(host.clone(), stream)))
            }
            Ok(Err(e)) => match e.kind() {
                io::ErrorKind::ConnectionRefused => {
                    debug!("Connection refused by {}", host);
                    Err(FailoverError::connectivity(host, "connection refused"))
                }
                _ => {
                    debug!("Network error connecting to {}: {}", host, e);
                    Err(FailoverError::connectivity(host, e.to_string()))
                }
            },
            Err(_) => {
                debug!("Timeout connecting to {}", host);
                Err(FailoverError::connectivity(
                    host,
                    format!("connect timed out after {}ms", self.connect_timeout.as_millis()),
                ))
            }
        }
    }
}
