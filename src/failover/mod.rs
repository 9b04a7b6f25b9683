/// Per-session failover orchestration
///
/// A [`FailoverSession`] owns the connections of one logical database session:
/// a primary handle and, for primary/replica topologies, a secondary handle.
/// Exactly one of them is current at any time. When an operation fails at the
/// transport level the session records the failure, blacklists the host and
/// runs the recovery procedure of its policy, replaying the operation on the
/// replacement connection when one is found.
///
/// Two locks guard a session. `session_lock` serializes failover procedures
/// (foreground recovery, loop ticks, read-only switches) and is held across
/// network round trips. `state` is a short-lived lock around the handles and
/// the [`FailoverState`]; it is never held across an await point, so
/// foreground callers can always snapshot the current handle.
pub mod master_only;
pub mod replay;
pub mod replication;
pub mod state;

pub use replay::ReplayOutcome;
pub use state::FailoverState;

use crate::config::{ConfigError, FailoverOptions};
use crate::core::{Blacklist, HaMode, HostAddress, Topology};
use crate::error::{FailoverError, FailoverResult};
use crate::health::{LoopControl, PrimaryRoleChecker, ScheduledLoop, FAIL_LOOP_PERIOD};
use crate::protocol::{Connector, Operation, ProtocolHandle, QueryResult};
use crate::search::{SearchEngine, SearchFilter, SearchListener};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Recovery strategy selected from the HA mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Single writer, no replica traffic
    MasterOnly,
    /// Read/write splitting between a primary and a secondary connection
    PrimaryReplica,
}

impl Policy {
    pub fn for_mode(mode: HaMode) -> Self {
        if mode.has_replicas() {
            Policy::PrimaryReplica
        } else {
            Policy::MasterOnly
        }
    }
}

/// Which connection currently serves foreground operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveRole {
    Primary,
    Secondary,
}

impl fmt::Display for ActiveRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveRole::Primary => write!(f, "primary"),
            ActiveRole::Secondary => write!(f, "secondary"),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub mode: HaMode,
    pub active: ActiveRole,
    pub current_host: Option<HostAddress>,
    pub primary_host: Option<HostAddress>,
    pub secondary_host: Option<HostAddress>,
    pub read_only: bool,
    pub primary_failed: bool,
    pub secondary_failed: bool,
    pub connection_attempts: u32,
    pub queries_since_failover: u32,
    pub fail_loop_armed: bool,
    pub ping_loop_armed: bool,
}

struct SessionState {
    failover: FailoverState,
    primary: Option<ProtocolHandle>,
    secondary: Option<ProtocolHandle>,
    active: ActiveRole,
}

impl SessionState {
    fn current(&self) -> Option<ProtocolHandle> {
        match self.active {
            ActiveRole::Primary => self.primary.clone(),
            ActiveRole::Secondary => self.secondary.clone(),
        }
    }
}

pub(crate) struct Inner {
    mode: HaMode,
    policy: Policy,
    topology: Topology,
    options: FailoverOptions,
    blacklist: Blacklist,
    search: SearchEngine,
    session_lock: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
    fail_loop: ScheduledLoop,
    ping_loop: ScheduledLoop,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

/// One logical database session with transparent failover
pub struct FailoverSession {
    inner: Arc<Inner>,
}

impl FailoverSession {
    /// Open a session using the process-wide blacklist
    pub async fn connect(
        topology: Topology,
        options: FailoverOptions,
        connector: Arc<dyn Connector>,
    ) -> FailoverResult<Self> {
        Self::connect_with_blacklist(topology, options, connector, Blacklist::global()).await
    }

    /// Open a session sharing `blacklist`.
    ///
    /// Master-only topologies look for a primary; primary/replica topologies
    /// look for both roles. When only one role can be found the session still
    /// opens, with the missing role marked failed and the failover loop armed.
    pub async fn connect_with_blacklist(
        topology: Topology,
        options: FailoverOptions,
        connector: Arc<dyn Connector>,
        blacklist: Blacklist,
    ) -> FailoverResult<Self> {
        options.validate()?;
        if topology.is_empty() {
            return Err(ConfigError::ValidationError("topology hosts cannot be empty".to_string()).into());
        }

        let mode = topology.mode();
        let policy = Policy::for_mode(mode);
        let inner = Arc::new(Inner {
            mode,
            policy,
            search: SearchEngine::new(connector, mode),
            topology,
            options,
            blacklist,
            session_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState {
                failover: FailoverState::new(),
                primary: None,
                secondary: None,
                active: ActiveRole::Primary,
            }),
            fail_loop: ScheduledLoop::new("failover"),
            ping_loop: ScheduledLoop::new("ping"),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        inner.initial_connect().await?;
        inner.touch_ping_loop();

        Ok(Self { inner })
    }

    /// Run one operation, failing over transparently when the connection breaks
    pub async fn execute(&self, operation: Operation) -> FailoverResult<QueryResult> {
        self.inner.pre_execute(&operation);

        let handle = self.inner.current().ok_or(FailoverError::NoPrimaryAvailable)?;
        match operation.invoke(handle.as_ref()).await {
            Ok(result) => {
                self.inner.touch_ping_loop();
                Ok(result)
            }
            Err(e) if e.is_connectivity() => self.handle_failure(&handle, Some(&operation), e).await,
            Err(e) => Err(e),
        }
    }

    /// Recover from `error` raised by `failed`, returning the replayed result
    /// or `error` itself when no recovery was possible
    pub async fn handle_failure(
        &self,
        failed: &ProtocolHandle,
        operation: Option<&Operation>,
        error: FailoverError,
    ) -> FailoverResult<QueryResult> {
        warn!("Connection to {} failed: {}", failed.host_address(), error);
        self.on_operation_needs_failover(failed, operation)
            .await
            .into_result(error)
    }

    /// Run the fail procedure for an operation that broke on `failed`
    pub async fn on_operation_needs_failover(
        &self,
        failed: &ProtocolHandle,
        operation: Option<&Operation>,
    ) -> ReplayOutcome {
        let _guard = self.inner.session_lock.lock().await;
        self.inner.handle_failover(failed, operation).await
    }

    /// Install a newly found primary connection
    pub async fn on_found_primary(&self, handle: ProtocolHandle) {
        let _guard = self.inner.session_lock.lock().await;
        self.inner.found_primary(handle).await;
    }

    /// Install a newly found secondary connection
    pub async fn on_found_secondary(&self, handle: ProtocolHandle) {
        let _guard = self.inner.session_lock.lock().await;
        self.inner.found_replica(handle).await;
    }

    /// Route the session to a replica (`true`) or to the primary (`false`)
    pub async fn switch_read_only(&self, read_only: bool) -> FailoverResult<()> {
        let _guard = self.inner.session_lock.lock().await;
        match self.inner.policy {
            Policy::MasterOnly => self.inner.switch_read_only_master_only(read_only).await,
            Policy::PrimaryReplica => self.inner.switch_read_only_replication(read_only).await,
        }
    }

    /// Search again for every failed role
    pub async fn reconnect(&self) -> FailoverResult<()> {
        let _guard = self.inner.session_lock.lock().await;
        self.inner.reconnect().await
    }

    pub fn should_reconnect(&self) -> bool {
        self.inner.should_reconnect()
    }

    pub fn is_read_only(&self) -> bool {
        let state = self.inner.state.lock();
        match self.inner.policy {
            Policy::MasterOnly => state.failover.read_only_requested(),
            Policy::PrimaryReplica => state.active == ActiveRole::Secondary,
        }
    }

    /// Snapshot of the connection serving foreground operations
    pub fn current(&self) -> Option<ProtocolHandle> {
        self.inner.current()
    }

    pub fn mode(&self) -> HaMode {
        self.inner.mode
    }

    pub fn policy(&self) -> Policy {
        self.inner.policy
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub fn options(&self) -> &FailoverOptions {
        &self.inner.options
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.inner.blacklist
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.inner.state.lock();
        let read_only = match self.inner.policy {
            Policy::MasterOnly => state.failover.read_only_requested(),
            Policy::PrimaryReplica => state.active == ActiveRole::Secondary,
        };

        SessionStatus {
            mode: self.inner.mode,
            active: state.active,
            current_host: state.current().map(|h| h.host_address().clone()),
            primary_host: state.primary.as_ref().map(|h| h.host_address().clone()),
            secondary_host: state.secondary.as_ref().map(|h| h.host_address().clone()),
            read_only,
            primary_failed: state.failover.primary_failed(),
            secondary_failed: state.failover.secondary_failed(),
            connection_attempts: state.failover.connection_attempts(),
            queries_since_failover: state.failover.queries_since_failover(),
            fail_loop_armed: self.inner.fail_loop.is_armed(),
            ping_loop_armed: self.inner.ping_loop.is_armed(),
        }
    }

    /// Stop both loops and close every connection
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.fail_loop.cancel();
        self.inner.ping_loop.cancel();

        let _guard = self.inner.session_lock.lock().await;
        let (primary, secondary) = {
            let mut state = self.inner.state.lock();
            (state.primary.take(), state.secondary.take())
        };
        for handle in primary.into_iter().chain(secondary) {
            if !handle.is_closed() {
                handle.close().await;
            }
        }
        debug!("Session closed");
    }
}

impl Inner {
    fn current(&self) -> Option<ProtocolHandle> {
        self.state.lock().current()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn in_transaction(&self) -> bool {
        self.current().map(|h| h.in_transaction()).unwrap_or(false)
    }

    async fn initial_connect(self: &Arc<Self>) -> FailoverResult<()> {
        let _guard = self.session_lock.lock().await;
        let mut filter = match self.policy {
            Policy::MasterOnly => SearchFilter::primary(),
            Policy::PrimaryReplica => SearchFilter::both(),
        };

        self.blacklist.prune(self.options.blacklist_timeout()).await;
        let result = self
            .search
            .search(self.topology.hosts(), &self.blacklist, &mut filter, self.as_ref())
            .await;

        if let Err(e) = result {
            let now = Instant::now();
            {
                let mut state = self.state.lock();
                if state.primary.is_none() && state.secondary.is_none() {
                    return Err(e);
                }
                if filter.need_primary {
                    state.failover.mark_primary_failed(now);
                    state.active = ActiveRole::Secondary;
                }
                if filter.need_replica {
                    state.failover.mark_secondary_failed(now);
                }
            }
            warn!("Session opened without every role: {}", e);
            self.arm_fail_loop(false);
        }

        Ok(())
    }

    /// Per-operation bookkeeping before the operation runs
    fn pre_execute(self: &Arc<Self>, operation: &Operation) {
        if operation.is_query() {
            self.state.lock().failover.count_query();
        }

        if self.policy == Policy::PrimaryReplica && self.should_reconnect() {
            self.spawn_reconnect();
        }
    }

    /// Try to replace failed connections without blocking the caller
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            {
                let _guard = inner.session_lock.lock().await;
                if !inner.is_closed() && inner.should_reconnect() {
                    if let Err(e) = inner.reconnect().await {
                        debug!("Background reconnection failed: {}", e);
                    }
                }
            }
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    fn should_reconnect(&self) -> bool {
        let in_transaction = self.in_transaction();
        let state = self.state.lock();
        match self.policy {
            Policy::MasterOnly => state.failover.should_reconnect_master_only(&self.options),
            Policy::PrimaryReplica => {
                state
                    .failover
                    .should_reconnect_replication(Instant::now(), &self.options, in_transaction)
            }
        }
    }

    /// Caller holds `session_lock`
    async fn reconnect(&self) -> FailoverResult<()> {
        match self.policy {
            Policy::MasterOnly => self.reconnect_master_only().await,
            Policy::PrimaryReplica => self.reconnect_replication().await,
        }
    }

    /// Search for the given roles after evicting stale blacklist entries.
    /// Caller holds `session_lock`.
    async fn search_roles(&self, need_primary: bool, need_replica: bool) -> FailoverResult<()> {
        if !need_primary && !need_replica {
            return Ok(());
        }

        self.blacklist.prune(self.options.blacklist_timeout()).await;
        let mut filter = SearchFilter::new(need_primary, need_replica);
        self.search
            .search(self.topology.hosts(), &self.blacklist, &mut filter, self)
            .await
    }

    /// Caller holds `session_lock`
    async fn handle_failover(
        self: &Arc<Self>,
        failed: &ProtocolHandle,
        operation: Option<&Operation>,
    ) -> ReplayOutcome {
        let (current, active) = {
            let state = self.state.lock();
            (state.current(), state.active)
        };

        let current = match current {
            Some(current) => current,
            None => return ReplayOutcome::Unrecovered,
        };

        if !Arc::ptr_eq(&current, failed) {
            debug!(
                "Connection already switched to {}, replaying there",
                current.host_address()
            );
            return replay::relaunch(operation, current.as_ref()).await;
        }

        let host = failed.host_address().clone();
        match active {
            ActiveRole::Primary => {
                let newly_failed = {
                    let mut state = self.state.lock();
                    let newly_failed = state.failover.mark_primary_failed(Instant::now());
                    if newly_failed && operation.map(|op| op.is_query()).unwrap_or(false) {
                        state.failover.count_query();
                    }
                    newly_failed
                };
                if newly_failed {
                    debug!("Handling new primary failure on {}", host);
                    self.blacklist.add(&host).await;
                }

                match self.policy {
                    Policy::MasterOnly => self.primary_fail_master_only(operation).await,
                    Policy::PrimaryReplica => self.primary_fail_replication(operation, true).await,
                }
            }
            ActiveRole::Secondary => {
                let newly_failed = self
                    .state
                    .lock()
                    .failover
                    .mark_secondary_failed(Instant::now());
                if newly_failed {
                    debug!("Handling new secondary failure on {}", host);
                    self.blacklist.add(&host).await;
                }

                match self.policy {
                    Policy::MasterOnly => ReplayOutcome::Unrecovered,
                    Policy::PrimaryReplica => self.secondary_fail_replication(operation).await,
                }
            }
        }
    }

    /// Record a primary failure and blacklist its host on a new transition
    async fn fail_primary(&self, host: &HostAddress) {
        let newly_failed = self.state.lock().failover.mark_primary_failed(Instant::now());
        if newly_failed {
            self.blacklist.add(host).await;
        }
    }

    /// Record a secondary failure and blacklist its host on a new transition
    async fn fail_secondary(&self, host: &HostAddress) {
        let newly_failed = self.state.lock().failover.mark_secondary_failed(Instant::now());
        if newly_failed {
            self.blacklist.add(host).await;
        }
    }

    /// Clear a primary failure after its connection answered a ping
    async fn primary_recovered(&self, host: &HostAddress) {
        self.state.lock().failover.reset_primary();
        self.blacklist.remove(host).await;
        info!("Primary {} connection re-established", host);
    }

    async fn secondary_recovered(&self, host: &HostAddress) {
        self.state.lock().failover.reset_secondary();
        self.blacklist.remove(host).await;
        info!("Secondary {} connection re-established", host);
    }

    /// Replay on whatever connection is current now
    async fn replay_on_current(&self, operation: Option<&Operation>) -> ReplayOutcome {
        match self.current() {
            Some(current) => replay::relaunch(operation, current.as_ref()).await,
            None => ReplayOutcome::Unrecovered,
        }
    }

    fn log_recovery(&self, role: &str, host: &HostAddress, failed_at: Option<Instant>) {
        match failed_at {
            Some(at) => info!(
                "New {} {} connection established after {}",
                role,
                host,
                crate::utils::format_duration(at.elapsed())
            ),
            None => info!("New {} {} connection established", role, host),
        }
    }

    /// Arm the failover loop unless it already runs
    fn arm_fail_loop(self: &Arc<Self>, now: bool) {
        if self.is_closed() {
            return;
        }

        let weak = Arc::downgrade(self);
        let initial_delay = if now { Duration::ZERO } else { FAIL_LOOP_PERIOD };
        self.fail_loop.arm(initial_delay, FAIL_LOOP_PERIOD, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.fail_tick().await,
                    None => LoopControl::Stop,
                }
            }
        });
    }

    async fn fail_tick(&self) -> LoopControl {
        let _guard = self.session_lock.lock().await;
        if self.is_closed() {
            return self.stop_fail_loop();
        }

        if !self.state.lock().failover.any_failed() {
            return self.stop_fail_loop();
        }

        if self.should_reconnect() {
            match self.reconnect().await {
                Ok(()) => {
                    debug!("Failover loop restored every role");
                    return self.stop_fail_loop();
                }
                Err(e) => debug!("Failover loop search failed: {}", e),
            }
        }

        let (exhausted, attempts) = {
            let state = self.state.lock();
            let exhausted = match self.policy {
                Policy::MasterOnly => state.failover.master_only_exhausted(&self.options),
                Policy::PrimaryReplica => state.failover.replication_exhausted(&self.options),
            };
            (exhausted, state.failover.connection_attempts())
        };
        if exhausted {
            debug!("Stopping failover loop after {} attempts", attempts);
            return self.stop_fail_loop();
        }

        LoopControl::Continue
    }

    /// Release the failover loop while `session_lock` is still held, so a
    /// failure recorded right after this tick can arm a fresh loop
    fn stop_fail_loop(&self) -> LoopControl {
        self.fail_loop.cancel();
        LoopControl::Stop
    }

    /// Restart the idle countdown of the ping loop
    fn touch_ping_loop(self: &Arc<Self>) {
        if self.policy != Policy::PrimaryReplica || self.is_closed() {
            return;
        }
        let idle = match self.options.valid_connection_timeout() {
            Some(idle) => idle,
            None => return,
        };

        let weak: Weak<Inner> = Arc::downgrade(self);
        self.ping_loop.restart(idle, idle, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.ping_tick().await,
                    None => LoopControl::Stop,
                }
            }
        });
    }

    async fn ping_tick(self: Arc<Self>) -> LoopControl {
        let _guard = self.session_lock.lock().await;
        if self.is_closed() {
            return LoopControl::Stop;
        }

        let primary = {
            let state = self.state.lock();
            if state.failover.primary_failed() {
                return LoopControl::Continue;
            }
            state.primary.clone()
        };
        let primary = match primary {
            Some(primary) => primary,
            None => return LoopControl::Continue,
        };

        let checker = PrimaryRoleChecker::new(self.search_timeout());
        let status = crate::health::check_with_timeout(&checker, primary.as_ref()).await;
        if !status.is_healthy() {
            warn!("Primary {} failed health check: {}", primary.host_address(), status);
            self.fail_primary(primary.host_address()).await;
            self.primary_fail_replication(None, false).await;
        }

        LoopControl::Continue
    }

    fn search_timeout(&self) -> Duration {
        self.options
            .valid_connection_timeout()
            .unwrap_or(Duration::from_secs(5))
    }
}

#[async_trait]
impl SearchListener for Inner {
    async fn found_primary(&self, handle: ProtocolHandle) {
        match self.policy {
            Policy::MasterOnly => self.found_primary_master_only(handle).await,
            Policy::PrimaryReplica => self.found_primary_replication(handle).await,
        }
    }

    async fn found_replica(&self, handle: ProtocolHandle) {
        match self.policy {
            Policy::MasterOnly => {
                debug!("Ignoring replica {} in master-only mode", handle.host_address());
                handle.close().await;
            }
            Policy::PrimaryReplica => self.found_replica_replication(handle).await,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.fail_loop.cancel();
        self.ping_loop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::MockCluster;

    fn options() -> FailoverOptions {
        FailoverOptions {
            valid_connection_timeout_sec: 0,
            ..FailoverOptions::default()
        }
    }

    async fn replication_session(replicas: usize) -> (MockCluster, Vec<HostAddress>, FailoverSession) {
        let (cluster, hosts) = MockCluster::replication(replicas);
        let session = FailoverSession::connect_with_blacklist(
            Topology::new(HaMode::Replication, hosts.clone()),
            options(),
            Arc::new(cluster.connector()),
            Blacklist::new(),
        )
        .await
        .unwrap();
        (cluster, hosts, session)
    }

    #[test]
    fn test_policy_for_mode() {
        assert_eq!(Policy::for_mode(HaMode::MasterOnly), Policy::MasterOnly);
        assert_eq!(Policy::for_mode(HaMode::Replication), Policy::PrimaryReplica);
        assert_eq!(Policy::for_mode(HaMode::Aurora), Policy::PrimaryReplica);
    }

    #[tokio::test]
    async fn test_connect_opens_both_roles() {
        let (_cluster, hosts, session) = replication_session(2).await;
        let status = session.status();

        assert_eq!(status.active, ActiveRole::Primary);
        assert_eq!(status.current_host, Some(hosts[0].clone()));
        assert!(hosts[1..].contains(status.secondary_host.as_ref().unwrap()));
        assert!(!status.read_only);
        assert!(!status.fail_loop_armed);
        session.close().await;
    }

    #[tokio::test]
    async fn test_connect_without_primary_starts_read_only() {
        let (cluster, hosts) = MockCluster::replication(1);
        cluster.stop(&hosts[0]);

        let session = FailoverSession::connect_with_blacklist(
            Topology::new(HaMode::Replication, hosts.clone()),
            options(),
            Arc::new(cluster.connector()),
            Blacklist::new(),
        )
        .await
        .unwrap();

        let status = session.status();
        assert!(status.primary_failed);
        assert_eq!(status.current_host, Some(hosts[1].clone()));
        assert!(session.is_read_only());
        assert!(status.fail_loop_armed);
        session.close().await;
    }

    #[tokio::test]
    async fn test_connect_fails_when_nothing_reachable() {
        let (cluster, hosts) = MockCluster::replication(1);
        for host in &hosts {
            cluster.stop(host);
        }

        let result = FailoverSession::connect_with_blacklist(
            Topology::new(HaMode::Replication, hosts),
            options(),
            Arc::new(cluster.connector()),
            Blacklist::new(),
        )
        .await;

        assert!(matches!(result, Err(FailoverError::NoHostFound { .. })));
    }

    #[tokio::test]
    async fn test_query_errors_do_not_fail_over() {
        let (_cluster, hosts, session) = replication_session(1).await;
        session.switch_read_only(true).await.unwrap();

        let err = session
            .execute(Operation::query("INSERT INTO t VALUES (1)"))
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::Query { .. }));
        assert!(!session.status().secondary_failed);
        assert!(!session.blacklist().contains(&hosts[1]).await);
        session.close().await;
    }

    #[tokio::test]
    async fn test_found_secondary_replaces_old_handle() {
        let (cluster, hosts, session) = replication_session(2).await;
        let old = session.status().secondary_host.unwrap();
        let other = if old == hosts[1] { hosts[2].clone() } else { hosts[1].clone() };

        let handle = cluster.connector().connect(&other).await.unwrap();
        session.on_found_secondary(handle).await;

        let status = session.status();
        assert_eq!(status.secondary_host, Some(other));
        assert_eq!(status.active, ActiveRole::Primary);
        session.close().await;
    }

    #[tokio::test]
    async fn test_stopping_tick_releases_fail_loop() {
        let (_cluster, _hosts, session) = replication_session(1).await;
        let inner = session.inner.clone();

        inner.arm_fail_loop(false);
        assert!(session.status().fail_loop_armed);

        // Nothing is failed, so the tick stops and the slot is free before it returns
        assert_eq!(inner.fail_tick().await, LoopControl::Stop);
        assert!(!session.status().fail_loop_armed);

        inner.state.lock().failover.mark_secondary_failed(Instant::now());
        inner.arm_fail_loop(false);
        assert!(session.status().fail_loop_armed);
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_closes_connections() {
        let (_cluster, _hosts, session) = replication_session(1).await;
        let current = session.current().unwrap();

        session.close().await;
        assert!(current.is_closed());
        assert!(session.current().is_none());
        assert!(!session.status().fail_loop_armed);
    }
}
