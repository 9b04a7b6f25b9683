/// Background health checking and scheduled retry loops
///
/// A session owns two [`ScheduledLoop`]s: the failover loop, which retries
/// failed roles every 250 ms, and the ping loop, which verifies an idle
/// primary. Both are plain tokio tasks stopped through a cancellation token.
use crate::protocol::Protocol;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay between two ticks of the failover loop
pub const FAIL_LOOP_PERIOD: Duration = Duration::from_millis(250);

/// Health status of a connection
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy connection
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform health check on a connection
    async fn check_health(&self, handle: &dyn Protocol) -> HealthStatus;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Checks that a connection is alive and still serves the primary role.
///
/// A server can stay reachable after being demoted, so a successful ping
/// alone is not enough.
#[derive(Debug, Clone)]
pub struct PrimaryRoleChecker {
    timeout: Duration,
}

impl PrimaryRoleChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PrimaryRoleChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl HealthChecker for PrimaryRoleChecker {
    async fn check_health(&self, handle: &dyn Protocol) -> HealthStatus {
        match handle.ping().await {
            Ok(true) => {}
            Ok(false) => {
                return HealthStatus::Unhealthy {
                    reason: "ping failed".to_string(),
                }
            }
            Err(e) => {
                return HealthStatus::Unhealthy {
                    reason: e.to_string(),
                }
            }
        }

        match handle.check_if_primary().await {
            Ok(true) => HealthStatus::Healthy,
            Ok(false) => HealthStatus::Unhealthy {
                reason: "host no longer accepts writes".to_string(),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn check_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Perform health check with timeout
pub async fn check_with_timeout(checker: &dyn HealthChecker, handle: &dyn Protocol) -> HealthStatus {
    match timeout(checker.check_timeout(), checker.check_health(handle)).await {
        Ok(status) => status,
        Err(_) => HealthStatus::Timeout,
    }
}

/// What a loop does after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

#[derive(Debug, Default)]
struct LoopSlot {
    generation: u64,
    token: Option<CancellationToken>,
}

/// At most one outstanding periodic task, cancellable at any time
#[derive(Debug, Clone)]
pub struct ScheduledLoop {
    name: &'static str,
    slot: Arc<Mutex<LoopSlot>>,
}

impl ScheduledLoop {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(LoopSlot::default())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().token.is_some()
    }

    /// Start running `tick` with a fixed `period` between the end of one tick
    /// and the start of the next, the first one after `initial_delay`.
    ///
    /// Returns `false` without doing anything if the loop is already armed.
    pub fn arm<F, Fut>(&self, initial_delay: Duration, period: Duration, tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = LoopControl> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if slot.token.is_some() {
            return false;
        }
        slot.generation += 1;
        let token = CancellationToken::new();
        slot.token = Some(token.clone());
        let generation = slot.generation;
        drop(slot);

        debug!("Arming {} loop", self.name);
        tokio::spawn(run_loop(
            self.name,
            self.slot.clone(),
            generation,
            token,
            initial_delay,
            period,
            tick,
        ));
        true
    }

    /// Cancel any pending run and arm again, restarting the initial delay
    pub fn restart<F, Fut>(&self, initial_delay: Duration, period: Duration, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = LoopControl> + Send + 'static,
    {
        self.cancel();
        self.arm(initial_delay, period, tick);
    }

    /// Stop the loop. A tick already running finishes first.
    pub fn cancel(&self) {
        if let Some(token) = self.slot.lock().token.take() {
            token.cancel();
        }
    }
}

async fn run_loop<F, Fut>(
    name: &'static str,
    slot: Arc<Mutex<LoopSlot>>,
    generation: u64,
    token: CancellationToken,
    initial_delay: Duration,
    period: Duration,
    mut tick: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = LoopControl> + Send + 'static,
{
    let mut delay = initial_delay;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("{} loop cancelled", name);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if tick().await == LoopControl::Stop {
            break;
        }
        delay = period;
    }

    let mut slot = slot.lock();
    if slot.generation == generation {
        slot.token = None;
    }
    debug!("{} loop stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HostAddress;
    use crate::protocol::mock::MockCluster;
    use crate::protocol::Connector;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counting_tick(
        counter: Arc<AtomicUsize>,
        stop_after: usize,
    ) -> impl FnMut() -> futures::future::Ready<LoopControl> + Send + 'static {
        move || {
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            futures::future::ready(if count >= stop_after {
                LoopControl::Stop
            } else {
                LoopControl::Continue
            })
        }
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert_eq!(
            HealthStatus::Unhealthy {
                reason: "test".to_string()
            }
            .to_string(),
            "Unhealthy: test"
        );
        assert_eq!(HealthStatus::Timeout.to_string(), "Timeout");
        assert!(!HealthStatus::Timeout.is_healthy());
    }

    #[tokio::test]
    async fn test_primary_checker_detects_demotion() {
        let (cluster, hosts) = MockCluster::replication(1);
        let handle = cluster.connector().connect(&hosts[0]).await.unwrap();
        let checker = PrimaryRoleChecker::default();

        assert!(check_with_timeout(&checker, handle.as_ref()).await.is_healthy());

        cluster.demote(&hosts[0]);
        let status = check_with_timeout(&checker, handle.as_ref()).await;
        assert!(matches!(status, HealthStatus::Unhealthy { .. }));
    }

    #[tokio::test]
    async fn test_primary_checker_detects_dead_host() {
        let (cluster, hosts) = MockCluster::replication(0);
        let handle = cluster.connector().connect(&hosts[0]).await.unwrap();
        cluster.stop(&HostAddress::primary("mock-0", 3306));

        let status = check_with_timeout(&PrimaryRoleChecker::default(), handle.as_ref()).await;
        assert!(!status.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduled = ScheduledLoop::new("test");

        assert!(scheduled.arm(Duration::ZERO, FAIL_LOOP_PERIOD, counting_tick(counter.clone(), 3)));
        assert!(scheduled.is_armed());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!scheduled.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arming_twice_is_a_no_op() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let scheduled = ScheduledLoop::new("test");

        assert!(scheduled.arm(Duration::ZERO, FAIL_LOOP_PERIOD, counting_tick(first.clone(), 1000)));
        assert!(!scheduled.arm(Duration::ZERO, FAIL_LOOP_PERIOD, counting_tick(second.clone(), 1000)));

        tokio::time::sleep(Duration::from_millis(600)).await;
        scheduled.cancel();

        assert!(first.load(Ordering::SeqCst) >= 2);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert!(!scheduled.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_postpones_first_tick() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduled = ScheduledLoop::new("ping");
        let idle = Duration::from_secs(10);

        scheduled.arm(idle, idle, counting_tick(counter.clone(), 1000));
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            scheduled.restart(idle, idle, counting_tick(counter.clone(), 1000));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduled.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_from_a_stopping_tick() {
        let scheduled = ScheduledLoop::new("failover");
        let rearmed = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicUsize::new(0));

        let handle = scheduled.clone();
        let (flag, counter) = (rearmed.clone(), second.clone());
        scheduled.arm(Duration::ZERO, FAIL_LOOP_PERIOD, move || {
            handle.cancel();
            let armed = handle.arm(Duration::ZERO, FAIL_LOOP_PERIOD, counting_tick(counter.clone(), 1000));
            flag.store(armed, Ordering::SeqCst);
            futures::future::ready(LoopControl::Stop)
        });

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rearmed.load(Ordering::SeqCst));
        assert!(scheduled.is_armed());
        assert!(second.load(Ordering::SeqCst) >= 2);
        scheduled.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_loop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduled = ScheduledLoop::new("test");

        scheduled.arm(Duration::from_secs(1), FAIL_LOOP_PERIOD, counting_tick(counter.clone(), 1000));
        scheduled.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(scheduled.arm(Duration::ZERO, FAIL_LOOP_PERIOD, counting_tick(counter.clone(), 1)));
    }
}
