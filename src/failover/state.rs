/// Failure bookkeeping for one session
///
/// Pure state: no I/O, no locking. The session mutates it under its own lock
/// and the policies read it to decide when to retry.
use crate::config::FailoverOptions;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct FailoverState {
    primary_failed: bool,
    secondary_failed: bool,
    primary_failed_at: Option<Instant>,
    secondary_failed_at: Option<Instant>,
    connection_attempts: u32,
    queries_since_failover: u32,
    last_retry_at: Option<Instant>,
    read_only_requested: bool,
}

impl FailoverState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a primary failure. Returns `true` only for a new transition,
    /// in which case the caller blacklists the host.
    pub fn mark_primary_failed(&mut self, now: Instant) -> bool {
        if self.primary_failed {
            return false;
        }
        self.primary_failed = true;
        self.primary_failed_at = Some(now);
        self.connection_attempts = 0;
        true
    }

    /// Record a secondary failure. Same contract as [`Self::mark_primary_failed`].
    pub fn mark_secondary_failed(&mut self, now: Instant) -> bool {
        if self.secondary_failed {
            return false;
        }
        self.secondary_failed = true;
        self.secondary_failed_at = Some(now);
        self.connection_attempts = 0;
        true
    }

    /// Clear the primary track after a primary has been found
    pub fn reset_primary(&mut self) {
        self.primary_failed = false;
        self.primary_failed_at = None;
        self.connection_attempts = 0;
        self.last_retry_at = None;
        self.queries_since_failover = 0;
    }

    /// Clear the secondary track after a secondary has been found
    pub fn reset_secondary(&mut self) {
        self.secondary_failed = false;
        self.secondary_failed_at = None;
        self.connection_attempts = 0;
        self.last_retry_at = None;
    }

    pub fn primary_failed(&self) -> bool {
        self.primary_failed
    }

    pub fn secondary_failed(&self) -> bool {
        self.secondary_failed
    }

    pub fn any_failed(&self) -> bool {
        self.primary_failed || self.secondary_failed
    }

    pub fn primary_failed_at(&self) -> Option<Instant> {
        self.primary_failed_at
    }

    pub fn secondary_failed_at(&self) -> Option<Instant> {
        self.secondary_failed_at
    }

    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts
    }

    pub fn queries_since_failover(&self) -> u32 {
        self.queries_since_failover
    }

    pub fn last_retry_at(&self) -> Option<Instant> {
        self.last_retry_at
    }

    /// Count one query issued while the primary is down
    pub fn count_query(&mut self) {
        if self.primary_failed {
            self.queries_since_failover += 1;
        }
    }

    /// Count one reconnection attempt; returns the new total
    pub fn record_attempt(&mut self, now: Instant) -> u32 {
        self.connection_attempts += 1;
        self.last_retry_at = Some(now);
        self.connection_attempts
    }

    pub fn read_only_requested(&self) -> bool {
        self.read_only_requested
    }

    pub fn set_read_only_requested(&mut self, requested: bool) {
        self.read_only_requested = requested;
    }

    /// Retry rule of the primary/replica policy.
    ///
    /// A failed primary is retried after enough queries or enough time,
    /// whichever comes first; a failed secondary only after enough time.
    pub fn should_reconnect_replication(
        &self,
        now: Instant,
        options: &FailoverOptions,
        in_transaction: bool,
    ) -> bool {
        if !self.any_failed() || in_transaction {
            return false;
        }
        if self.connection_attempts > options.retries_all_down {
            return false;
        }

        let retry_after = Duration::from_secs(options.seconds_before_retry_master);
        let elapsed = |at: Option<Instant>| {
            at.map(|at| now.saturating_duration_since(at) >= retry_after)
                .unwrap_or(false)
        };

        if self.primary_failed
            && (self.queries_since_failover >= options.queries_before_retry_master
                || elapsed(self.primary_failed_at))
        {
            return true;
        }

        self.secondary_failed && elapsed(self.secondary_failed_at)
    }

    /// Retry rule of the master-only policy: bounded by `max_reconnects`
    pub fn should_reconnect_master_only(&self, options: &FailoverOptions) -> bool {
        self.primary_failed && self.connection_attempts < options.max_reconnects
    }

    /// Whether the master-only failover loop has spent its budget
    pub fn master_only_exhausted(&self, options: &FailoverOptions) -> bool {
        self.connection_attempts >= options.max_reconnects
    }

    /// Whether the primary/replica failover loop has spent its budget
    pub fn replication_exhausted(&self, options: &FailoverOptions) -> bool {
        self.connection_attempts > options.retries_all_down
    }
}
