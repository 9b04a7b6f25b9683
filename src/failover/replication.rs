/// Primary/replica policy: read/write splitting over two connections.
///
/// Also drives cluster-aware topologies, which differ only in how the search
/// engine discovers roles.
use super::replay::{self, ReplayOutcome};
use super::{ActiveRole, Inner};
use crate::error::{FailoverError, FailoverResult};
use crate::protocol::{Operation, ProtocolHandle};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

impl Inner {
    /// Recover from a failed primary connection.
    ///
    /// With `probe` the primary is pinged first and kept if it answers; the
    /// ping loop passes `false` because it has already found the primary unfit.
    /// Caller holds `session_lock`.
    pub(super) async fn primary_fail_replication(
        self: &Arc<Self>,
        operation: Option<&Operation>,
        probe: bool,
    ) -> ReplayOutcome {
        let primary = self.state.lock().primary.clone();

        if let Some(primary) = &primary {
            warn!("Primary {} connection failed", primary.host_address());
            if probe {
                if let Ok(true) = primary.ping().await {
                    self.primary_recovered(primary.host_address()).await;
                    return self.replay_on_current(operation).await;
                }
            }
            self.fail_primary(primary.host_address()).await;
        }

        let in_transaction = primary.as_ref().map(|p| p.in_transaction()).unwrap_or(false);
        if self.options.auto_reconnect && !in_transaction {
            if let Err(e) = self.reconnect_replication().await {
                debug!("Synchronous reconnection failed: {}", e);
            }
            if !self.state.lock().failover.primary_failed() {
                return self.replay_on_current(operation).await;
            }
        }

        let (secondary, secondary_failed, active) = {
            let state = self.state.lock();
            (
                state.secondary.clone(),
                state.failover.secondary_failed(),
                state.active,
            )
        };

        if secondary_failed {
            debug!("Secondary is already down");
        } else if let Some(secondary) = secondary {
            match secondary.ping().await {
                Ok(true) => {
                    // Read-only sessions already run on the secondary; its state is current
                    if active == ActiveRole::Primary {
                        debug!("Switching to secondary {}", secondary.host_address());
                        if let Some(primary) = &primary {
                            replay::sync_session_logged(primary.as_ref(), secondary.as_ref()).await;
                        }
                        self.state.lock().active = ActiveRole::Secondary;
                    }
                    self.arm_fail_loop(true);
                    return replay::relaunch(operation, secondary.as_ref()).await;
                }
                Ok(false) => debug!("Ping failed on secondary {}", secondary.host_address()),
                Err(_) => self.fail_secondary(secondary.host_address()).await,
            }
        }

        self.arm_fail_loop(true);
        ReplayOutcome::Unrecovered
    }

    /// Recover from a failed secondary connection. Caller holds `session_lock`.
    pub(super) async fn secondary_fail_replication(
        self: &Arc<Self>,
        operation: Option<&Operation>,
    ) -> ReplayOutcome {
        let (primary, secondary) = {
            let state = self.state.lock();
            (state.primary.clone(), state.secondary.clone())
        };

        if let Some(secondary) = &secondary {
            if let Ok(true) = secondary.ping().await {
                self.secondary_recovered(secondary.host_address()).await;
                return self.replay_on_current(operation).await;
            }
            self.fail_secondary(secondary.host_address()).await;
        }

        let primary_failed = self.state.lock().failover.primary_failed();
        if !primary_failed {
            if let Some(primary) = &primary {
                match primary.ping().await {
                    Ok(true) => {
                        debug!("Switching to primary {}", primary.host_address());
                        if let Some(secondary) = &secondary {
                            replay::sync_session_logged(secondary.as_ref(), primary.as_ref()).await;
                        }
                        self.state.lock().active = ActiveRole::Primary;
                        self.arm_fail_loop(true);
                        return replay::relaunch(operation, primary.as_ref()).await;
                    }
                    Ok(false) => debug!("Ping failed on primary {}", primary.host_address()),
                    Err(_) => self.fail_primary(primary.host_address()).await,
                }
            }
        }

        if self.options.auto_reconnect {
            if let Err(e) = self.reconnect_replication().await {
                debug!("Synchronous reconnection failed: {}", e);
            }
            let (any_failed, secondary_failed) = {
                let state = self.state.lock();
                (state.failover.any_failed(), state.failover.secondary_failed())
            };
            if any_failed {
                self.arm_fail_loop(false);
            }
            // A secondary may have been found even if the primary is still missing
            if !secondary_failed {
                return self.replay_on_current(operation).await;
            }
            return ReplayOutcome::Unrecovered;
        }

        self.arm_fail_loop(true);
        ReplayOutcome::Unrecovered
    }

    /// Search again for every failed role. Caller holds `session_lock`.
    pub(super) async fn reconnect_replication(&self) -> FailoverResult<()> {
        let (attempts, need_primary, need_replica) = {
            let mut state = self.state.lock();
            let attempts = state.failover.record_attempt(Instant::now());
            (
                attempts,
                state.failover.primary_failed(),
                state.failover.secondary_failed(),
            )
        };

        if attempts >= self.options.retries_all_down {
            return Err(FailoverError::TooManyAttempts { attempts });
        }

        debug!(
            "Reconnection attempt {} (primary={}, replica={})",
            attempts, need_primary, need_replica
        );
        self.search_roles(need_primary, need_replica).await
    }

    pub(super) async fn found_primary_replication(&self, handle: ProtocolHandle) {
        let (old, current, read_only, failed_at) = {
            let state = self.state.lock();
            (
                state.primary.clone(),
                state.current(),
                state.failover.read_only_requested(),
                state.failover.primary_failed_at(),
            )
        };

        if !read_only {
            if let Some(current) = &current {
                replay::sync_session_logged(current.as_ref(), handle.as_ref()).await;
            }
        }

        {
            let mut state = self.state.lock();
            state.primary = Some(handle.clone());
            if !read_only {
                state.active = ActiveRole::Primary;
            }
            state.failover.reset_primary();
        }

        if let Some(old) = old.filter(|old| !Arc::ptr_eq(old, &handle)) {
            old.close().await;
        }
        self.log_recovery("primary", handle.host_address(), failed_at);
    }

    pub(super) async fn found_replica_replication(&self, handle: ProtocolHandle) {
        let (old, current, switch, failed_at) = {
            let state = self.state.lock();
            (
                state.secondary.clone(),
                state.current(),
                state.failover.read_only_requested() || state.failover.primary_failed(),
                state.failover.secondary_failed_at(),
            )
        };

        if switch {
            if let Some(current) = &current {
                replay::sync_session_logged(current.as_ref(), handle.as_ref()).await;
            }
        }

        {
            let mut state = self.state.lock();
            state.secondary = Some(handle.clone());
            if switch {
                state.active = ActiveRole::Secondary;
            }
            state.failover.reset_secondary();
        }

        if let Some(old) = old.filter(|old| !Arc::ptr_eq(old, &handle)) {
            old.close().await;
        }
        self.log_recovery("secondary", handle.host_address(), failed_at);
    }

    /// Caller holds `session_lock`
    pub(super) async fn switch_read_only_replication(
        self: &Arc<Self>,
        read_only: bool,
    ) -> FailoverResult<()> {
        let (current, requested, active) = {
            let state = self.state.lock();
            (state.current(), state.failover.read_only_requested(), state.active)
        };

        if read_only == requested {
            return Ok(());
        }
        if current.as_ref().map(|c| c.in_transaction()).unwrap_or(false) {
            return Err(FailoverError::InTransaction);
        }

        self.state.lock().failover.set_read_only_requested(read_only);
        debug!("Switching to read-only={}", read_only);

        let (primary, secondary, primary_failed, secondary_failed) = {
            let state = self.state.lock();
            (
                state.primary.clone(),
                state.secondary.clone(),
                state.failover.primary_failed(),
                state.failover.secondary_failed(),
            )
        };

        if read_only {
            if active == ActiveRole::Primary && !secondary_failed {
                if let Some(secondary) = secondary {
                    if let Some(primary) = &primary {
                        replay::sync_session(primary.as_ref(), secondary.as_ref()).await?;
                    }
                    self.state.lock().active = ActiveRole::Secondary;
                    replay::set_session_read_only(secondary.as_ref(), true).await?;
                    debug!("Current connection is now secondary {}", secondary.host_address());
                }
            }
            return Ok(());
        }

        if active == ActiveRole::Primary {
            return Ok(());
        }

        if !primary_failed {
            if let Some(primary) = primary {
                if let Some(secondary) = &secondary {
                    replay::sync_session(secondary.as_ref(), primary.as_ref()).await?;
                }
                self.state.lock().active = ActiveRole::Primary;
                debug!("Current connection is now primary {}", primary.host_address());
                return Ok(());
            }
        }

        if self.options.auto_reconnect {
            match self.reconnect_replication().await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("Reconnection for read-write routing failed: {}", e),
            }
            if self.state.lock().active == ActiveRole::Primary {
                return Ok(());
            }
        }

        self.arm_fail_loop(false);
        Err(FailoverError::NoPrimaryAvailable)
    }
}
