/// Master-only policy: one writable connection, any host may take over
use super::replay::{self, ReplayOutcome};
use super::{ActiveRole, Inner};
use crate::error::{FailoverError, FailoverResult};
use crate::protocol::{Operation, ProtocolHandle};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

impl Inner {
    /// Caller holds `session_lock`
    pub(super) async fn primary_fail_master_only(
        self: &Arc<Self>,
        operation: Option<&Operation>,
    ) -> ReplayOutcome {
        let primary = self.state.lock().primary.clone();

        if let Some(primary) = &primary {
            if let Ok(true) = primary.ping().await {
                self.primary_recovered(primary.host_address()).await;
                return replay::relaunch(operation, primary.as_ref()).await;
            }
            self.fail_primary(primary.host_address()).await;
        }

        let (should_reconnect, attempts) = {
            let state = self.state.lock();
            (
                state.failover.should_reconnect_master_only(&self.options),
                state.failover.connection_attempts(),
            )
        };

        if self.options.auto_reconnect && should_reconnect {
            if self.topology.is_single_host() && attempts > 0 {
                debug!(
                    "Waiting {}s before reconnecting to the only host",
                    self.options.initial_timeout_sec
                );
                tokio::time::sleep(self.options.initial_timeout()).await;
            }

            let in_transaction = primary.as_ref().map(|p| p.in_transaction()).unwrap_or(false);
            if !in_transaction {
                match self.reconnect_master_only().await {
                    Ok(()) => return self.replay_on_current(operation).await,
                    Err(e) => debug!("Synchronous reconnection failed: {}", e),
                }
            }
        }

        self.arm_fail_loop(true);
        ReplayOutcome::Unrecovered
    }

    /// Caller holds `session_lock`
    pub(super) async fn reconnect_master_only(&self) -> FailoverResult<()> {
        let attempts = self.state.lock().failover.record_attempt(Instant::now());
        debug!("Master-only reconnection attempt {}", attempts);
        self.search_roles(true, false).await
    }

    pub(super) async fn found_primary_master_only(&self, handle: ProtocolHandle) {
        let (old, read_only, failed_at) = {
            let state = self.state.lock();
            (
                state.primary.clone(),
                state.failover.read_only_requested(),
                state.failover.primary_failed_at(),
            )
        };

        if let Some(old) = &old {
            replay::sync_session_logged(old.as_ref(), handle.as_ref()).await;
        }

        if read_only {
            handle.set_read_only(true);
            if let Err(e) = replay::set_session_read_only(handle.as_ref(), true).await {
                debug!(
                    "Error setting {} read-only after failover: {}",
                    handle.host_address(),
                    e
                );
            }
        }

        {
            let mut state = self.state.lock();
            state.primary = Some(handle.clone());
            state.active = ActiveRole::Primary;
            state.failover.reset_primary();
        }

        if let Some(old) = old.filter(|old| !Arc::ptr_eq(old, &handle)) {
            old.close().await;
        }
        self.log_recovery("primary", handle.host_address(), failed_at);
    }

    /// Caller holds `session_lock`
    pub(super) async fn switch_read_only_master_only(&self, read_only: bool) -> FailoverResult<()> {
        let (current, requested) = {
            let state = self.state.lock();
            (state.primary.clone(), state.failover.read_only_requested())
        };

        if let Some(current) = current {
            if read_only != requested && current.in_transaction() {
                return Err(FailoverError::InTransaction);
            }
            replay::set_session_read_only(current.as_ref(), read_only).await?;
            current.set_read_only(read_only);
        }

        self.state.lock().failover.set_read_only_requested(read_only);
        debug!("Session switched to read-only={}", read_only);
        Ok(())
    }
}
