/// Randomized host search
///
/// The engine probes candidate hosts in uniformly random order, discovers the
/// role each reachable host serves and hands qualifying connections to a
/// [`SearchListener`]. A full [`SearchEngine::search`] runs two passes: first
/// over the hosts that are not blacklisted, then, as a last resort, over the
/// hosts that were blacklisted when the search started.
use crate::core::{Blacklist, HaMode, HostAddress, HostRole};
use crate::error::{FailoverError, FailoverResult};
use crate::protocol::{discover_role, Connector, ProtocolHandle};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

/// Roles a search still has to find. Cleared in place as roles are satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchFilter {
    pub need_primary: bool,
    pub need_replica: bool,
}

impl SearchFilter {
    pub fn new(need_primary: bool, need_replica: bool) -> Self {
        Self {
            need_primary,
            need_replica,
        }
    }

    pub fn primary() -> Self {
        Self::new(true, false)
    }

    pub fn replica() -> Self {
        Self::new(false, true)
    }

    pub fn both() -> Self {
        Self::new(true, true)
    }

    /// Whether every requested role has been found
    pub fn is_satisfied(&self) -> bool {
        !self.need_primary && !self.need_replica
    }

    /// Whether a discovered role fulfils an outstanding need
    pub fn wants(&self, role: HostRole) -> bool {
        match role {
            HostRole::Primary => self.need_primary,
            HostRole::Replica => self.need_replica,
            HostRole::Unset => false,
        }
    }

    /// Whether a host is worth probing given its declared role
    pub fn accepts(&self, host: &HostAddress) -> bool {
        (self.need_primary && host.may_be_primary()) || (self.need_replica && host.may_be_replica())
    }

    fn clear(&mut self, role: HostRole) {
        match role {
            HostRole::Primary => self.need_primary = false,
            HostRole::Replica => self.need_replica = false,
            HostRole::Unset => {}
        }
    }
}

/// Receives the connections that won a role during a search
#[async_trait]
pub trait SearchListener: Send + Sync {
    async fn found_primary(&self, handle: ProtocolHandle);

    async fn found_replica(&self, handle: ProtocolHandle);
}

/// Probes candidate hosts through a [`Connector`]
#[derive(Clone)]
pub struct SearchEngine {
    connector: Arc<dyn Connector>,
    live_roles: bool,
}

impl SearchEngine {
    pub fn new(connector: Arc<dyn Connector>, mode: HaMode) -> Self {
        Self {
            connector,
            live_roles: mode.discovers_roles(),
        }
    }

    /// Two-pass search over `candidates`.
    ///
    /// Fails with [`FailoverError::NoHostFound`] naming the roles still missing
    /// once both passes are exhausted.
    pub async fn search(
        &self,
        candidates: &[HostAddress],
        blacklist: &Blacklist,
        filter: &mut SearchFilter,
        listener: &dyn SearchListener,
    ) -> FailoverResult<()> {
        let excluded = blacklist.snapshot().await;
        let (blacklisted, allowed): (Vec<HostAddress>, Vec<HostAddress>) = candidates
            .iter()
            .cloned()
            .partition(|host| excluded.contains(host));

        self.search_pass(allowed, blacklist, filter, listener).await;
        if filter.is_satisfied() {
            return Ok(());
        }

        if !blacklisted.is_empty() {
            debug!(
                "Retrying {} blacklisted host(s) as a last resort",
                blacklisted.len()
            );
            self.search_pass(blacklisted, blacklist, filter, listener).await;
            if filter.is_satisfied() {
                return Ok(());
            }
        }

        warn!(
            "Search exhausted {} candidate(s): primary missing={}, replica missing={}",
            candidates.len(),
            filter.need_primary,
            filter.need_replica
        );
        Err(FailoverError::no_host_found(filter.need_primary, filter.need_replica))
    }

    /// Probe `pool` in random order until the filter is satisfied or the pool is empty.
    ///
    /// Hosts that refuse the connection or fail the role check are blacklisted.
    pub async fn search_pass(
        &self,
        mut pool: Vec<HostAddress>,
        blacklist: &Blacklist,
        filter: &mut SearchFilter,
        listener: &dyn SearchListener,
    ) {
        pool.retain(|host| filter.accepts(host));

        while !pool.is_empty() && !filter.is_satisfied() {
            let index = rand::thread_rng().gen_range(0..pool.len());
            let host = pool.swap_remove(index);
            if !filter.accepts(&host) {
                continue;
            }

            let handle = match self.connector.connect(&host).await {
                Ok(handle) => handle,
                Err(e) => {
                    debug!("Probe of {} failed: {}", host, e);
                    blacklist.add(&host).await;
                    continue;
                }
            };

            let role = match discover_role(handle.as_ref(), self.live_roles).await {
                Ok(role) => role,
                Err(e) => {
                    debug!("Role check on {} failed: {}", host, e);
                    blacklist.add(&host).await;
                    handle.close().await;
                    continue;
                }
            };

            if !filter.wants(role) {
                debug!("{} serves {} which is not needed, closing", host, role);
                handle.close().await;
                continue;
            }

            filter.clear(role);
            debug!("Found {} on {}", role, host);
            match role {
                HostRole::Primary => listener.found_primary(handle).await,
                _ => listener.found_replica(handle).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Topology;
    use crate::protocol::mock::MockCluster;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recorder {
        primaries: Mutex<Vec<HostAddress>>,
        replicas: Mutex<Vec<HostAddress>>,
    }

    #[async_trait]
    impl SearchListener for Recorder {
        async fn found_primary(&self, handle: ProtocolHandle) {
            self.primaries.lock().push(handle.host_address().clone());
        }

        async fn found_replica(&self, handle: ProtocolHandle) {
            self.replicas.lock().push(handle.host_address().clone());
        }
    }

    fn engine(cluster: &MockCluster, mode: HaMode) -> SearchEngine {
        SearchEngine::new(Arc::new(cluster.connector()), mode)
    }

    #[tokio::test]
    async fn test_finds_both_roles() {
        let (cluster, hosts) = MockCluster::replication(2);
        let recorder = Recorder::default();
        let mut filter = SearchFilter::both();

        engine(&cluster, HaMode::Replication)
            .search(&hosts, &Blacklist::new(), &mut filter, &recorder)
            .await
            .unwrap();

        assert!(filter.is_satisfied());
        assert_eq!(*recorder.primaries.lock(), vec![hosts[0].clone()]);
        assert_eq!(recorder.replicas.lock().len(), 1);
        assert!(hosts[1..].contains(&recorder.replicas.lock()[0]));
    }

    #[tokio::test]
    async fn test_fallback_pass_ignores_blacklist() {
        let (cluster, hosts) = MockCluster::replication(2);
        let blacklist = Blacklist::new();
        for host in &hosts {
            blacklist.add(host).await;
        }

        let recorder = Recorder::default();
        let mut filter = SearchFilter::both();
        engine(&cluster, HaMode::Replication)
            .search(&hosts, &blacklist, &mut filter, &recorder)
            .await
            .unwrap();

        assert!(filter.is_satisfied());
        assert_eq!(recorder.primaries.lock().len(), 1);
        assert_eq!(recorder.replicas.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_primary_search_never_reports_replica() {
        let (cluster, hosts) = MockCluster::replication(3);
        let topology = Topology::new(HaMode::Aurora, hosts.clone());
        let search = engine(&cluster, HaMode::Aurora);

        for _ in 0..20 {
            let recorder = Recorder::default();
            let mut filter = SearchFilter::primary();
            search
                .search(topology.hosts(), &Blacklist::new(), &mut filter, &recorder)
                .await
                .unwrap();

            assert!(recorder.replicas.lock().is_empty());
            assert_eq!(*recorder.primaries.lock(), vec![hosts[0].clone()]);
        }
    }

    #[tokio::test]
    async fn test_unreachable_cluster_reports_missing_roles() {
        let (cluster, hosts) = MockCluster::replication(1);
        for host in &hosts {
            cluster.stop(host);
        }

        let blacklist = Blacklist::new();
        let mut filter = SearchFilter::both();
        let err = engine(&cluster, HaMode::Replication)
            .search(&hosts, &blacklist, &mut filter, &Recorder::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FailoverError::NoHostFound {
                primary: true,
                replica: true
            }
        ));
        assert_eq!(blacklist.len().await, 2);
    }

    #[tokio::test]
    async fn test_partial_result_keeps_found_role() {
        let (cluster, hosts) = MockCluster::replication(1);
        cluster.stop(&hosts[1]);

        let recorder = Recorder::default();
        let mut filter = SearchFilter::both();
        let err = engine(&cluster, HaMode::Replication)
            .search(&hosts, &Blacklist::new(), &mut filter, &recorder)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FailoverError::NoHostFound {
                primary: false,
                replica: true
            }
        ));
        assert_eq!(recorder.primaries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_blacklisted_host_skipped_while_others_reachable() {
        let (cluster, hosts) = MockCluster::replication(2);
        let blacklist = Blacklist::new();
        blacklist.add(&hosts[1]).await;
        let search = engine(&cluster, HaMode::Replication);

        for _ in 0..30 {
            let recorder = Recorder::default();
            let mut filter = SearchFilter::replica();
            search.search(&hosts, &blacklist, &mut filter, &recorder).await.unwrap();
            assert_eq!(*recorder.replicas.lock(), vec![hosts[2].clone()]);
        }

        assert_eq!(cluster.connect_attempts(&hosts[1]), 0);
        assert_eq!(cluster.connect_attempts(&hosts[0]), 0);
    }

    #[tokio::test]
    async fn test_replica_selection_is_spread() {
        let (cluster, hosts) = MockCluster::replication(3);
        let search = engine(&cluster, HaMode::Replication);
        let mut picks: HashMap<HostAddress, usize> = HashMap::new();

        for _ in 0..300 {
            let recorder = Recorder::default();
            let mut filter = SearchFilter::replica();
            search
                .search(&hosts, &Blacklist::new(), &mut filter, &recorder)
                .await
                .unwrap();
            let found = recorder.replicas.lock()[0].clone();
            *picks.entry(found).or_default() += 1;
        }

        assert_eq!(picks.len(), 3);
        assert!(!picks.contains_key(&hosts[0]));
    }

    #[tokio::test]
    async fn test_live_role_discovery_follows_promotion() {
        let (cluster, hosts) = MockCluster::replication(2);
        cluster.promote(&hosts[2]);
        let topology = Topology::new(HaMode::Aurora, hosts.clone());

        let recorder = Recorder::default();
        let mut filter = SearchFilter::primary();
        engine(&cluster, HaMode::Aurora)
            .search(topology.hosts(), &Blacklist::new(), &mut filter, &recorder)
            .await
            .unwrap();

        assert_eq!(*recorder.primaries.lock(), vec![hosts[2].clone()]);
    }

    #[test]
    fn test_filter_bookkeeping() {
        let mut filter = SearchFilter::both();
        assert!(filter.wants(HostRole::Primary));
        filter.clear(HostRole::Primary);
        assert!(!filter.wants(HostRole::Primary));
        assert!(!filter.is_satisfied());
        assert!(!filter.accepts(&HostAddress::primary("db1", 3306)));
        assert!(filter.accepts(&HostAddress::replica("db2", 3306)));
        filter.clear(HostRole::Replica);
        assert!(filter.is_satisfied());
    }
}
