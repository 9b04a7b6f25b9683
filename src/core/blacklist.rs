/// Time-bounded exclusion set for unreachable hosts
use crate::core::HostAddress;
use fnv::FnvHashMap;
use lazy_static::lazy_static;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

lazy_static! {
    static ref GLOBAL: Blacklist = Blacklist::new();
}

/// Shared map of excluded hosts to the instant they were excluded.
///
/// Cloning yields another handle on the same map. Sessions of one process share
/// [`Blacklist::global`]; tests build isolated instances with [`Blacklist::new`].
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    entries: Arc<RwLock<FnvHashMap<HostAddress, Instant>>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(FnvHashMap::default())),
        }
    }

    /// The process-wide blacklist
    pub fn global() -> Blacklist {
        GLOBAL.clone()
    }

    /// Exclude a host, restarting its exclusion period
    pub async fn add(&self, host: &HostAddress) {
        self.add_at(host, Instant::now()).await;
    }

    pub async fn add_at(&self, host: &HostAddress, at: Instant) {
        let mut entries = self.entries.write().await;
        entries.insert(host.clone(), at);
        tracing::debug!("host {} added to blacklist", host);
    }

    /// Remove a host regardless of its age
    pub async fn remove(&self, host: &HostAddress) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(host).is_some()
    }

    pub async fn contains(&self, host: &HostAddress) -> bool {
        let entries = self.entries.read().await;
        entries.contains_key(host)
    }

    /// Evict entries excluded for at least `timeout`
    pub async fn prune(&self, timeout: Duration) -> usize {
        self.prune_at(Instant::now(), timeout).await
    }

    pub async fn prune_at(&self, now: Instant, timeout: Duration) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();

        entries.retain(|host, added_at| {
            let keep = now.saturating_duration_since(*added_at) < timeout;
            if !keep {
                tracing::debug!("host {} removed from blacklist", host);
            }
            keep
        });

        before - entries.len()
    }

    /// Hosts currently excluded
    pub async fn snapshot(&self) -> Vec<HostAddress> {
        let entries = self.entries.read().await;
        entries.keys().cloned().collect()
    }

    /// Keep only the candidates that are not excluded
    pub async fn filter(&self, candidates: &[HostAddress]) -> Vec<HostAddress> {
        let entries = self.entries.read().await;
        candidates
            .iter()
            .filter(|host| !entries.contains_key(*host))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
    }
}
