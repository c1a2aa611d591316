//! Named, time-bounded cooperative leases.
//!
//! A lease is held while its heartbeat keeps landing within `ttl`. Losing
//! it (another owner took over after a missed heartbeat, or the store stayed
//! unreachable for a whole `ttl`) cancels [`Lease::lost`] and fires the
//! caller's `on_broken` callback once.

use skyway_core::Result;
use skyway_core::ports::LeaseRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_HEARTBEAT_FRACTION: u32 = 3;
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(10);

/// Issues leases on behalf of one process.
pub struct LeaseManager {
    repo: Arc<dyn LeaseRepository>,
    owner: String,
    heartbeat_fraction: u32,
}

impl LeaseManager {
    pub fn new(repo: Arc<dyn LeaseRepository>) -> Self {
        Self {
            repo,
            owner: format!("skyway-{}", Uuid::new_v4()),
            heartbeat_fraction: DEFAULT_HEARTBEAT_FRACTION,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Heartbeat every `ttl / fraction`.
    pub fn with_heartbeat_fraction(mut self, fraction: u32) -> Self {
        self.heartbeat_fraction = fraction.max(2);
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Try to take `name`. `None` means someone else holds it.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
        self.acquire_with(name, ttl, || {}).await
    }

    pub async fn acquire_with<F>(&self, name: &str, ttl: Duration, on_broken: F) -> Result<Option<Lease>>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.repo.try_acquire(name, &self.owner, ttl).await? {
            debug!(lease = %name, "Lease held elsewhere");
            return Ok(None);
        }

        let lost = CancellationToken::new();
        let period = (ttl / self.heartbeat_fraction).max(MIN_HEARTBEAT_PERIOD);
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.repo.clone(),
            name.to_string(),
            self.owner.clone(),
            ttl,
            period,
            lost.clone(),
            on_broken,
        ));
        debug!(lease = %name, owner = %self.owner, ttl_ms = ttl.as_millis() as u64, "Lease acquired");

        Ok(Some(Lease {
            name: name.to_string(),
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            heartbeat: Some(heartbeat),
            lost,
        }))
    }
}

async fn heartbeat_loop<F>(
    repo: Arc<dyn LeaseRepository>,
    name: String,
    owner: String,
    ttl: Duration,
    period: Duration,
    lost: CancellationToken,
    on_broken: F,
) where
    F: FnOnce() + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_ok = Instant::now();

    loop {
        ticker.tick().await;
        match repo.heartbeat(&name, &owner).await {
            Ok(true) => last_ok = Instant::now(),
            Ok(false) => {
                warn!(lease = %name, "Lease lost to another owner");
                break;
            }
            Err(e) if last_ok.elapsed() < ttl => {
                warn!(lease = %name, error = %e, "Lease heartbeat failed, retrying");
            }
            Err(e) => {
                warn!(lease = %name, error = %e, "Lease expired while the store was unreachable");
                break;
            }
        }
    }

    lost.cancel();
    on_broken();
}

/// A held lease. Dropping it releases it in the background.
pub struct Lease {
    name: String,
    owner: String,
    repo: Arc<dyn LeaseRepository>,
    heartbeat: Option<JoinHandle<()>>,
    lost: CancellationToken,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancelled once the lease is lost.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop heartbeating and let the next caller take the lease at once.
    pub async fn release(mut self) -> Result<()> {
        self.stop_heartbeat();
        self.repo.release(&self.name, &self.owner).await?;
        debug!(lease = %self.name, "Lease released");
        Ok(())
    }

    fn stop_heartbeat(&mut self) -> bool {
        match self.heartbeat.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.stop_heartbeat() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let repo = self.repo.clone();
        let name = std::mem::take(&mut self.name);
        let owner = std::mem::take(&mut self.owner);
        runtime.spawn(async move {
            if let Err(e) = repo.release(&name, &owner).await {
                debug!(lease = %name, error = %e, "Best-effort lease release failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skyway_db::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Grants every lease, then refuses the first heartbeat.
    struct StolenLeaseRepository;

    #[async_trait]
    impl LeaseRepository for StolenLeaseRepository {
        async fn try_acquire(&self, _: &str, _: &str, _: Duration) -> Result<bool> {
            Ok(true)
        }

        async fn heartbeat(&self, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }

        async fn release(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Grants every lease; the store is down afterwards.
    struct UnreachableLeaseRepository {
        heartbeats: AtomicUsize,
    }

    #[async_trait]
    impl LeaseRepository for UnreachableLeaseRepository {
        async fn try_acquire(&self, _: &str, _: &str, _: Duration) -> Result<bool> {
            Ok(true)
        }

        async fn heartbeat(&self, _: &str, _: &str) -> Result<bool> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            Err(skyway_core::Error::Network("connection refused".into()))
        }

        async fn release(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_owner_is_refused_until_release() {
        let store = Arc::new(MemoryStore::new());
        let a = LeaseManager::new(store.clone()).with_owner("a");
        let b = LeaseManager::new(store.clone()).with_owner("b");

        let lease = a.acquire("scheduler", Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(b.acquire("scheduler", Duration::from_secs(30)).await.unwrap().is_none());

        lease.release().await.unwrap();
        assert!(b.acquire("scheduler", Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_lease_past_ttl() {
        let store = Arc::new(MemoryStore::new());
        let a = LeaseManager::new(store.clone()).with_owner("a");
        let b = LeaseManager::new(store.clone()).with_owner("b");

        let lease = a.acquire("tracker", Duration::from_secs(3)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!lease.is_lost());
        assert!(b.acquire("tracker", Duration::from_secs(3)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_broken_fires_once_when_taken_over() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let manager = LeaseManager::new(Arc::new(StolenLeaseRepository));

        let lease = manager
            .acquire_with("checker", Duration::from_secs(3), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), lease.lost().cancelled())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_errors_tolerated_within_ttl() {
        let repo = Arc::new(UnreachableLeaseRepository { heartbeats: AtomicUsize::new(0) });
        let manager = LeaseManager::new(repo.clone());
        let lease = manager.acquire("gc", Duration::from_secs(3)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!lease.is_lost());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(lease.is_lost());
        assert!(repo.heartbeats.load(Ordering::SeqCst) >= 3);
    }
}
