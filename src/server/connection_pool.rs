//! Per-target IPMI session pools.
//!
//! A BMC exposes a single management channel, so every configured target
//! gets its own [`SessionPool`] with a tiny capacity (1 by default). The
//! [`SessionRegistry`] creates those pools lazily, on the first acquire for
//! a target, and is the only entry point the HTTP handlers use.
//!
//! Locking: the registry cache only guards the name -> pool map. Every pool
//! has its own lock around its idle set, checked-out count and waiter queue.
//! Opening and closing sessions (network I/O) never happens under either.

mod session_pool;

#[cfg(test)]
pub(crate) mod mock;

pub use session_pool::{PoolStats, PooledSession, SessionPool};

use crate::error::Error;
use crate::target::Target;
use log::{debug, info};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A live, authenticated session to one target.
pub trait Session: Send + 'static {
    /// Tear the session down. Failures are logged by the pool and dropped.
    fn close(self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Opens sessions. Called by a pool on a miss, outside of every lock.
pub trait Connector: Send + Sync + 'static {
    type Session: Session;
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(
        &self,
        target: &Target,
    ) -> impl Future<Output = Result<Self::Session, Self::Error>> + Send;
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Failed to open session to '{target}': {source}")]
    Factory {
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("No session to '{0}' became available before the acquire timeout")]
    Exhausted(String),

    #[error("Session pool for '{0}' is closed")]
    Closed(String),

    #[error("Acquiring a session to '{0}' was cancelled")]
    Cancelled(String),
}

impl PoolError {
    /// Whether retrying the same acquire later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Exhausted(_) | PoolError::Factory { .. })
    }
}

fn default_capacity() -> usize {
    1
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound of idle + checked-out sessions per target.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_idle_timeout")]
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default = "default_acquire_timeout")]
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    // Idle sessions are also evicted lazily on acquire.
    #[serde(default = "default_sweep_interval")]
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            idle_timeout: default_idle_timeout(),
            acquire_timeout: default_acquire_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl std::fmt::Display for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "capacity={} idle_timeout={} acquire_timeout={} sweep_interval={}",
            self.capacity,
            humantime::format_duration(self.idle_timeout),
            humantime::format_duration(self.acquire_timeout),
            humantime::format_duration(self.sweep_interval),
        )
    }
}

/// Process-wide directory of per-target pools.
pub struct SessionRegistry<C: Connector> {
    connector: Arc<C>,
    targets: HashMap<String, Target>,
    config: PoolConfig,
    // Entries are never evicted: keys are limited to the configured targets.
    pools: Cache<String, Arc<SessionPool<C>>>,
    closed: AtomicBool,
}

impl<C: Connector> SessionRegistry<C> {
    pub fn new(connector: C, targets: impl IntoIterator<Item = Target>, config: PoolConfig) -> Self {
        let targets: HashMap<String, Target> =
            targets.into_iter().map(|t| (t.name.clone(), t)).collect();
        Self {
            connector: Arc::new(connector),
            pools: Cache::builder().initial_capacity(targets.len()).build(),
            targets,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Configured target names, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn connector(&self) -> &C {
        &self.connector
    }

    // The server always acquires with its shutdown token.
    #[cfg(test)]
    pub async fn acquire(&self, name: &str) -> Result<PooledSession<C>, PoolError> {
        let pool = self.pool_for(name).await?;
        pool.acquire(None).await
    }

    /// Check out a session to `name`, opening one if the pool has room.
    /// Gives up with [`PoolError::Cancelled`] once `cancel` fires while
    /// waiting for capacity.
    pub async fn acquire_with_cancel(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<PooledSession<C>, PoolError> {
        let pool = self.pool_for(name).await?;
        pool.acquire(Some(cancel)).await
    }

    /// Hand a session back to the pool it came from.
    pub fn release(&self, session: PooledSession<C>) {
        session.release();
    }

    async fn pool_for(&self, name: &str) -> Result<Arc<SessionPool<C>>, PoolError> {
        let target = self
            .targets
            .get(name)
            .ok_or_else(|| PoolError::UnknownTarget(name.to_string()))?;
        if self.is_closed() {
            return Err(PoolError::Closed(name.to_string()));
        }

        // `get_with` runs the init once per key, concurrent callers wait for it.
        let pool = self
            .pools
            .get_with(name.to_string(), async {
                debug!("Created session pool for {} ({})", target, self.config);
                Arc::new(SessionPool::new(
                    target.clone(),
                    self.connector.clone(),
                    self.config.clone(),
                ))
            })
            .await;

        // Created while `shutdown` was walking the map.
        if self.is_closed() {
            pool.shutdown().await;
            return Err(PoolError::Closed(name.to_string()));
        }
        Ok(pool)
    }

    fn existing_pools(&self) -> Vec<Arc<SessionPool<C>>> {
        self.pools.iter().map(|(_, pool)| pool).collect()
    }

    /// Run one eviction pass over every pool, returns the number of sessions closed.
    pub async fn sweep_idle(&self) -> usize {
        let mut evicted = 0;
        for pool in self.existing_pools() {
            evicted += pool.evict_idle().await;
        }
        evicted
    }

    /// Spawn a task running [`sweep_idle`](Self::sweep_idle) every
    /// `sweep_interval`. It exits once the registry is dropped or shut down.
    pub fn start_idle_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let every = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if registry.is_closed() {
                    break;
                }
                let evicted = registry.sweep_idle().await;
                if evicted > 0 {
                    debug!("Idle sweep closed {} session(s)", evicted);
                }
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every idle session and refuse further acquisitions.
    /// Checked-out sessions are closed as they come back.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut closed = 0;
        for pool in self.existing_pools() {
            let stats = pool.stats();
            if stats.checked_out > 0 || stats.waiters > 0 {
                debug!(
                    "Shutting down pool for {} with {} checked out, {} waiting",
                    pool.target(),
                    stats.checked_out,
                    stats.waiters
                );
            }
            closed += pool.shutdown().await;
        }
        info!("Session registry shut down, closed {} idle session(s)", closed);
    }

    pub async fn stats(&self, name: &str) -> Option<PoolStats> {
        self.pools.get(name).await.map(|p| p.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockConnector;
    use super::*;
    use std::time::Instant;

    fn targets(names: &[&str]) -> Vec<Target> {
        names
            .iter()
            .map(|n| {
                Target::new(
                    n.to_string(),
                    format!("{}.bmc", n),
                    "ADMIN".into(),
                    "secret".into(),
                )
            })
            .collect()
    }

    fn registry(connector: MockConnector, config: PoolConfig) -> Arc<SessionRegistry<MockConnector>> {
        Arc::new(SessionRegistry::new(
            connector,
            targets(&["venus", "mars"]),
            config,
        ))
    }

    #[tokio::test]
    async fn test_unknown_target_never_connects() {
        let reg = registry(MockConnector::default(), PoolConfig::default());
        let err = reg.acquire("pluto").await.err().unwrap();
        assert!(matches!(err, PoolError::UnknownTarget(ref n) if n == "pluto"));
        assert!(!err.is_retryable());
        assert_eq!(reg.connector.connects(), 0);
        assert!(reg.stats("pluto").await.is_none());
    }

    #[tokio::test]
    async fn test_pool_created_once_under_concurrent_first_use() {
        let reg = registry(
            MockConnector::default().with_delay("venus", Duration::from_millis(30)),
            PoolConfig {
                capacity: 4,
                ..PoolConfig::default()
            },
        );

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                let s = reg.acquire("venus").await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                reg.release(s);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(reg.pools.iter().count(), 1);
        let stats = reg.stats("venus").await.unwrap();
        assert_eq!(stats.checked_out, 0);
        assert!(stats.idle <= 4);
        assert!(reg.connector.connects() <= 4);
    }

    #[tokio::test]
    async fn test_slow_target_does_not_block_other_target() {
        let reg = registry(
            MockConnector::default().with_delay("venus", Duration::from_millis(500)),
            PoolConfig::default(),
        );

        let slow = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.acquire("venus").await.map(|s| s.release()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let fast = reg.acquire("mars").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(fast.target(), "mars");
        reg.release(fast);

        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_factory_error_is_wrapped_with_target() {
        let reg = registry(
            MockConnector::default().with_unreachable("mars"),
            PoolConfig::default(),
        );
        let err = reg.acquire("mars").await.err().unwrap();
        match err {
            PoolError::Factory { ref target, .. } => assert_eq!(target, "mars"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("mars"));
        // The failed attempt must not hold on to the slot.
        assert_eq!(reg.stats("mars").await.unwrap().checked_out, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_and_refuses_acquire() {
        let reg = registry(MockConnector::default(), PoolConfig::default());
        let s = reg.acquire("venus").await.unwrap();
        reg.release(s);
        let held = reg.acquire("mars").await.unwrap();

        reg.shutdown().await;
        assert!(reg.is_closed());
        assert_eq!(reg.connector.closes(), 1);

        assert!(matches!(
            reg.acquire("venus").await,
            Err(PoolError::Closed(_))
        ));
        // No pool existed for this name yet.
        let reg2 = registry(MockConnector::default(), PoolConfig::default());
        reg2.shutdown().await;
        assert!(matches!(reg2.acquire("mars").await, Err(PoolError::Closed(_))));

        // Held sessions are closed on release instead of going idle.
        reg.release(held);
        reg.connector.wait_for_closes(2).await;
        assert_eq!(reg.stats("mars").await.unwrap().idle, 0);

        // A second shutdown is a no-op.
        reg.shutdown().await;
        assert_eq!(reg.connector.closes(), 2);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle_sessions() {
        let reg = registry(
            MockConnector::default(),
            PoolConfig {
                idle_timeout: Duration::from_millis(30),
                sweep_interval: Duration::from_millis(10),
                ..PoolConfig::default()
            },
        );
        let sweeper = reg.start_idle_sweeper();

        let s = reg.acquire("venus").await.unwrap();
        reg.release(s);
        assert_eq!(reg.stats("venus").await.unwrap().idle, 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(reg.stats("venus").await.unwrap().idle, 0);
        assert_eq!(reg.connector.closes(), 1);

        reg.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_targets_sorted() {
        let reg = registry(MockConnector::default(), PoolConfig::default());
        assert_eq!(reg.targets(), vec!["mars".to_string(), "venus".to_string()]);
    }
}
