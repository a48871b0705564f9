//! Pool of shared SSH tunnels keyed by (host, port, credential id).
//!
//! Each key owns a slot behind its own async mutex, so acquire, release and
//! invalidate are serialized per key while different keys proceed in
//! parallel. Establishment happens while the slot is held: concurrent
//! acquirers of the same key wait for the single in-flight connect and then
//! share its outcome.
//!
//! Callers never own a tunnel. They get a [`TunnelHandle`] ticket and every
//! operation goes back through the pool, which checks the ticket against
//! the live tunnel first.

use super::connector::{ExecOutput, SshConnector, SshLink, TunnelKey};
use super::credential::CredentialStore;
use rgate_core::{GatewayError, GatewayResult};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health of a pooled tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelHealth {
    Healthy,
    Degraded,
    Dead,
}

/// A borrowed tunnel. Only meaningful to the pool that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    key: TunnelKey,
    tunnel_id: u64,
    ticket: u64,
}

impl TunnelHandle {
    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    pub fn tunnel_id(&self) -> u64 {
        self.tunnel_id
    }
}

/// Point-in-time view of one pooled tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStats {
    pub key: TunnelKey,
    pub tunnel_id: u64,
    pub ref_count: usize,
    pub health: TunnelHealth,
    pub idle_ms: u64,
}

struct Tunnel {
    id: u64,
    link: Arc<dyn SshLink>,
    borrowers: HashSet<u64>,
    last_used: Instant,
    health: TunnelHealth,
    failed_probes: u32,
}

#[derive(Default)]
struct Slot {
    tunnel: Option<Tunnel>,
    /// Completion index and reason of the most recent failed establish.
    last_failure: Option<(u64, String)>,
}

#[derive(Default)]
struct SlotCell {
    /// Number of finished establish attempts, readable without the lock.
    completed: AtomicU64,
    slot: Mutex<Slot>,
}

/// Shared SSH tunnel pool.
pub struct TunnelPool {
    slots: RwLock<HashMap<TunnelKey, Arc<SlotCell>>>,
    connector: Arc<dyn SshConnector>,
    credentials: Arc<CredentialStore>,
    idle_grace: Duration,
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl TunnelPool {
    pub fn new(
        connector: Arc<dyn SshConnector>,
        credentials: Arc<CredentialStore>,
        idle_grace: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            connector,
            credentials,
            idle_grace,
            connect_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    async fn cell(&self, key: &TunnelKey) -> Arc<SlotCell> {
        if let Some(cell) = self.slots.read().await.get(key) {
            return cell.clone();
        }
        self.slots
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    async fn existing_cell(&self, key: &TunnelKey) -> Option<Arc<SlotCell>> {
        self.slots.read().await.get(key).cloned()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Borrow a tunnel to `key`, establishing one if none is usable.
    pub async fn acquire(&self, key: TunnelKey) -> GatewayResult<TunnelHandle> {
        let cell = self.cell(&key).await;
        let seen = cell.completed.load(Ordering::Acquire);
        let mut slot = cell.slot.lock().await;

        let dead = slot
            .tunnel
            .as_ref()
            .is_some_and(|t| t.health == TunnelHealth::Dead);
        if dead {
            if let Some(t) = slot.tunnel.take() {
                spawn_close(t.link);
            }
        }

        if let Some(tunnel) = slot.tunnel.as_mut() {
            let ticket = self.next_id();
            tunnel.borrowers.insert(ticket);
            tunnel.last_used = Instant::now();
            debug!(tunnel = %key, refs = tunnel.borrowers.len(), "tunnel reused");
            return Ok(TunnelHandle {
                key,
                tunnel_id: tunnel.id,
                ticket,
            });
        }

        // An attempt that finished while we were queued failed: share it.
        if let Some((index, reason)) = &slot.last_failure {
            if *index > seen {
                return Err(GatewayError::TunnelEstablish(reason.clone()));
            }
        }

        let outcome = self.establish(&key).await;
        let index = cell.completed.fetch_add(1, Ordering::AcqRel) + 1;
        match outcome {
            Ok(link) => {
                slot.last_failure = None;
                let tunnel_id = self.next_id();
                let ticket = self.next_id();
                slot.tunnel = Some(Tunnel {
                    id: tunnel_id,
                    link,
                    borrowers: HashSet::from([ticket]),
                    last_used: Instant::now(),
                    health: TunnelHealth::Healthy,
                    failed_probes: 0,
                });
                info!(tunnel = %key, tunnel_id, "tunnel established");
                Ok(TunnelHandle {
                    key,
                    tunnel_id,
                    ticket,
                })
            }
            Err(e) => {
                let reason = match e {
                    GatewayError::TunnelEstablish(reason) => reason,
                    other => other.to_string(),
                };
                warn!(tunnel = %key, reason = %reason, "tunnel establish failed");
                slot.last_failure = Some((index, reason.clone()));
                Err(GatewayError::TunnelEstablish(reason))
            }
        }
    }

    async fn establish(&self, key: &TunnelKey) -> GatewayResult<Arc<dyn SshLink>> {
        let credential = self.credentials.get(&key.credential_id).ok_or_else(|| {
            GatewayError::TunnelEstablish(format!("unknown credential `{}`", key.credential_id))
        })?;
        match tokio::time::timeout(self.connect_timeout, self.connector.connect(key, credential)).await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::TunnelEstablish(format!(
                "handshake with {key} timed out after {}ms",
                self.connect_timeout.as_millis()
            ))),
        }
    }

    /// Return a borrowed tunnel. The tunnel stays open until the reaper
    /// evicts it. Releasing a stale or already-released handle is a no-op.
    pub async fn release(&self, handle: &TunnelHandle) -> bool {
        let Some(cell) = self.existing_cell(&handle.key).await else {
            return false;
        };
        let mut slot = cell.slot.lock().await;
        let Some(t) = slot.tunnel.as_mut().filter(|t| t.id == handle.tunnel_id) else {
            return false;
        };
        if !t.borrowers.remove(&handle.ticket) {
            return false;
        }
        t.last_used = Instant::now();
        debug!(tunnel = %handle.key, refs = t.borrowers.len(), "tunnel released");
        true
    }

    /// Mark the handle's tunnel dead and drop it from the pool immediately.
    /// Every outstanding handle to it fails on its next operation.
    pub async fn invalidate(&self, handle: &TunnelHandle) -> bool {
        let Some(cell) = self.existing_cell(&handle.key).await else {
            return false;
        };
        let mut slot = cell.slot.lock().await;
        if slot.tunnel.as_ref().map(|t| t.id) != Some(handle.tunnel_id) {
            return false;
        }
        if let Some(mut t) = slot.tunnel.take() {
            t.health = TunnelHealth::Dead;
            warn!(
                tunnel = %handle.key,
                tunnel_id = t.id,
                borrowers = t.borrowers.len(),
                "tunnel invalidated"
            );
            spawn_close(t.link);
        }
        true
    }

    async fn link_for(&self, handle: &TunnelHandle) -> GatewayResult<Arc<dyn SshLink>> {
        let stale = || GatewayError::TunnelInvalidated(handle.key.to_string());
        let cell = self.existing_cell(&handle.key).await.ok_or_else(stale)?;
        let mut slot = cell.slot.lock().await;
        match slot.tunnel.as_mut() {
            Some(t)
                if t.id == handle.tunnel_id
                    && t.health != TunnelHealth::Dead
                    && t.borrowers.contains(&handle.ticket) =>
            {
                t.last_used = Instant::now();
                Ok(t.link.clone())
            }
            _ => Err(stale()),
        }
    }

    /// Run a command over a borrowed tunnel. A transport failure invalidates
    /// the tunnel.
    pub async fn exec(&self, handle: &TunnelHandle, command: &str) -> GatewayResult<ExecOutput> {
        let link = self.link_for(handle).await?;
        match link.exec(command).await {
            Ok(out) => Ok(out),
            Err(e) => {
                self.invalidate(handle).await;
                Err(e)
            }
        }
    }

    /// Liveness check over a borrowed tunnel. A failure invalidates it.
    pub async fn probe(&self, handle: &TunnelHandle) -> GatewayResult<()> {
        let link = self.link_for(handle).await?;
        if let Err(e) = link.probe().await {
            self.invalidate(handle).await;
            return Err(e);
        }
        Ok(())
    }

    /// Evict dead tunnels and tunnels unused past the idle grace period.
    pub async fn reap(&self) -> Vec<TunnelKey> {
        let cells: Vec<(TunnelKey, Arc<SlotCell>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();

        let mut evicted = Vec::new();
        for (key, cell) in cells {
            // Busy slots (mid-establish) are skipped until the next pass.
            let Ok(mut slot) = cell.slot.try_lock() else {
                continue;
            };
            let expired = slot.tunnel.as_ref().is_some_and(|t| {
                t.health == TunnelHealth::Dead
                    || (t.borrowers.is_empty() && t.last_used.elapsed() >= self.idle_grace)
            });
            if expired {
                if let Some(t) = slot.tunnel.take() {
                    info!(tunnel = %key, tunnel_id = t.id, "tunnel evicted");
                    spawn_close(t.link);
                    evicted.push(key);
                }
            }
        }

        // Drop empty slots nobody else is holding.
        let mut slots = self.slots.write().await;
        slots.retain(|_, cell| {
            Arc::strong_count(cell) > 1
                || cell.slot.try_lock().map_or(true, |s| s.tunnel.is_some())
        });

        evicted
    }

    /// Probe idle tunnels. One failure degrades a tunnel, a second
    /// consecutive failure kills and removes it.
    pub async fn health_check(&self) {
        let mut targets = Vec::new();
        for (key, cell) in self.slots.read().await.iter() {
            if let Ok(slot) = cell.slot.try_lock() {
                if let Some(t) = slot.tunnel.as_ref() {
                    if t.borrowers.is_empty() && t.health != TunnelHealth::Dead {
                        targets.push((key.clone(), cell.clone(), t.id, t.link.clone()));
                    }
                }
            }
        }

        for (key, cell, tunnel_id, link) in targets {
            let result = link.probe().await;
            let mut slot = cell.slot.lock().await;
            let Some(t) = slot.tunnel.as_mut().filter(|t| t.id == tunnel_id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    if t.health == TunnelHealth::Degraded {
                        info!(tunnel = %key, "tunnel recovered");
                    }
                    t.health = TunnelHealth::Healthy;
                    t.failed_probes = 0;
                }
                Err(e) => {
                    t.failed_probes += 1;
                    if t.failed_probes >= 2 {
                        warn!(tunnel = %key, error = %e, "tunnel failed health check, removing");
                        if let Some(t) = slot.tunnel.take() {
                            spawn_close(t.link);
                        }
                    } else {
                        warn!(tunnel = %key, error = %e, "tunnel degraded");
                        t.health = TunnelHealth::Degraded;
                    }
                }
            }
        }
    }

    /// Snapshot of every live tunnel. Waits for slots that are
    /// mid-establish without blocking other keys.
    pub async fn stats(&self) -> Vec<TunnelStats> {
        let cells: Vec<(TunnelKey, Arc<SlotCell>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();

        let mut out = Vec::new();
        for (key, cell) in cells {
            let slot = cell.slot.lock().await;
            if let Some(t) = slot.tunnel.as_ref() {
                out.push(TunnelStats {
                    key,
                    tunnel_id: t.id,
                    ref_count: t.borrowers.len(),
                    health: t.health,
                    idle_ms: t.last_used.elapsed().as_millis() as u64,
                });
            }
        }
        out
    }

    /// Close every tunnel (gateway shutdown).
    pub async fn close_all(&self) {
        let cells: Vec<Arc<SlotCell>> = self.slots.write().await.drain().map(|(_, c)| c).collect();
        for cell in cells {
            let tunnel = cell.slot.lock().await.tunnel.take();
            if let Some(t) = tunnel {
                t.link.close().await;
            }
        }
        info!("all tunnels closed");
    }

    /// Background reaper + health checker.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        reaper_interval: Duration,
        health_interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut reap_tick = tokio::time::interval(reaper_interval);
            let mut health_tick = tokio::time::interval(health_interval);
            loop {
                tokio::select! {
                    _ = reap_tick.tick() => {
                        pool.reap().await;
                    }
                    _ = health_tick.tick() => {
                        pool.health_check().await;
                    }
                    () = cancel.cancelled() => break,
                }
            }
            debug!("tunnel maintenance stopped");
        })
    }
}

fn spawn_close(link: Arc<dyn SshLink>) {
    tokio::spawn(async move {
        link.close().await;
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tunnel::connector::BoxFuture;
    use crate::tunnel::credential::{Credential, CredentialSecret};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    pub(crate) struct FakeLink {
        pub fail_exec: AtomicBool,
        pub fail_probe: AtomicBool,
        pub closed: AtomicUsize,
    }

    impl SshLink for FakeLink {
        fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, GatewayResult<ExecOutput>> {
            Box::pin(async move {
                if self.fail_exec.load(Ordering::SeqCst) {
                    return Err(GatewayError::Transport("broken pipe".into()));
                }
                Ok(ExecOutput {
                    stdout: format!("ran {command}"),
                    stderr: String::new(),
                    exit_code: Some(0),
                })
            })
        }

        fn probe(&self) -> BoxFuture<'_, GatewayResult<()>> {
            Box::pin(async move {
                if self.fail_probe.load(Ordering::SeqCst) {
                    Err(GatewayError::Transport("no route".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.closed.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub connects: AtomicUsize,
        pub fail: AtomicBool,
        pub delay_ms: AtomicU64,
        /// Connects to this host hang for 30 s.
        pub stall_host: std::sync::Mutex<Option<String>>,
        pub links: std::sync::Mutex<Vec<Arc<FakeLink>>>,
    }

    impl SshConnector for FakeConnector {
        fn connect<'a>(
            &'a self,
            key: &'a TunnelKey,
            _credential: &'a Credential,
        ) -> BoxFuture<'a, GatewayResult<Arc<dyn SshLink>>> {
            Box::pin(async move {
                self.connects.fetch_add(1, Ordering::SeqCst);
                let delay = self.delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                let stalled = self.stall_host.lock().unwrap().as_deref() == Some(key.host.as_str());
                if stalled {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                if self.fail.load(Ordering::SeqCst) {
                    return Err(GatewayError::TunnelEstablish(format!("{} unreachable", key.host)));
                }
                let link = Arc::new(FakeLink::default());
                self.links.lock().unwrap().push(link.clone());
                Ok(link as Arc<dyn SshLink>)
            })
        }
    }

    pub(crate) fn store() -> Arc<CredentialStore> {
        let mut store = CredentialStore::new();
        store.insert(Credential {
            id: "lab".into(),
            username: "bot".into(),
            secret: CredentialSecret::Password("pw".into()),
        });
        Arc::new(store)
    }

    pub(crate) fn pool_with(connector: Arc<FakeConnector>) -> Arc<TunnelPool> {
        Arc::new(TunnelPool::new(
            connector,
            store(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ))
    }

    fn key() -> TunnelKey {
        TunnelKey::new("10.0.0.5", 22, "lab")
    }

    #[tokio::test]
    async fn acquire_reuses_healthy_tunnel() {
        let connector = Arc::new(FakeConnector::default());
        let pool = pool_with(connector.clone());

        let a = pool.acquire(key()).await.unwrap();
        let b = pool.acquire(key()).await.unwrap();
        assert_eq!(a.tunnel_id(), b.tunnel_id());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await[0].ref_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquire_establishes_once() {
        let connector = Arc::new(FakeConnector::default());
        connector.delay_ms.store(50, Ordering::SeqCst);
        let pool = pool_with(connector.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire(key()).await })
            })
            .collect();
        let mut ids = HashSet::new();
        for t in tasks {
            ids.insert(t.await.unwrap().unwrap().tunnel_id());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await[0].ref_count, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquire_fails_identically() {
        let connector = Arc::new(FakeConnector::default());
        connector.delay_ms.store(50, Ordering::SeqCst);
        connector.fail.store(true, Ordering::SeqCst);
        let pool = pool_with(connector.clone());

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire(key()).await })
            })
            .collect();
        let mut reasons = HashSet::new();
        for t in tasks {
            match t.await.unwrap() {
                Err(GatewayError::TunnelEstablish(reason)) => {
                    reasons.insert(reason);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(reasons.len(), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        // A later acquire retries instead of replaying the old failure.
        connector.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire(key()).await.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_enforced() {
        let connector = Arc::new(FakeConnector::default());
        connector.delay_ms.store(10_000, Ordering::SeqCst);
        let pool = pool_with(connector);
        let err = pool.acquire(key()).await.unwrap_err();
        assert!(matches!(err, GatewayError::TunnelEstablish(r) if r.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn stats_during_slow_establish_does_not_block_other_keys() {
        let connector = Arc::new(FakeConnector::default());
        *connector.stall_host.lock().unwrap() = Some("slow".into());
        let pool = Arc::new(TunnelPool::new(
            connector.clone(),
            store(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));

        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(TunnelKey::new("slow", 22, "lab")).await })
        };
        tokio::task::yield_now().await;
        let stats = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.stats().await })
        };
        tokio::task::yield_now().await;

        let fast = tokio::time::timeout(
            Duration::from_secs(2),
            pool.acquire(TunnelKey::new("fast", 22, "lab")),
        )
        .await;
        assert!(matches!(fast, Ok(Ok(_))));

        assert!(slow.await.unwrap().is_ok());
        // The snapshot was taken before `fast` existed.
        let snapshot = stats.await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key.host, "slow");
    }

    #[tokio::test]
    async fn unknown_credential_fails_to_establish() {
        let pool = pool_with(Arc::new(FakeConnector::default()));
        let err = pool
            .acquire(TunnelKey::new("10.0.0.5", 22, "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TunnelEstablish(_)));
    }

    #[tokio::test]
    async fn invalidate_fails_outstanding_handles() {
        let connector = Arc::new(FakeConnector::default());
        let pool = pool_with(connector.clone());

        let a = pool.acquire(key()).await.unwrap();
        let b = pool.acquire(key()).await.unwrap();
        assert!(pool.invalidate(&a).await);

        assert!(matches!(
            pool.exec(&b, "uptime").await,
            Err(GatewayError::TunnelInvalidated(_))
        ));
        let c = pool.acquire(key()).await.unwrap();
        assert_ne!(c.tunnel_id(), a.tunnel_id());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let first = connector.links.lock().unwrap()[0].clone();
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exec_failure_invalidates_tunnel() {
        let connector = Arc::new(FakeConnector::default());
        let pool = pool_with(connector.clone());
        let h = pool.acquire(key()).await.unwrap();
        assert_eq!(pool.exec(&h, "id").await.unwrap().stdout, "ran id");

        connector.links.lock().unwrap()[0]
            .fail_exec
            .store(true, Ordering::SeqCst);
        assert!(matches!(
            pool.exec(&h, "id").await,
            Err(GatewayError::Transport(_))
        ));
        assert!(matches!(
            pool.exec(&h, "id").await,
            Err(GatewayError::TunnelInvalidated(_))
        ));
        assert!(pool.stats().await.is_empty());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = pool_with(Arc::new(FakeConnector::default()));
        let h = pool.acquire(key()).await.unwrap();
        assert!(pool.release(&h).await);
        assert!(!pool.release(&h).await);
        assert_eq!(pool.stats().await[0].ref_count, 0);
        // Released handles can no longer drive operations.
        assert!(pool.exec(&h, "id").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_evicts_only_idle_unreferenced_tunnels() {
        let connector = Arc::new(FakeConnector::default());
        let pool = pool_with(connector.clone());
        let busy = pool.acquire(TunnelKey::new("busy", 22, "lab")).await.unwrap();
        let idle = pool.acquire(key()).await.unwrap();
        pool.release(&idle).await;

        assert!(pool.reap().await.is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        let evicted = pool.reap().await;
        assert_eq!(evicted, vec![key()]);

        let stats = pool.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].key, *busy.key());
    }

    #[tokio::test]
    async fn health_check_degrades_then_removes() {
        let connector = Arc::new(FakeConnector::default());
        let pool = pool_with(connector.clone());
        let h = pool.acquire(key()).await.unwrap();
        pool.release(&h).await;

        let link = connector.links.lock().unwrap()[0].clone();
        link.fail_probe.store(true, Ordering::SeqCst);

        pool.health_check().await;
        assert_eq!(pool.stats().await[0].health, TunnelHealth::Degraded);

        pool.health_check().await;
        assert!(pool.stats().await.is_empty());
    }

    #[tokio::test]
    async fn health_check_recovers_degraded_tunnel() {
        let connector = Arc::new(FakeConnector::default());
        let pool = pool_with(connector.clone());
        let h = pool.acquire(key()).await.unwrap();
        pool.release(&h).await;

        let link = connector.links.lock().unwrap()[0].clone();
        link.fail_probe.store(true, Ordering::SeqCst);
        pool.health_check().await;
        link.fail_probe.store(false, Ordering::SeqCst);
        pool.health_check().await;
        assert_eq!(pool.stats().await[0].health, TunnelHealth::Healthy);
    }

    #[tokio::test]
    async fn close_all_disconnects_everything() {
        let connector = Arc::new(FakeConnector::default());
        let pool = pool_with(connector.clone());
        pool.acquire(key()).await.unwrap();
        pool.acquire(TunnelKey::new("other", 2222, "lab")).await.unwrap();
        pool.close_all().await;
        assert!(pool.stats().await.is_empty());
        for link in connector.links.lock().unwrap().iter() {
            assert_eq!(link.closed.load(Ordering::SeqCst), 1);
        }
    }
}
