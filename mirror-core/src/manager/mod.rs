//! Per-client state ownership: loading, leasing, and persistence.
//!
//! A [`StateManager`] owns every client's [`StateTree`], keyed by client
//! token. All mutation goes through [`modify`](StateManager::modify) or
//! [`process_event`](StateManager::process_event), which take a per-token
//! lease first, so concurrent events for one client serialize in arrival
//! order while different clients proceed in parallel.
//!
//! Two backings exist: an in-process map for single-instance deployments,
//! and a [`KvStore`] holding encoded snapshots for anything that must
//! survive restarts or span instances.

mod store;

pub use store::{KvStore, MemoryKvStore, NodeSnapshot, Snapshot};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{Event, StateUpdate};
use crate::schema::Schema;
use crate::serialize::SerializerRegistry;
use crate::state::{Delta, StateTree};

/// Tunables for lease and persistence lifetimes.
#[derive(Clone, Copy, Debug)]
pub struct ManagerConfig {
    /// How long one event cycle may hold a client's lease before waiters
    /// may seize it.
    pub lease_expiration: Duration,
    /// TTL on persisted client state, `None` to keep it forever. Only
    /// applies to the key-value backing.
    pub token_expiration: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lease_expiration: Duration::from_secs(10),
            token_expiration: Some(Duration::from_secs(3600)),
        }
    }
}

// ----------------------------------------------------------------------------
// Leases
// ----------------------------------------------------------------------------

struct Holder {
    ticket: u64,
    deadline: Instant,
}

#[derive(Default)]
struct LeaseInner {
    next_ticket: u64,
    now_serving: u64,
    holder: Option<Holder>,
    /// Tickets whose waiters gave up while queued.
    abandoned: HashSet<u64>,
}

impl LeaseInner {
    /// Skip tickets at the head of the line whose waiters are gone.
    fn skip_abandoned(&mut self) {
        while self.abandoned.remove(&self.now_serving) {
            self.now_serving += 1;
        }
    }

    /// Move past the current slot after a release or seizure.
    fn advance(&mut self) {
        self.now_serving += 1;
        self.skip_abandoned();
    }
}

/// FIFO ticket lease for one client token. A waiter that outlives the
/// current holder's deadline force-expires it, so a wedged cycle cannot
/// starve the client forever.
#[derive(Default)]
struct LeaseQueue {
    inner: Mutex<LeaseInner>,
    notify: Notify,
}

/// Marks a queued ticket abandoned if its waiter drops before being served,
/// keeping later tickets from queueing behind a slot nobody will take.
struct WaitGuard<'a> {
    queue: &'a LeaseQueue,
    ticket: u64,
    acquired: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        let mut inner = self.queue.inner.lock();
        inner.abandoned.insert(self.ticket);
        if inner.holder.is_none() {
            inner.skip_abandoned();
        }
        drop(inner);
        self.queue.notify.notify_waiters();
    }
}

impl LeaseQueue {
    async fn acquire(&self, expiration: Duration) -> u64 {
        let ticket = {
            let mut inner = self.inner.lock();
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            ticket
        };
        let mut guard = WaitGuard {
            queue: self,
            ticket,
            acquired: false,
        };
        loop {
            let wait = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                if let Some(holder) = &inner.holder {
                    if now >= holder.deadline {
                        warn!(ticket = holder.ticket, "lease held past deadline, seizing");
                        inner.holder = None;
                        inner.advance();
                        self.notify.notify_waiters();
                    }
                }
                if inner.holder.is_none() && inner.now_serving == ticket {
                    inner.holder = Some(Holder {
                        ticket,
                        deadline: now + expiration,
                    });
                    guard.acquired = true;
                    return ticket;
                }
                inner
                    .holder
                    .as_ref()
                    .map(|h| h.deadline.saturating_duration_since(now))
                    .unwrap_or(expiration)
            };
            // Wake on release or when the holder's deadline passes,
            // whichever comes first.
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    /// Whether `ticket` still holds the lease.
    fn is_valid(&self, ticket: u64) -> bool {
        let inner = self.inner.lock();
        matches!(
            &inner.holder,
            Some(holder) if holder.ticket == ticket && Instant::now() < holder.deadline
        )
    }

    fn release(&self, ticket: u64) -> bool {
        let mut inner = self.inner.lock();
        match &inner.holder {
            Some(holder) if holder.ticket == ticket => {
                inner.holder = None;
                inner.advance();
                self.notify.notify_waiters();
                true
            }
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

enum Backing {
    /// Live trees held in process.
    Memory(DashMap<String, StateTree>),
    /// Encoded snapshots in an external key-value store.
    Kv(Arc<dyn KvStore>),
}

/// Owns all client state trees and serializes access per client token.
pub struct StateManager {
    schema: Arc<Schema>,
    serializers: Arc<SerializerRegistry>,
    backing: Backing,
    leases: DashMap<String, Arc<LeaseQueue>>,
    config: ManagerConfig,
}

impl StateManager {
    /// In-process manager; state lives and dies with the process.
    pub fn in_memory(schema: Arc<Schema>, serializers: Arc<SerializerRegistry>) -> Self {
        Self::with_config(schema, serializers, Backing::Memory(DashMap::new()), ManagerConfig::default())
    }

    /// Manager backed by an external key-value store.
    pub fn with_store(
        schema: Arc<Schema>,
        serializers: Arc<SerializerRegistry>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self::with_config(schema, serializers, Backing::Kv(store), ManagerConfig::default())
    }

    fn with_config(
        schema: Arc<Schema>,
        serializers: Arc<SerializerRegistry>,
        backing: Backing,
        config: ManagerConfig,
    ) -> Self {
        Self {
            schema,
            serializers,
            backing,
            leases: DashMap::new(),
            config,
        }
    }

    pub fn set_config(&mut self, config: ManagerConfig) {
        self.config = config;
    }

    fn fresh_tree(&self) -> StateTree {
        StateTree::new(self.schema.clone(), self.serializers.clone())
    }

    fn queue(&self, token: &str) -> Arc<LeaseQueue> {
        self.leases
            .entry(token.to_string())
            .or_default()
            .clone()
    }

    /// Load a client's tree, creating a default one on first sight. Reads
    /// do not take the lease; use [`modify`](StateManager::modify) when the
    /// result must not race a concurrent event.
    pub async fn load(&self, token: &str) -> Result<StateTree> {
        match &self.backing {
            Backing::Memory(trees) => Ok(trees
                .get(token)
                .map(|entry| entry.value().clone())
                .unwrap_or_else(|| self.fresh_tree())),
            Backing::Kv(store) => {
                let mut tree = self.fresh_tree();
                if let Some(bytes) = store.get(token).await? {
                    Snapshot::decode(&bytes)?.restore_into(&mut tree)?;
                }
                Ok(tree)
            }
        }
    }

    async fn save(&self, token: &str, tree: &StateTree) -> Result<()> {
        match &self.backing {
            Backing::Memory(trees) => {
                trees.insert(token.to_string(), tree.clone());
                Ok(())
            }
            Backing::Kv(store) => {
                let bytes = Snapshot::capture(tree)?.encode()?;
                store
                    .put(token, bytes, self.config.token_expiration)
                    .await?;
                Ok(())
            }
        }
    }

    /// Drop a client's state entirely.
    pub async fn evict(&self, token: &str) -> Result<()> {
        match &self.backing {
            Backing::Memory(trees) => {
                trees.remove(token);
            }
            Backing::Kv(store) => store.delete(token).await?,
        }
        self.leases.remove(token);
        Ok(())
    }

    /// Run `f` against the client's tree under its lease and persist the
    /// result. Fails with [`Error::LeaseExpired`] if the lease was seized
    /// before the result could be committed, in which case nothing is
    /// saved.
    pub async fn modify<F, R>(&self, token: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut StateTree) -> Result<R>,
    {
        let queue = self.queue(token);
        let ticket = queue.acquire(self.config.lease_expiration).await;
        let result = async {
            let mut tree = self.load(token).await?;
            let out = f(&mut tree)?;
            self.commit(token, &queue, ticket, &tree).await?;
            Ok(out)
        }
        .await;
        queue.release(ticket);
        result
    }

    /// Process one client event under the client's lease, streaming frames
    /// into `out`.
    pub async fn process_event(
        &self,
        event: &Event,
        out: &mpsc::Sender<StateUpdate>,
    ) -> Result<()> {
        let queue = self.queue(&event.token);
        let ticket = queue.acquire(self.config.lease_expiration).await;
        debug!(token = %event.token, handler = %event.name, "event leased");
        let result = async {
            let mut tree = self.load(&event.token).await?;
            tree.process(event, out).await?;
            self.commit(&event.token, &queue, ticket, &tree).await
        }
        .await;
        queue.release(ticket);
        result
    }

    /// Render the full client-visible state for initial hydration.
    pub async fn hydrate(&self, token: &str) -> Result<Delta> {
        self.modify(token, |tree| {
            let full = tree.render_full()?;
            tree.clean();
            Ok(full)
        })
        .await
    }

    /// Persist only if the lease is still ours. A seized lease means a
    /// waiter may already have loaded and modified newer state; writing
    /// over it would lose that work.
    async fn commit(
        &self,
        token: &str,
        queue: &LeaseQueue,
        ticket: u64,
        tree: &StateTree,
    ) -> Result<()> {
        if !queue.is_valid(ticket) {
            return Err(Error::LeaseExpired {
                token: token.to_string(),
            });
        }
        self.save(token, tree).await
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::event::HandlerOutcome;
    use crate::value::Value;

    use super::*;

    fn counter_schema() -> Arc<Schema> {
        Schema::builder("app")
            .stored("count", 0)
            .handler("increment", |tree, node, _| {
                let count = tree.get(node, "count")?.as_int().unwrap_or(0);
                tree.set(node, "count", count + 1)?;
                Ok(HandlerOutcome::done())
            })
            .compile()
            .unwrap()
    }

    fn memory_manager() -> Arc<StateManager> {
        Arc::new(StateManager::in_memory(
            counter_schema(),
            Arc::new(SerializerRegistry::new()),
        ))
    }

    #[tokio::test]
    async fn tokens_are_isolated() {
        let manager = memory_manager();
        manager
            .modify("a", |tree| tree.set(tree.root(), "count", 5))
            .await
            .unwrap();

        let mut a = manager.load("a").await.unwrap();
        let mut b = manager.load("b").await.unwrap();
        let root_a = a.root();
        let root_b = b.root();
        assert_eq!(a.get(root_a, "count").unwrap(), Value::Int(5));
        assert_eq!(b.get(root_b, "count").unwrap(), Value::Int(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_modifies_serialize_per_token() {
        let manager = memory_manager();
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    manager
                        .modify("tok", |tree| {
                            let root = tree.root();
                            let count = tree.get(root, "count")?.as_int().unwrap_or(0);
                            tree.set(root, "count", count + 1)
                        })
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut tree = manager.load("tok").await.unwrap();
        let root = tree.root();
        assert_eq!(tree.get(root, "count").unwrap(), Value::Int(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overheld_lease_is_seized_and_commit_fails() {
        let mut manager = StateManager::in_memory(
            counter_schema(),
            Arc::new(SerializerRegistry::new()),
        );
        manager.set_config(ManagerConfig {
            lease_expiration: Duration::from_millis(50),
            token_expiration: None,
        });
        let manager = Arc::new(manager);

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .modify("tok", |tree| {
                        std::thread::sleep(Duration::from_millis(200));
                        tree.set(tree.root(), "count", -1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager
            .modify("tok", |tree| tree.set(tree.root(), "count", 7))
            .await
            .unwrap();

        let err = slow.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::LeaseExpired { .. }));
        // The slow writer lost; the fast writer's value survives.
        let mut tree = manager.load("tok").await.unwrap();
        let root = tree.root();
        assert_eq!(tree.get(root, "count").unwrap(), Value::Int(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_waiter_does_not_wedge_the_queue() {
        let manager = memory_manager();

        let holder = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .modify("tok", |tree| {
                        std::thread::sleep(Duration::from_millis(150));
                        tree.set(tree.root(), "count", 1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A waiter that gives up while still queued behind the holder.
        let gave_up = tokio::time::timeout(
            Duration::from_millis(30),
            manager.modify("tok", |tree| tree.set(tree.root(), "count", 2)),
        )
        .await;
        assert!(gave_up.is_err());

        holder.await.unwrap().unwrap();

        // The abandoned ticket must not block later arrivals.
        tokio::time::timeout(
            Duration::from_secs(2),
            manager.modify("tok", |tree| tree.set(tree.root(), "count", 3)),
        )
        .await
        .expect("lease still reachable after a cancelled waiter")
        .unwrap();

        let mut tree = manager.load("tok").await.unwrap();
        let root = tree.root();
        assert_eq!(tree.get(root, "count").unwrap(), Value::Int(3));
    }

    #[tokio::test]
    async fn kv_backing_persists_across_managers() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let serializers = Arc::new(SerializerRegistry::new());

        let first = StateManager::with_store(counter_schema(), serializers.clone(), store.clone());
        first
            .modify("tok", |tree| tree.set(tree.root(), "count", 9))
            .await
            .unwrap();

        let second = StateManager::with_store(counter_schema(), serializers, store);
        let mut tree = second.load("tok").await.unwrap();
        let root = tree.root();
        assert_eq!(tree.get(root, "count").unwrap(), Value::Int(9));
    }

    #[tokio::test]
    async fn process_event_persists_the_mutation() {
        let manager = memory_manager();
        let (tx, mut rx) = mpsc::channel(8);
        manager
            .process_event(&Event::new("tok", "app.increment"), &tx)
            .await
            .unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.delta["app"]["count"], serde_json::json!(1));
        assert!(frame.is_final);

        let mut tree = manager.load("tok").await.unwrap();
        let root = tree.root();
        assert_eq!(tree.get(root, "count").unwrap(), Value::Int(1));
    }

    #[tokio::test]
    async fn evict_resets_a_client() {
        let manager = memory_manager();
        manager
            .modify("tok", |tree| tree.set(tree.root(), "count", 3))
            .await
            .unwrap();
        manager.evict("tok").await.unwrap();

        let mut tree = manager.load("tok").await.unwrap();
        let root = tree.root();
        assert_eq!(tree.get(root, "count").unwrap(), Value::Int(0));
    }

    #[tokio::test]
    async fn hydrate_renders_every_visible_field() {
        let manager = memory_manager();
        let full = manager.hydrate("tok").await.unwrap();
        assert_eq!(full["app"]["count"], serde_json::json!(0));
    }
}
