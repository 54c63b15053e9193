//  Copyright 2025 Larder Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    borrow::Borrow,
    collections::HashMap as StdHashMap,
    fmt,
    future::Future,
    hash::Hash,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use ahash::RandomState;
use futures::FutureExt;
use hashbrown::{hash_map::Entry as HashMapEntry, HashMap, HashSet};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    buffer::{ReadBuffer, ReadOffer, WriteBuffer, WriteTask},
    code::{HashBuilder, Key, Value},
    config::{CacheConfig, CacheOptions, Expiry, Weigher},
    error::{Error, Result},
    listener::{RemovalCause, RemovalQueue},
    metrics::Metrics,
    node::{Node, NO_DEADLINE},
    policy::{Policy, PolicySnapshot},
    time::Ticker,
};

// Drain status of the maintenance state machine. Compare-and-set
// transitions guarantee at most one active drainer; a request posted while
// one is processing flips it into another pass before the lock is released.
const IDLE: u32 = 0;
const REQUIRED: u32 = 1;
const PROCESSING_TO_IDLE: u32 = 2;
const PROCESSING_TO_REQUIRED: u32 = 3;

type Waiters<V> = Vec<oneshot::Sender<Result<V>>>;

struct Shard<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    map: HashMap<K, Arc<Node<K, V>>, S>,
    /// Callers waiting on the in-flight load of a key. The presence of a
    /// (possibly empty) entry marks the load as claimed.
    waiters: HashMap<K, Waiters<V>>,
}

impl<K, V, S> Shard<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn new(hash_builder: S) -> Self {
        Self {
            map: HashMap::with_hasher(hash_builder),
            waiters: HashMap::default(),
        }
    }
}

/// A bounded, concurrent in-memory cache with Window-TinyLFU eviction.
///
/// Reads and writes go through sharded hash tables and enqueue events into
/// lock-free buffers; a single maintenance routine drains the buffers under
/// a try-locked eviction mutex and replays them against the policy. Policy
/// observations are therefore eventually consistent, while reads and writes
/// of a key are linearizable through its shard.
///
/// Loaders passed to [`Cache::get_with`] run inside the key's shard critical
/// section and must not call back into the cache.
pub struct Cache<K, V, S = RandomState>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    shards: Vec<RwLock<Shard<K, V, S>>>,

    read_buffer: ReadBuffer<K, V>,
    write_buffer: WriteBuffer<K, V>,
    drain_status: AtomicU32,
    policy: Mutex<Policy<K, V>>,
    /// Mirror of the policy's weighted size, refreshed by maintenance.
    weighted_size: AtomicU64,

    removals: RemovalQueue<K, V>,
    metrics: Metrics,

    weigher: Option<Arc<dyn Weigher<K, V>>>,
    expiry: Option<Arc<dyn Expiry<K, V>>>,
    expire_after_access: Option<u64>,
    expire_after_write: Option<u64>,
    ticker: Arc<dyn Ticker>,
    hash_builder: S,
    options: CacheOptions,
}

impl<K, V> Cache<K, V>
where
    K: Key,
    V: Value,
{
    /// Creates an unbounded cache. Use [`CacheConfig`] for anything else.
    pub fn unbounded() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Creates a cache bounded by total weight.
    pub fn with_maximum_weight(maximum_weight: u64) -> Self {
        Self::new(CacheConfig::with_maximum_weight(maximum_weight))
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    pub fn new(config: CacheConfig<K, V, S>) -> Self {
        let shards = config.shards.max(1).next_power_of_two();
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let now = config.ticker.read();
        let options = config.options();

        let expire_after_access = config.expire_after_access.map(|d| d.as_nanos() as u64);
        let expire_after_write = config.expire_after_write.map(|d| d.as_nanos() as u64);
        let policy = Policy::new(
            config.maximum_weight,
            expire_after_access,
            expire_after_write,
            config.expiry.is_some(),
            now,
        );

        Self {
            shards: (0..shards)
                .map(|_| RwLock::new(Shard::new(config.hash_builder.clone())))
                .collect_vec(),
            read_buffer: ReadBuffer::new(parallelism),
            write_buffer: WriteBuffer::new((128 * parallelism).next_power_of_two()),
            drain_status: AtomicU32::new(IDLE),
            policy: Mutex::new(policy),
            weighted_size: AtomicU64::new(0),
            removals: RemovalQueue::new(config.removal_listener),
            metrics: Metrics::default(),
            weigher: config.weigher,
            expiry: config.expiry,
            expire_after_access,
            expire_after_write,
            ticker: config.ticker,
            hash_builder: config.hash_builder,
            options,
        }
    }

    /// Returns the value of the key if present and not expired.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        let now = self.ticker.read();

        let mut saw_expired = false;
        let hit = {
            let shard = self.shard_for(hash).read();
            shard.map.get(key).and_then(|node| {
                if node.is_expired(now, self.expire_after_access, self.expire_after_write) {
                    saw_expired = true;
                    None
                } else {
                    node.touch_access(now);
                    let value = unsafe { node.value() }.clone();
                    Some((node.clone(), value))
                }
            })
        };

        match hit {
            Some((node, value)) => {
                self.metrics.hit.fetch_add(1, Ordering::Relaxed);
                self.after_read(node);
                Some(value)
            }
            None => {
                self.metrics.miss.fetch_add(1, Ordering::Relaxed);
                if saw_expired {
                    self.schedule_after_read();
                }
                None
            }
        }
    }

    /// Whether the key is present and not expired.
    ///
    /// Unlike [`Cache::get`] this is not a policy read: it does not touch
    /// recency or the frequency sketch.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        let now = self.ticker.read();
        let shard = self.shard_for(hash).read();
        shard
            .map
            .get(key)
            .map(|node| !node.is_expired(now, self.expire_after_access, self.expire_after_write))
            .unwrap_or(false)
    }

    /// Inserts a key-value pair, replacing any current value.
    pub fn insert(&self, key: K, value: V) {
        let hash = self.hash_of(&key);
        let now = self.ticker.read();

        let (task, completed, replaced) = {
            let mut shard = self.shard_for(hash).write();
            self.upsert(&mut shard, hash, key, value, now)
        };

        self.complete_waiters(completed);
        match &replaced {
            Some(_) => self.metrics.update.fetch_add(1, Ordering::Relaxed),
            None => self.metrics.insert.fetch_add(1, Ordering::Relaxed),
        };
        if let Some((key, old, cause)) = replaced {
            self.removals.push(key, old, cause);
        }
        self.after_write(task);
        self.removals.flush();
    }

    pub fn insert_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in entries {
            self.insert(key, value);
        }
    }

    /// Discards the cached value of the key, returning it.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        let removed = {
            let mut shard = self.shard_for(hash).write();
            shard.map.remove(key).map(|node| {
                node.retire();
                let value = unsafe { node.value() }.clone();
                (node, value)
            })
        };

        let (node, value) = removed?;
        self.metrics.remove.fetch_add(1, Ordering::Relaxed);
        self.removals
            .push(node.key().clone(), value.clone(), RemovalCause::Explicit);
        self.after_write(WriteTask::Removed(node));
        self.removals.flush();
        Some(value)
    }

    /// Discards the cached value of the key.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _ = self.remove(key);
    }

    /// Discards the cached values of the keys.
    pub fn invalidate_keys(&self, keys: impl IntoIterator<Item = K>) {
        for key in keys {
            self.invalidate(&key);
        }
    }

    /// Discards every cached value.
    pub fn invalidate_all(&self) {
        for shard in &self.shards {
            let drained = {
                let mut guard = shard.write();
                guard
                    .map
                    .drain()
                    .map(|(_, node)| {
                        node.retire();
                        let value = unsafe { node.value() }.clone();
                        (node, value)
                    })
                    .collect_vec()
            };
            for (node, value) in drained {
                self.metrics.remove.fetch_add(1, Ordering::Relaxed);
                self.removals
                    .push(node.key().clone(), value, RemovalCause::Explicit);
                self.after_write(WriteTask::Removed(node));
            }
        }
        self.removals.flush();
    }

    /// Discards every cached value the predicate selects.
    pub fn invalidate_entries_if(&self, mut predicate: impl FnMut(&K, &V) -> bool) {
        for shard in &self.shards {
            // Collect first: the map cannot be iterated and mutated at once.
            let removed = {
                let mut guard = shard.write();
                let selected = guard
                    .map
                    .iter()
                    .filter(|(key, node)| predicate(key, unsafe { node.value() }))
                    .map(|(key, _)| key.clone())
                    .collect_vec();
                selected
                    .into_iter()
                    .filter_map(|key| {
                        guard.map.remove(&key).map(|node| {
                            node.retire();
                            let value = unsafe { node.value() }.clone();
                            (node, value)
                        })
                    })
                    .collect_vec()
            };
            for (node, value) in removed {
                self.metrics.remove.fetch_add(1, Ordering::Relaxed);
                self.removals
                    .push(node.key().clone(), value, RemovalCause::Explicit);
                self.after_write(WriteTask::Removed(node));
            }
        }
        self.removals.flush();
    }

    /// Atomically mutates the mapping of a key.
    ///
    /// The function runs exactly once inside the key's shard critical
    /// section; returning `None` removes the mapping. The current value is
    /// passed only if it has not expired.
    pub fn compute<F>(&self, key: K, f: F) -> Option<V>
    where
        F: FnOnce(&K, Option<V>) -> Option<V>,
    {
        let hash = self.hash_of(&key);
        let now = self.ticker.read();
        let mut shard = self.shard_for(hash).write();

        let current = shard.map.get(&key).and_then(|node| {
            if node.is_expired(now, self.expire_after_access, self.expire_after_write) {
                None
            } else {
                Some(unsafe { node.value() }.clone())
            }
        });

        match f(&key, current) {
            Some(value) => {
                let result = value.clone();
                let (task, completed, replaced) = self.upsert(&mut shard, hash, key, value, now);
                drop(shard);

                self.complete_waiters(completed);
                match &replaced {
                    Some(_) => self.metrics.update.fetch_add(1, Ordering::Relaxed),
                    None => self.metrics.insert.fetch_add(1, Ordering::Relaxed),
                };
                if let Some((key, old, cause)) = replaced {
                    self.removals.push(key, old, cause);
                }
                self.after_write(task);
                self.removals.flush();
                Some(result)
            }
            None => {
                let removed = shard.map.remove(&key).map(|node| {
                    node.retire();
                    let value = unsafe { node.value() }.clone();
                    (node, value)
                });
                drop(shard);

                if let Some((node, value)) = removed {
                    self.metrics.remove.fetch_add(1, Ordering::Relaxed);
                    self.removals
                        .push(node.key().clone(), value, RemovalCause::Explicit);
                    self.after_write(WriteTask::Removed(node));
                    self.removals.flush();
                }
                None
            }
        }
    }

    /// Returns the value of the key, running the loader on a miss.
    ///
    /// The loader runs inside the key's shard critical section, so among
    /// concurrent callers of the key it runs exactly once. A loader error is
    /// recorded and surfaced; no entry is retained for it.
    pub fn get_with<F, E>(&self, key: K, load: F) -> Result<V>
    where
        F: FnOnce(&K) -> std::result::Result<V, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let hash = self.hash_of(&key);
        let now = self.ticker.read();
        let mut shard = self.shard_for(hash).write();

        // Re-check: the load may have completed while waiting on the lock.
        if let Some(node) = shard.map.get(&key) {
            if !node.is_expired(now, self.expire_after_access, self.expire_after_write) {
                let node = node.clone();
                node.touch_access(now);
                let value = unsafe { node.value() }.clone();
                drop(shard);
                self.after_read(node);
                return Ok(value);
            }
        }

        let started = self.ticker.read();
        match load(&key) {
            Ok(value) => {
                self.record_load_success(started);
                let result = value.clone();
                let (task, completed, replaced) = self.upsert(&mut shard, hash, key, value, now);
                drop(shard);

                self.complete_waiters(completed);
                match &replaced {
                    Some(_) => self.metrics.update.fetch_add(1, Ordering::Relaxed),
                    None => self.metrics.insert.fetch_add(1, Ordering::Relaxed),
                };
                if let Some((key, old, cause)) = replaced {
                    self.removals.push(key, old, cause);
                }
                self.after_write(task);
                self.removals.flush();
                Ok(result)
            }
            Err(e) => {
                drop(shard);
                self.metrics.load_failure.fetch_add(1, Ordering::Relaxed);
                Err(Error::load(e))
            }
        }
    }

    /// Forces a full maintenance pass: drains the buffers, expires and
    /// evicts entries, and delivers pending removal notifications.
    /// Idempotent.
    pub fn run_pending_tasks(&self) {
        {
            let mut policy = self.policy.lock();
            self.maintain(&mut policy);
        }
        self.removals.flush();
    }

    /// Estimated number of entries. Pending policy work may make this
    /// transiently diverge from the resident count.
    pub fn entry_count(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.read().map.len() as u64)
            .sum()
    }

    /// Weighted size as of the last maintenance pass.
    pub fn weighted_size(&self) -> u64 {
        self.weighted_size.load(Ordering::Acquire)
    }

    /// Current limits and occupancy of the eviction policy.
    pub fn policy(&self) -> PolicySnapshot {
        self.policy.lock().snapshot()
    }

    /// Keys in approximate eviction order, coldest first.
    pub fn coldest(&self, n: usize) -> Vec<K> {
        let policy = self.policy.lock();
        unsafe { policy.coldest(n) }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Point-in-time snapshot of the live entries.
    pub fn as_map(&self) -> StdHashMap<K, V> {
        let now = self.ticker.read();
        let mut snapshot = StdHashMap::new();
        for shard in &self.shards {
            let guard = shard.read();
            for (key, node) in guard.map.iter() {
                if !node.is_expired(now, self.expire_after_access, self.expire_after_write) {
                    snapshot.insert(key.clone(), unsafe { node.value() }.clone());
                }
            }
        }
        snapshot
    }

    /// Snapshot iterator over the live entries, in arbitrary order.
    ///
    /// Iteration is not a policy read.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> {
        self.as_map().into_iter()
    }

    fn hash_of<Q>(&self, key: &Q) -> u64
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.hash_builder.hash_one(key)
    }

    fn shard_for(&self, hash: u64) -> &RwLock<Shard<K, V, S>> {
        &self.shards[hash as usize % self.shards.len()]
    }

    fn weigh(&self, key: &K, value: &V) -> u32 {
        self.weigher
            .as_ref()
            .map(|weigher| weigher.weigh(key, value))
            .unwrap_or(1)
    }

    fn deadline_of(&self, key: &K, value: &V, now: u64) -> u64 {
        self.expiry
            .as_ref()
            .and_then(|expiry| expiry.expire_after(key, value))
            .map(|duration| now.saturating_add(duration.as_nanos() as u64))
            .unwrap_or(NO_DEADLINE)
    }

    fn record_load_success(&self, started: u64) {
        self.metrics.load_success.fetch_add(1, Ordering::Relaxed);
        self.metrics.load_nanos.fetch_add(
            self.ticker.read().saturating_sub(started),
            Ordering::Relaxed,
        );
    }

    /// Inserts or replaces under the held shard lock.
    ///
    /// Returns the pending write task, the waiters to complete with the new
    /// value, and the replaced value with its removal cause.
    #[allow(clippy::type_complexity)]
    fn upsert(
        &self,
        shard: &mut Shard<K, V, S>,
        hash: u64,
        key: K,
        value: V,
        now: u64,
    ) -> (
        WriteTask<K, V>,
        Option<(Waiters<V>, V)>,
        Option<(K, V, RemovalCause)>,
    ) {
        let weight = self.weigh(&key, &value);
        let deadline = self.deadline_of(&key, &value, now);
        let completed = shard
            .waiters
            .remove(&key)
            .filter(|waiters| !waiters.is_empty())
            .map(|waiters| (waiters, value.clone()));

        match shard.map.get(&key) {
            Some(node) => {
                let node = node.clone();
                // Writing over an expired entry surfaces the expiry, not a
                // replacement.
                let cause = if node.is_expired(now, self.expire_after_access, self.expire_after_write)
                {
                    RemovalCause::Expired
                } else {
                    RemovalCause::Replaced
                };
                let old = unsafe { node.replace_value(value) };
                node.set_weight(weight);
                node.touch_write(now);
                node.set_expire_at(deadline);
                (WriteTask::Updated(node), completed, Some((key, old, cause)))
            }
            None => {
                let node = Arc::new(Node::new(key.clone(), hash, value, weight, now));
                node.set_expire_at(deadline);
                shard.map.insert(key, node.clone());
                (WriteTask::Added(node), completed, None)
            }
        }
    }

    fn complete_waiters(&self, completed: Option<(Waiters<V>, V)>) {
        if let Some((waiters, value)) = completed {
            for tx in waiters {
                let _ = tx.send(Ok(value.clone()));
            }
        }
    }

    fn after_read(&self, node: Arc<Node<K, V>>) {
        match self.read_buffer.offer(node) {
            ReadOffer::Recorded => {}
            ReadOffer::DrainNeeded => self.schedule_after_read(),
            ReadOffer::Dropped => {
                self.metrics.read_drop.fetch_add(1, Ordering::Relaxed);
                self.schedule_after_read();
            }
        }
    }

    fn after_write(&self, mut task: WriteTask<K, V>) {
        loop {
            match self.write_buffer.offer(task) {
                Ok(()) => break,
                Err(returned) => {
                    task = returned;
                    // The write buffer is full: force a drain under a
                    // blocking lock acquire. Write tasks are never dropped.
                    let mut policy = self.policy.lock();
                    self.maintain(&mut policy);
                }
            }
        }
        self.schedule_after_write();
    }

    fn schedule_after_read(&self) {
        if matches!(self.drain_status.load(Ordering::Acquire), IDLE | REQUIRED) {
            self.try_maintain();
        }
    }

    fn schedule_after_write(&self) {
        loop {
            match self.drain_status.load(Ordering::Acquire) {
                IDLE => {
                    let _ = self.drain_status.compare_exchange(
                        IDLE,
                        REQUIRED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.try_maintain();
                    return;
                }
                REQUIRED => {
                    self.try_maintain();
                    return;
                }
                PROCESSING_TO_IDLE => {
                    if self
                        .drain_status
                        .compare_exchange(
                            PROCESSING_TO_IDLE,
                            PROCESSING_TO_REQUIRED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn try_maintain(&self) {
        if let Some(mut policy) = self.policy.try_lock() {
            self.maintain(&mut policy);
            drop(policy);
            self.removals.flush();
        }
    }

    /// One maintenance pass under the eviction lock: replay reads, apply
    /// writes, expire, evict, adapt. Re-runs if a drain request arrives
    /// while processing.
    fn maintain(&self, policy: &mut Policy<K, V>) {
        loop {
            self.drain_status
                .store(PROCESSING_TO_IDLE, Ordering::Release);
            let now = self.ticker.read();

            self.read_buffer
                .drain(|node| unsafe { policy.on_access(&node) });
            self.write_buffer.drain(|task| unsafe { policy.apply(task) });

            for ptr in unsafe { policy.collect_expired(now) } {
                unsafe { self.finish_eviction(ptr, RemovalCause::Expired) };
            }
            for ptr in unsafe { policy.evict_to_capacity() } {
                unsafe { self.finish_eviction(ptr, RemovalCause::Size) };
            }
            unsafe { policy.climb() };

            self.weighted_size
                .store(policy.weighted_size(), Ordering::Release);

            if self
                .drain_status
                .compare_exchange(PROCESSING_TO_IDLE, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        tracing::trace!(
            weighted_size = self.weighted_size.load(Ordering::Relaxed),
            "maintenance pass complete"
        );
    }

    /// Removes a node the policy detached from its shard map and queues the
    /// removal notification.
    ///
    /// # Safety
    ///
    /// Must be called under the eviction lock with a pointer returned by the
    /// policy during this maintenance pass.
    unsafe fn finish_eviction(&self, ptr: NonNull<Node<K, V>>, cause: RemovalCause) {
        let node = ptr.as_ref();
        if node.is_retired() {
            // An explicit removal already owns the notification.
            return;
        }
        let removed = {
            let mut shard = self.shard_for(node.hash()).write();
            match shard.map.remove(node.key()) {
                Some(existing) if std::ptr::eq(Arc::as_ptr(&existing), ptr.as_ptr()) => {
                    existing.retire();
                    let value = existing.value().clone();
                    Some((existing.key().clone(), value))
                }
                Some(other) => {
                    // A different node owns the key now; put it back.
                    shard.map.insert(other.key().clone(), other);
                    None
                }
                None => None,
            }
        };
        if let Some((key, value)) = removed {
            match cause {
                RemovalCause::Expired => self.metrics.expire.fetch_add(1, Ordering::Relaxed),
                _ => self.metrics.evict.fetch_add(1, Ordering::Relaxed),
            };
            self.removals.push(key, value, cause);
        }
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Returns the value of the key, loading it asynchronously on a miss.
    ///
    /// At most one load per key is in flight: the first caller spawns the
    /// loader on the ambient tokio runtime, later callers wait on its
    /// outcome. A failed load completes every waiter with the error and
    /// retains no entry.
    pub fn fetch<F, FU, E>(self: &Arc<Self>, key: K, f: F) -> Entry<V>
    where
        F: FnOnce() -> FU,
        FU: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let hash = self.hash_of(&key);
        let now = self.ticker.read();
        let mut shard = self.shard_for(hash).write();

        if let Some(node) = shard.map.get(&key) {
            if !node.is_expired(now, self.expire_after_access, self.expire_after_write) {
                let node = node.clone();
                node.touch_access(now);
                let value = unsafe { node.value() }.clone();
                drop(shard);
                self.metrics.hit.fetch_add(1, Ordering::Relaxed);
                self.after_read(node);
                return Entry::Hit(value);
            }
        }
        self.metrics.miss.fetch_add(1, Ordering::Relaxed);

        match shard.waiters.entry(key.clone()) {
            HashMapEntry::Occupied(mut o) => {
                let (tx, rx) = oneshot::channel();
                o.get_mut().push(tx);
                Entry::Wait(rx)
            }
            HashMapEntry::Vacant(v) => {
                v.insert(vec![]);
                drop(shard);

                let cache = self.clone();
                let future = f();
                let join = tokio::spawn(async move {
                    let started = cache.ticker.read();
                    match future.await {
                        Ok(value) => {
                            cache.record_load_success(started);
                            // The insert completes the waiters.
                            cache.insert(key, value.clone());
                            Ok(value)
                        }
                        Err(e) => {
                            cache.metrics.load_failure.fetch_add(1, Ordering::Relaxed);
                            let waiters = {
                                let hash = cache.hash_of(&key);
                                let mut shard = cache.shard_for(hash).write();
                                shard.waiters.remove(&key)
                            };
                            let error = Error::load(e);
                            for tx in waiters.into_iter().flatten() {
                                let _ = tx.send(Err(error.clone()));
                            }
                            Err(error)
                        }
                    }
                });
                Entry::Miss(join)
            }
        }
    }

    /// Reloads the key in the background. On success the value is replaced;
    /// on failure the current value is kept and the failure recorded.
    pub fn refresh<F, FU, E>(self: &Arc<Self>, key: K, f: F) -> JoinHandle<Result<V>>
    where
        F: FnOnce() -> FU,
        FU: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let cache = self.clone();
        let future = f();
        tokio::spawn(async move {
            let started = cache.ticker.read();
            match future.await {
                Ok(value) => {
                    cache.record_load_success(started);
                    cache.insert(key, value.clone());
                    Ok(value)
                }
                Err(e) => {
                    cache.metrics.load_failure.fetch_add(1, Ordering::Relaxed);
                    Err(Error::load(e))
                }
            }
        })
    }

    /// Returns the values of the keys, loading the absent ones with a
    /// single bulk loader call.
    ///
    /// The loader may return more entries than requested; the extras are
    /// cached but not included in the result.
    pub async fn get_all<I, F, FU, M, E>(&self, keys: I, load: F) -> Result<StdHashMap<K, V>>
    where
        I: IntoIterator<Item = K>,
        F: FnOnce(Vec<K>) -> FU,
        FU: Future<Output = std::result::Result<M, E>>,
        M: IntoIterator<Item = (K, V)>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut found = StdHashMap::new();
        let mut missing = vec![];
        let mut requested = HashSet::new();
        for key in keys {
            if !requested.insert(key.clone()) {
                continue;
            }
            match self.get(&key) {
                Some(value) => {
                    found.insert(key, value);
                }
                None => missing.push(key),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let started = self.ticker.read();
        match load(missing).await {
            Ok(loaded) => {
                self.record_load_success(started);
                for (key, value) in loaded {
                    if requested.contains(&key) && !found.contains_key(&key) {
                        found.insert(key.clone(), value.clone());
                    }
                    self.insert(key, value);
                }
                Ok(found)
            }
            Err(e) => {
                self.metrics.load_failure.fetch_add(1, Ordering::Relaxed);
                Err(Error::load(e))
            }
        }
    }
}

impl<K, V, S> fmt::Debug for Cache<K, V, S>
where
    K: Key + fmt::Debug,
    V: Value + fmt::Debug,
    S: HashBuilder,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.as_map()).finish()
    }
}

/// Outcome of [`Cache::fetch`], readable as a future of the value.
pub enum Entry<V> {
    Invalid,
    Hit(V),
    Wait(oneshot::Receiver<Result<V>>),
    Miss(JoinHandle<Result<V>>),
}

impl<V> Default for Entry<V> {
    fn default() -> Self {
        Self::Invalid
    }
}

impl<V: Unpin> Future for Entry<V> {
    type Output = Result<V>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match &mut *self {
            Self::Invalid => unreachable!(),
            Self::Hit(_) => std::task::Poll::Ready(Ok(match std::mem::take(&mut *self) {
                Entry::Hit(value) => value,
                _ => unreachable!(),
            })),
            Self::Wait(waiter) => waiter.poll_unpin(cx).map(|result| match result {
                Ok(outcome) => outcome,
                Err(e) => Err(e.into()),
            }),
            Self::Miss(join_handle) => join_handle.poll_unpin(cx).map(|result| match result {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::load(e)),
            }),
        }
    }
}
