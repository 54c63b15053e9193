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
    cell::UnsafeCell,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use bitflags::bitflags;

use crate::deque::Link;

/// Sentinel for "no per-entry deadline".
pub(crate) const NO_DEADLINE: u64 = u64::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u32 {
        /// The node was removed from its shard map. The policy drops it on
        /// the next drain instead of evicting it.
        const RETIRED = 0b001;
        /// The node is linked in the write-order deque.
        const IN_WRITE_ORDER = 0b010;
        /// The node is scheduled in the timer wheel.
        const IN_TIMER_WHEEL = 0b100;
    }
}

/// Which policy list holds the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Region {
    Eden,
    Probation,
    Protected,
    /// Weightless entries are resident but exempt from size eviction.
    ZeroWeight,
    /// Detached from every policy structure.
    Dead,
}

/// Policy-owned bookkeeping of a node.
///
/// Mutated only under the eviction lock.
pub(crate) struct PolicyBlock<K, V> {
    pub region: Region,
    /// Weight the policy currently accounts for. Reconciled against the
    /// node's live weight when update tasks are drained.
    pub weight: u32,
    pub access: Link<K, V>,
    pub write: Link<K, V>,
    pub timer: Link<K, V>,
    /// Wheel coordinates (level, bucket) while scheduled.
    pub timer_slot: (u8, u8),
}

impl<K, V> Default for PolicyBlock<K, V> {
    fn default() -> Self {
        Self {
            region: Region::Dead,
            weight: 0,
            access: Link::default(),
            write: Link::default(),
            timer: Link::default(),
            timer_slot: (0, 0),
        }
    }
}

/// One cached entry.
///
/// The shard map uniquely owns the node; the policy holds one extra strong
/// count while the node is resident; buffers hold transient clones that are
/// cleared on drain.
pub(crate) struct Node<K, V> {
    key: K,
    hash: u64,
    /// Guarded by the owning shard's lock: shared reads under the read
    /// guard, replacement under the write guard.
    value: UnsafeCell<V>,
    /// Latest weigher result; authoritative over `PolicyBlock::weight`.
    weight: AtomicU32,
    flags: AtomicU32,
    access_time: AtomicU64,
    write_time: AtomicU64,
    /// Variable-expiry deadline, [`NO_DEADLINE`] when unset.
    expire_at: AtomicU64,
    policy: UnsafeCell<PolicyBlock<K, V>>,
}

// Safety: `value` is guarded by the owning shard's lock and `policy` by the
// eviction lock; the remaining fields are atomics and immutable data.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Node<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Node<K, V> {}

impl<K, V> Node<K, V> {
    pub fn new(key: K, hash: u64, value: V, weight: u32, now: u64) -> Self {
        Self {
            key,
            hash,
            value: UnsafeCell::new(value),
            weight: AtomicU32::new(weight),
            flags: AtomicU32::new(NodeFlags::empty().bits()),
            access_time: AtomicU64::new(now),
            write_time: AtomicU64::new(now),
            expire_at: AtomicU64::new(NO_DEADLINE),
            policy: UnsafeCell::new(PolicyBlock::default()),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// # Safety
    ///
    /// The owning shard's lock must be held (read or write).
    pub unsafe fn value(&self) -> &V {
        &*self.value.get()
    }

    /// # Safety
    ///
    /// The owning shard's write lock must be held.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn replace_value(&self, value: V) -> V {
        std::mem::replace(&mut *self.value.get(), value)
    }

    /// # Safety
    ///
    /// The eviction lock must be held.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn policy_mut(&self) -> &mut PolicyBlock<K, V> {
        &mut *self.policy.get()
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Acquire)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Release);
    }

    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: NodeFlags, on: bool) {
        if on {
            self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        }
    }

    pub fn is_retired(&self) -> bool {
        self.flags().contains(NodeFlags::RETIRED)
    }

    pub fn retire(&self) {
        self.set_flags(NodeFlags::RETIRED, true);
    }

    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Acquire)
    }

    pub fn touch_access(&self, now: u64) {
        self.access_time.store(now, Ordering::Release);
    }

    pub fn write_time(&self) -> u64 {
        self.write_time.load(Ordering::Acquire)
    }

    pub fn touch_write(&self, now: u64) {
        self.write_time.store(now, Ordering::Release);
        self.access_time.store(now, Ordering::Release);
    }

    pub fn expire_at(&self) -> u64 {
        self.expire_at.load(Ordering::Acquire)
    }

    pub fn set_expire_at(&self, deadline: u64) {
        self.expire_at.store(deadline, Ordering::Release);
    }

    /// Whether any configured deadline has passed at `now`.
    pub fn is_expired(&self, now: u64, access_ttl: Option<u64>, write_ttl: Option<u64>) -> bool {
        if let Some(ttl) = access_ttl {
            if now.saturating_sub(self.access_time()) >= ttl {
                return true;
            }
        }
        if let Some(ttl) = write_ttl {
            if now.saturating_sub(self.write_time()) >= ttl {
                return true;
            }
        }
        let deadline = self.expire_at();
        deadline != NO_DEADLINE && now >= deadline
    }

    /// Takes a strong count for the policy. Paired with [`Node::release`].
    pub fn retain(node: &Arc<Self>) -> NonNull<Self> {
        let ptr = Arc::into_raw(Arc::clone(node));
        // Arc::into_raw never returns null.
        unsafe { NonNull::new_unchecked(ptr.cast_mut()) }
    }

    /// Drops a strong count taken by [`Node::retain`].
    ///
    /// # Safety
    ///
    /// `ptr` must originate from [`Node::retain`] and be released exactly
    /// once.
    pub unsafe fn release(ptr: NonNull<Self>) {
        drop(Arc::from_raw(ptr.as_ptr()));
    }
}
