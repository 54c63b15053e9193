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

use std::ptr::NonNull;

use itertools::Itertools;

use crate::{
    deque::{Deque, TimerOrder},
    node::{Node, NodeFlags},
};

/// Buckets per level: ~1.07s, ~1.14m, ~1.22h, ~1.63d spans, then overflow.
const BUCKET_COUNTS: [u64; 5] = [64, 64, 32, 4, 1];
const SHIFTS: [u32; 5] = [30, 36, 42, 47, 49];
const SPANS: [u64; 6] = [1 << 30, 1 << 36, 1 << 42, 1 << 47, 1 << 49, u64::MAX];

/// Hierarchical timer wheel for per-entry expiry deadlines.
///
/// Buckets hold unordered nodes whose deadlines fall within the bucket's
/// span. Advancing the wheel drains the buckets passed by the clock and
/// cascades still-pending nodes into finer levels. All methods require the
/// eviction lock.
pub(crate) struct TimerWheel<K, V> {
    wheels: Vec<Vec<Deque<K, V, TimerOrder>>>,
    nanos: u64,
}

impl<K, V> TimerWheel<K, V> {
    pub fn new(now: u64) -> Self {
        Self {
            wheels: BUCKET_COUNTS
                .iter()
                .map(|count| (0..*count).map(|_| Deque::default()).collect_vec())
                .collect_vec(),
            nanos: now,
        }
    }

    /// # Safety
    ///
    /// The eviction lock must be held and the node must not be scheduled.
    pub unsafe fn schedule(&mut self, ptr: NonNull<Node<K, V>>) {
        let node = ptr.as_ref();
        debug_assert!(!node.flags().contains(NodeFlags::IN_TIMER_WHEEL));
        let (level, bucket) = self.slot_of(node.expire_at());
        node.policy_mut().timer_slot = (level as u8, bucket as u8);
        self.wheels[level][bucket].push_back(ptr);
        node.set_flags(NodeFlags::IN_TIMER_WHEEL, true);
    }

    /// # Safety
    ///
    /// The eviction lock must be held and the node must be scheduled.
    pub unsafe fn deschedule(&mut self, ptr: NonNull<Node<K, V>>) {
        let node = ptr.as_ref();
        debug_assert!(node.flags().contains(NodeFlags::IN_TIMER_WHEEL));
        let (level, bucket) = node.policy_mut().timer_slot;
        self.wheels[level as usize][bucket as usize].unlink(ptr);
        node.set_flags(NodeFlags::IN_TIMER_WHEEL, false);
    }

    /// Moves the clock to `now`, collecting nodes whose deadline has passed
    /// and cascading the rest towards finer levels.
    ///
    /// # Safety
    ///
    /// The eviction lock must be held.
    pub unsafe fn advance(&mut self, now: u64, expired: &mut Vec<NonNull<Node<K, V>>>) {
        let prev = self.nanos;
        if now <= prev {
            return;
        }
        self.nanos = now;

        for level in 0..SHIFTS.len() {
            let prev_ticks = prev >> SHIFTS[level];
            let delta = (now >> SHIFTS[level]) - prev_ticks;
            if delta == 0 {
                break;
            }

            let mask = BUCKET_COUNTS[level] - 1;
            let steps = (delta + 1).min(BUCKET_COUNTS[level]);

            // Drain first: a cascaded node may land in a bucket that is
            // still being traversed.
            let mut pending = vec![];
            for step in 0..steps {
                let bucket = ((prev_ticks + step) & mask) as usize;
                while let Some(ptr) = self.wheels[level][bucket].pop_front() {
                    ptr.as_ref().set_flags(NodeFlags::IN_TIMER_WHEEL, false);
                    pending.push(ptr);
                }
            }
            for ptr in pending {
                if ptr.as_ref().expire_at() <= now {
                    expired.push(ptr);
                } else {
                    self.schedule(ptr);
                }
            }
        }
    }

    fn slot_of(&self, deadline: u64) -> (usize, usize) {
        // A deadline in the past lands in the current tick's bucket, which
        // the next advance traverses.
        let deadline = deadline.max(self.nanos);
        let duration = deadline - self.nanos;
        for level in 0..SHIFTS.len() {
            if duration < SPANS[level + 1] {
                let ticks = deadline >> SHIFTS[level];
                return (level, (ticks & (BUCKET_COUNTS[level] - 1)) as usize);
            }
        }
        unreachable!()
    }
}
