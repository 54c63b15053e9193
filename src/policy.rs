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

use std::{ptr::NonNull, sync::Arc};

use crate::{
    buffer::WriteTask,
    code::{Key, Value},
    deque::{AccessOrder, Deque, WriteOrder},
    node::{Node, NodeFlags, Region, NO_DEADLINE},
    sketch::FrequencySketch,
    wheel::TimerWheel,
};

/// Fraction of the capacity kept out of the eden window.
const PERCENT_MAIN: f64 = 0.99;
/// Fraction of the main space reserved for the protected region.
const PERCENT_MAIN_PROTECTED: f64 = 0.80;
/// Candidates at or below this frequency lose admission ties outright.
const ADMIT_HASHDOS_THRESHOLD: u8 = 5;

const HILL_CLIMBER_STEP_PERCENT: f64 = 0.0625;
const HILL_CLIMBER_STEP_DECAY_RATE: f64 = 0.98;
const HILL_CLIMBER_RESTART_THRESHOLD: f64 = 0.05;

/// Window-TinyLFU policy state.
///
/// The single authority over the deques, the frequency sketch, and the
/// weighted size. Owned by the eviction lock; every pointer-taking method
/// requires it.
pub(crate) struct Policy<K, V> {
    maximum: Option<u64>,
    eden_maximum: u64,
    protected_maximum: u64,

    weighted_size: u64,
    eden_weight: u64,
    probation_weight: u64,
    protected_weight: u64,

    eden: Deque<K, V, AccessOrder>,
    probation: Deque<K, V, AccessOrder>,
    protected: Deque<K, V, AccessOrder>,
    zero_weight: Deque<K, V, AccessOrder>,
    write_order: Deque<K, V, WriteOrder>,
    wheel: Option<TimerWheel<K, V>>,

    sketch: FrequencySketch,
    sketch_enabled: bool,

    expire_after_access: Option<u64>,
    expire_after_write: Option<u64>,

    hits_in_sample: u64,
    misses_in_sample: u64,
    previous_hit_rate: f64,
    step_size: f64,
    sample_threshold: u64,

    rng_state: u64,
}

// Safety: the policy is only ever reached through the eviction mutex; the
// raw node pointers it holds are kept alive by the strong counts it retains.
unsafe impl<K: Key, V: Value> Send for Policy<K, V> {}

impl<K, V> Policy<K, V>
where
    K: Key,
    V: Value,
{
    pub fn new(
        maximum: Option<u64>,
        expire_after_access: Option<u64>,
        expire_after_write: Option<u64>,
        has_variable_expiry: bool,
        now: u64,
    ) -> Self {
        let (eden_maximum, protected_maximum) = region_maximums(maximum);
        Self {
            maximum,
            eden_maximum,
            protected_maximum,
            weighted_size: 0,
            eden_weight: 0,
            probation_weight: 0,
            protected_weight: 0,
            eden: Deque::default(),
            probation: Deque::default(),
            protected: Deque::default(),
            zero_weight: Deque::default(),
            write_order: Deque::default(),
            wheel: has_variable_expiry.then(|| TimerWheel::new(now)),
            sketch: FrequencySketch::default(),
            sketch_enabled: false,
            expire_after_access,
            expire_after_write,
            hits_in_sample: 0,
            misses_in_sample: 0,
            previous_hit_rate: 0.0,
            step_size: maximum
                .map(|m| HILL_CLIMBER_STEP_PERCENT * m as f64)
                .unwrap_or(0.0),
            sample_threshold: maximum
                .map(|m| m.max(1).saturating_mul(10))
                .unwrap_or(u64::MAX),
            rng_state: 0x9e37_79b9_7f4a_7c15,
        }
    }

    pub fn weighted_size(&self) -> u64 {
        self.weighted_size
    }

    /// Replays one read event.
    ///
    /// # Safety
    ///
    /// The eviction lock must be held.
    pub unsafe fn on_access(&mut self, node: &Arc<Node<K, V>>) {
        let ptr = NonNull::from(&**node);
        let region = ptr.as_ref().policy_mut().region;
        if region == Region::Dead {
            return;
        }
        self.sketch.increment(node.hash());
        self.hits_in_sample += 1;
        self.reorder(ptr, region);
    }

    /// Applies one write task.
    ///
    /// # Safety
    ///
    /// The eviction lock must be held.
    pub unsafe fn apply(&mut self, task: WriteTask<K, V>) {
        match task {
            WriteTask::Added(node) => self.on_add(node),
            WriteTask::Updated(node) => self.on_update(node),
            WriteTask::Removed(node) => self.on_remove(&node),
        }
    }

    unsafe fn on_add(&mut self, node: Arc<Node<K, V>>) {
        if node.is_retired() {
            // Raced with an explicit removal before ever reaching the
            // policy; the pending removal task is a no-op too.
            return;
        }
        debug_assert_eq!(node.policy_mut().region, Region::Dead);

        let weight = node.weight();
        let ptr = Node::retain(&node);
        node.policy_mut().weight = weight;
        if weight == 0 {
            self.zero_weight.push_back(ptr);
            node.policy_mut().region = Region::ZeroWeight;
        } else {
            self.eden.push_back(ptr);
            node.policy_mut().region = Region::Eden;
            self.eden_weight += weight as u64;
            self.weighted_size += weight as u64;
        }
        if self.expire_after_write.is_some() {
            self.write_order.push_back(ptr);
            node.set_flags(NodeFlags::IN_WRITE_ORDER, true);
        }
        if let Some(wheel) = self.wheel.as_mut() {
            if node.expire_at() != NO_DEADLINE {
                wheel.schedule(ptr);
            }
        }
        self.maybe_enable_sketch();
        self.sketch.increment(node.hash());
        self.misses_in_sample += 1;
    }

    unsafe fn on_update(&mut self, node: Arc<Node<K, V>>) {
        let ptr = NonNull::from(&*node);
        if ptr.as_ref().policy_mut().region == Region::Dead {
            // The add task is still in flight; it picks up the new state.
            return;
        }
        self.reconcile_weight(ptr);
        self.sketch.increment(node.hash());
        let region = ptr.as_ref().policy_mut().region;
        self.reorder(ptr, region);

        if node.flags().contains(NodeFlags::IN_WRITE_ORDER) {
            self.write_order.move_to_back(ptr);
        }
        if let Some(wheel) = self.wheel.as_mut() {
            if node.flags().contains(NodeFlags::IN_TIMER_WHEEL) {
                wheel.deschedule(ptr);
            }
            if node.expire_at() != NO_DEADLINE {
                wheel.schedule(ptr);
            }
        }
    }

    unsafe fn on_remove(&mut self, node: &Arc<Node<K, V>>) {
        let ptr = NonNull::from(&**node);
        if ptr.as_ref().policy_mut().region != Region::Dead {
            self.kill(ptr);
        }
    }

    unsafe fn reorder(&mut self, ptr: NonNull<Node<K, V>>, region: Region) {
        match region {
            Region::Eden => self.eden.move_to_back(ptr),
            Region::Probation => {
                // Promote, demoting the protected overflow back into
                // probation.
                let weight = ptr.as_ref().policy_mut().weight as u64;
                self.probation.unlink(ptr);
                self.protected.push_back(ptr);
                ptr.as_ref().policy_mut().region = Region::Protected;
                self.probation_weight -= weight;
                self.protected_weight += weight;
                self.demote_protected_overflow();
            }
            Region::Protected => self.protected.move_to_back(ptr),
            Region::ZeroWeight => self.zero_weight.move_to_back(ptr),
            Region::Dead => {}
        }
    }

    unsafe fn demote_protected_overflow(&mut self) {
        while self.protected_weight > self.protected_maximum {
            let Some(demoted) = self.protected.pop_front() else {
                break;
            };
            let weight = demoted.as_ref().policy_mut().weight as u64;
            self.probation.push_back(demoted);
            demoted.as_ref().policy_mut().region = Region::Probation;
            self.protected_weight -= weight;
            self.probation_weight += weight;
        }
    }

    unsafe fn reconcile_weight(&mut self, ptr: NonNull<Node<K, V>>) {
        let node = ptr.as_ref();
        let (old, region) = {
            let block = node.policy_mut();
            (block.weight, block.region)
        };
        let new = node.weight();
        if old == new {
            return;
        }
        node.policy_mut().weight = new;

        match region {
            Region::ZeroWeight if new > 0 => {
                // Gained weight: rejoin the sized regions through eden.
                self.zero_weight.unlink(ptr);
                self.eden.push_back(ptr);
                node.policy_mut().region = Region::Eden;
                self.eden_weight += new as u64;
                self.weighted_size += new as u64;
            }
            Region::ZeroWeight => {}
            region if new == 0 => {
                match region {
                    Region::Eden => {
                        self.eden.unlink(ptr);
                        self.eden_weight -= old as u64;
                    }
                    Region::Probation => {
                        self.probation.unlink(ptr);
                        self.probation_weight -= old as u64;
                    }
                    Region::Protected => {
                        self.protected.unlink(ptr);
                        self.protected_weight -= old as u64;
                    }
                    _ => {}
                }
                self.weighted_size -= old as u64;
                self.zero_weight.push_back(ptr);
                node.policy_mut().region = Region::ZeroWeight;
            }
            region => {
                let delta = new as i64 - old as i64;
                add_signed(&mut self.weighted_size, delta);
                match region {
                    Region::Eden => add_signed(&mut self.eden_weight, delta),
                    Region::Probation => add_signed(&mut self.probation_weight, delta),
                    Region::Protected => {
                        add_signed(&mut self.protected_weight, delta);
                        self.demote_protected_overflow();
                    }
                    _ => {}
                }
            }
        }
    }

    /// Unlinks the node from every policy structure and drops the policy's
    /// strong count.
    ///
    /// # Safety
    ///
    /// The eviction lock must be held. The pointer stays valid for the rest
    /// of the maintenance pass through the map's (or a pending task's)
    /// strong count.
    unsafe fn kill(&mut self, ptr: NonNull<Node<K, V>>) {
        let (region, weight) = {
            let block = ptr.as_ref().policy_mut();
            (block.region, block.weight as u64)
        };
        match region {
            Region::Eden => {
                self.eden.unlink(ptr);
                self.eden_weight -= weight;
                self.weighted_size -= weight;
            }
            Region::Probation => {
                self.probation.unlink(ptr);
                self.probation_weight -= weight;
                self.weighted_size -= weight;
            }
            Region::Protected => {
                self.protected.unlink(ptr);
                self.protected_weight -= weight;
                self.weighted_size -= weight;
            }
            Region::ZeroWeight => {
                self.zero_weight.unlink(ptr);
            }
            Region::Dead => return,
        }
        self.finish_kill(ptr);
    }

    /// Second half of [`Policy::kill`]: access links and weights already
    /// settled by the caller.
    unsafe fn finish_kill(&mut self, ptr: NonNull<Node<K, V>>) {
        let node = ptr.as_ref();
        if node.flags().contains(NodeFlags::IN_WRITE_ORDER) {
            self.write_order.unlink(ptr);
            node.set_flags(NodeFlags::IN_WRITE_ORDER, false);
        }
        if node.flags().contains(NodeFlags::IN_TIMER_WHEEL) {
            if let Some(wheel) = self.wheel.as_mut() {
                wheel.deschedule(ptr);
            }
        }
        node.policy_mut().region = Region::Dead;
        Node::release(ptr);
    }

    /// Detaches every entry that passed a deadline by `now` and returns
    /// them for map removal.
    ///
    /// # Safety
    ///
    /// The eviction lock must be held.
    pub unsafe fn collect_expired(&mut self, now: u64) -> Vec<NonNull<Node<K, V>>> {
        let mut expired = vec![];

        if let Some(ttl) = self.expire_after_access {
            for region in [
                Region::Eden,
                Region::Probation,
                Region::Protected,
                Region::ZeroWeight,
            ] {
                loop {
                    let Some(head) = self.access_deque(region).peek_front() else {
                        break;
                    };
                    if now.saturating_sub(head.as_ref().access_time()) < ttl {
                        break;
                    }
                    self.kill(head);
                    expired.push(head);
                }
            }
        }

        if let Some(ttl) = self.expire_after_write {
            loop {
                let Some(head) = self.write_order.peek_front() else {
                    break;
                };
                if now.saturating_sub(head.as_ref().write_time()) < ttl {
                    break;
                }
                self.kill(head);
                expired.push(head);
            }
        }

        let mut timed_out = vec![];
        if let Some(wheel) = self.wheel.as_mut() {
            wheel.advance(now, &mut timed_out);
        }
        for ptr in timed_out {
            if ptr.as_ref().policy_mut().region != Region::Dead {
                self.kill(ptr);
                expired.push(ptr);
            }
        }

        expired
    }

    /// Runs the admission algorithm until the weighted size is within the
    /// maximum; returns the losers for map removal.
    ///
    /// # Safety
    ///
    /// The eviction lock must be held.
    pub unsafe fn evict_to_capacity(&mut self) -> Vec<NonNull<Node<K, V>>> {
        let mut victims = vec![];
        let Some(maximum) = self.maximum else {
            return victims;
        };

        // Drain the eden overflow through admission.
        while self.eden_weight > self.eden_maximum {
            let Some(candidate) = self.eden.pop_front() else {
                break;
            };
            let weight = candidate.as_ref().policy_mut().weight as u64;
            self.eden_weight -= weight;

            if self.weighted_size <= maximum {
                self.probation.push_back(candidate);
                candidate.as_ref().policy_mut().region = Region::Probation;
                self.probation_weight += weight;
                continue;
            }

            let candidate_freq = self.sketch.frequency(candidate.as_ref().hash());
            let admitted = match self.probation.peek_front() {
                Some(victim) => {
                    let victim_freq = self.sketch.frequency(victim.as_ref().hash());
                    let admit = if candidate_freq > victim_freq {
                        true
                    } else if candidate_freq <= ADMIT_HASHDOS_THRESHOLD {
                        false
                    } else {
                        self.coin_flip()
                    };
                    if admit {
                        self.kill(victim);
                        victims.push(victim);
                    }
                    admit
                }
                None => false,
            };
            if admitted {
                self.probation.push_back(candidate);
                candidate.as_ref().policy_mut().region = Region::Probation;
                self.probation_weight += weight;
            } else {
                self.weighted_size -= weight;
                self.finish_kill(candidate);
                victims.push(candidate);
            }
        }

        // The admission pass keeps the heavier of candidate and victim, so
        // the main space may still be over; shed its LRU tail.
        while self.weighted_size > maximum {
            let target = self
                .probation
                .peek_front()
                .or_else(|| self.protected.peek_front())
                .or_else(|| self.eden.peek_front());
            let Some(target) = target else {
                break;
            };
            self.kill(target);
            victims.push(target);
        }

        victims
    }

    /// Adapts the eden/protected split from the sampled hit rate.
    ///
    /// # Safety
    ///
    /// The eviction lock must be held.
    pub unsafe fn climb(&mut self) {
        let Some(maximum) = self.maximum else {
            return;
        };
        let sample = self.hits_in_sample + self.misses_in_sample;
        if sample < self.sample_threshold {
            return;
        }

        let hit_rate = self.hits_in_sample as f64 / sample as f64;
        let change = hit_rate - self.previous_hit_rate;
        let amount = if change >= 0.0 {
            self.step_size
        } else {
            -self.step_size
        };
        self.step_size = if change.abs() >= HILL_CLIMBER_RESTART_THRESHOLD {
            HILL_CLIMBER_STEP_PERCENT * maximum as f64 * amount.signum()
        } else {
            HILL_CLIMBER_STEP_DECAY_RATE * amount
        };
        self.previous_hit_rate = hit_rate;
        self.hits_in_sample = 0;
        self.misses_in_sample = 0;

        let adjustment = amount as i64;
        if adjustment > 0 {
            self.increase_eden(adjustment as u64, maximum);
        } else if adjustment < 0 {
            self.decrease_eden((-adjustment) as u64, maximum);
        }
    }

    unsafe fn increase_eden(&mut self, amount: u64, maximum: u64) {
        let limit = maximum.saturating_sub(1).max(1);
        let quota = amount.min(limit.saturating_sub(self.eden_maximum));
        self.eden_maximum += quota;
        self.rebalance(maximum);
    }

    unsafe fn decrease_eden(&mut self, amount: u64, maximum: u64) {
        let quota = amount.min(self.eden_maximum.saturating_sub(1));
        self.eden_maximum -= quota;
        self.rebalance(maximum);
        // Shed the window overflow without an admission filter.
        while self.eden_weight > self.eden_maximum {
            let Some(ptr) = self.eden.pop_front() else {
                break;
            };
            let weight = ptr.as_ref().policy_mut().weight as u64;
            self.eden_weight -= weight;
            self.probation.push_back(ptr);
            ptr.as_ref().policy_mut().region = Region::Probation;
            self.probation_weight += weight;
        }
    }

    unsafe fn rebalance(&mut self, maximum: u64) {
        let main = maximum.saturating_sub(self.eden_maximum);
        self.protected_maximum = (main as f64 * PERCENT_MAIN_PROTECTED) as u64;
        self.demote_protected_overflow();
    }

    fn access_deque(&mut self, region: Region) -> &mut Deque<K, V, AccessOrder> {
        match region {
            Region::Eden => &mut self.eden,
            Region::Probation => &mut self.probation,
            Region::Protected => &mut self.protected,
            Region::ZeroWeight => &mut self.zero_weight,
            Region::Dead => unreachable!("dead nodes are in no deque"),
        }
    }

    fn resident_count(&self) -> usize {
        self.eden.len() + self.probation.len() + self.protected.len() + self.zero_weight.len()
    }

    fn maybe_enable_sketch(&mut self) {
        if self.sketch_enabled {
            return;
        }
        let Some(maximum) = self.maximum else {
            return;
        };
        if self.resident_count() as u64 >= maximum / 2 {
            self.sketch.ensure_capacity(maximum);
            self.sketch_enabled = true;
        }
    }

    fn coin_flip(&mut self) -> bool {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        (x & 127) == 0
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            maximum_weight: self.maximum,
            eden_maximum: self.eden_maximum,
            protected_maximum: self.protected_maximum,
            weighted_size: self.weighted_size,
            eden_count: self.eden.len(),
            probation_count: self.probation.len(),
            protected_count: self.protected.len(),
            zero_weight_count: self.zero_weight.len(),
        }
    }

    /// Keys in approximate eviction order, coldest first.
    ///
    /// # Safety
    ///
    /// The eviction lock must be held.
    pub unsafe fn coldest(&self, n: usize) -> Vec<K> {
        self.probation
            .iter()
            .chain(self.protected.iter())
            .chain(self.eden.iter())
            .take(n)
            .map(|ptr| unsafe { ptr.as_ref() }.key().clone())
            .collect()
    }
}

impl<K, V> Drop for Policy<K, V> {
    fn drop(&mut self) {
        unsafe {
            for deque in [
                &mut self.eden,
                &mut self.probation,
                &mut self.protected,
                &mut self.zero_weight,
            ] {
                while let Some(ptr) = deque.pop_front() {
                    ptr.as_ref().policy_mut().region = Region::Dead;
                    Node::release(ptr);
                }
            }
        }
    }
}

fn add_signed(value: &mut u64, delta: i64) {
    if delta >= 0 {
        *value += delta as u64;
    } else {
        *value = value.saturating_sub(delta.unsigned_abs());
    }
}

fn region_maximums(maximum: Option<u64>) -> (u64, u64) {
    match maximum {
        Some(m) => {
            let eden = (m - (m as f64 * PERCENT_MAIN) as u64).max(1);
            let main = m.saturating_sub(eden);
            (eden, (main as f64 * PERCENT_MAIN_PROTECTED) as u64)
        }
        None => (u64::MAX, u64::MAX),
    }
}

/// Current limits and occupancy of the eviction policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub maximum_weight: Option<u64>,
    pub eden_maximum: u64,
    pub protected_maximum: u64,
    pub weighted_size: u64,
    pub eden_count: usize,
    pub probation_count: usize,
    pub protected_count: usize,
    pub zero_weight_count: usize,
}

impl PolicySnapshot {
    pub fn resident_count(&self) -> usize {
        self.eden_count + self.probation_count + self.protected_count + self.zero_weight_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestPolicy = Policy<u64, u64>;

    fn node(key: u64, weight: u32) -> Arc<Node<u64, u64>> {
        Arc::new(Node::new(key, key, key, weight, 0))
    }

    fn policy(maximum: u64) -> TestPolicy {
        Policy::new(Some(maximum), None, None, false, 0)
    }

    unsafe fn add(policy: &mut TestPolicy, node: &Arc<Node<u64, u64>>) {
        policy.apply(WriteTask::Added(node.clone()));
    }

    #[test]
    fn test_inserts_fill_eden_then_probation() {
        unsafe {
            let mut policy = policy(3);
            let nodes = [node(1, 1), node(2, 1), node(3, 1)];
            for n in &nodes {
                add(&mut policy, n);
                assert!(policy.evict_to_capacity().is_empty());
            }

            let snapshot = policy.snapshot();
            assert_eq!(snapshot.weighted_size, 3);
            assert_eq!(snapshot.eden_count, 1);
            assert_eq!(snapshot.probation_count, 2);
            assert_eq!(snapshot.resident_count(), 3);
        }
    }

    #[test]
    fn test_access_promotes_and_demotes() {
        unsafe {
            let mut policy = policy(3);
            let nodes = [node(1, 1), node(2, 1), node(3, 1)];
            for n in &nodes {
                add(&mut policy, n);
                policy.evict_to_capacity();
            }

            // 1 and 2 sit in probation; an access promotes into protected
            // (capacity 1), and a second promotion demotes the first.
            policy.on_access(&nodes[0]);
            assert_eq!(nodes[0].policy_mut().region, Region::Protected);

            policy.on_access(&nodes[1]);
            assert_eq!(nodes[1].policy_mut().region, Region::Protected);
            assert_eq!(nodes[0].policy_mut().region, Region::Probation);

            let snapshot = policy.snapshot();
            assert_eq!(snapshot.protected_count, 1);
            assert_eq!(snapshot.resident_count(), 3);
        }
    }

    #[test]
    fn test_admission_rejects_cold_candidate() {
        unsafe {
            let mut policy = policy(3);
            let nodes = [node(1, 1), node(2, 1), node(3, 1)];
            for n in &nodes {
                add(&mut policy, n);
                policy.evict_to_capacity();
            }
            // Warm up the resident keys.
            for _ in 0..5 {
                for n in &nodes {
                    policy.on_access(n);
                }
            }

            let cold = node(4, 1);
            add(&mut policy, &cold);
            // Refresh the resident eden entry so the newcomer is the LRU
            // candidate.
            policy.on_access(&nodes[2]);
            let victims = policy.evict_to_capacity();
            assert_eq!(victims.len(), 1);
            assert_eq!(*victims[0].as_ref().key(), 4);
            assert_eq!(policy.weighted_size(), 3);
        }
    }

    #[test]
    fn test_admission_evicts_cold_victim() {
        unsafe {
            let mut policy = policy(3);
            let nodes = [node(1, 1), node(2, 1), node(3, 1)];
            for n in &nodes {
                add(&mut policy, n);
                policy.evict_to_capacity();
            }

            // A hot newcomer beats the cold probation victim.
            let hot = node(4, 1);
            for _ in 0..8 {
                policy.sketch.increment(hot.hash());
            }
            add(&mut policy, &hot);
            // Refresh the resident eden entry so the newcomer is the LRU
            // candidate.
            policy.on_access(&nodes[2]);
            let victims = policy.evict_to_capacity();
            assert_eq!(victims.len(), 1);
            assert_eq!(*victims[0].as_ref().key(), 1);
            assert_eq!(hot.policy_mut().region, Region::Probation);
        }
    }

    #[test]
    fn test_zero_weight_entries_are_not_evicted() {
        unsafe {
            let mut policy = policy(2);
            let weightless = node(100, 0);
            add(&mut policy, &weightless);
            for key in 0..10 {
                let n = node(key, 1);
                add(&mut policy, &n);
                policy.evict_to_capacity();
            }

            assert_eq!(weightless.policy_mut().region, Region::ZeroWeight);
            assert!(policy.weighted_size() <= 2);
        }
    }

    #[test]
    fn test_remove_task_detaches() {
        unsafe {
            let mut policy = policy(10);
            let n = node(1, 1);
            add(&mut policy, &n);
            assert_eq!(policy.weighted_size(), 1);

            policy.apply(WriteTask::Removed(n.clone()));
            assert_eq!(policy.weighted_size(), 0);
            assert_eq!(n.policy_mut().region, Region::Dead);
            assert_eq!(policy.snapshot().resident_count(), 0);

            // A second removal is a no-op.
            policy.apply(WriteTask::Removed(n.clone()));
            assert_eq!(policy.weighted_size(), 0);
        }
    }

    #[test]
    fn test_weight_reconciliation() {
        unsafe {
            let mut policy = policy(10);
            let n = node(1, 2);
            add(&mut policy, &n);
            assert_eq!(policy.weighted_size(), 2);

            n.set_weight(5);
            policy.apply(WriteTask::Updated(n.clone()));
            assert_eq!(policy.weighted_size(), 5);

            n.set_weight(0);
            policy.apply(WriteTask::Updated(n.clone()));
            assert_eq!(policy.weighted_size(), 0);
            assert_eq!(n.policy_mut().region, Region::ZeroWeight);

            n.set_weight(3);
            policy.apply(WriteTask::Updated(n.clone()));
            assert_eq!(policy.weighted_size(), 3);
            assert_eq!(n.policy_mut().region, Region::Eden);
        }
    }

    #[test]
    fn test_expire_after_write_order() {
        unsafe {
            let mut policy: TestPolicy = Policy::new(Some(10), None, Some(100), false, 0);
            let first = node(1, 1);
            let second = node(2, 1);
            add(&mut policy, &first);
            add(&mut policy, &second);
            second.touch_write(50);

            let expired = policy.collect_expired(120);
            assert_eq!(expired.len(), 1);
            assert_eq!(*expired[0].as_ref().key(), 1);
            assert_eq!(policy.snapshot().resident_count(), 1);

            let expired = policy.collect_expired(200);
            assert_eq!(expired.len(), 1);
            assert_eq!(*expired[0].as_ref().key(), 2);
        }
    }
}
