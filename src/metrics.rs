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

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters of the cache.
///
/// Counters are updated with relaxed atomics on the hot paths and are
/// eventually consistent with the operations they describe.
#[derive(Debug, Default)]
pub struct Metrics {
    pub hit: AtomicU64,
    pub miss: AtomicU64,

    pub insert: AtomicU64,
    pub update: AtomicU64,
    pub remove: AtomicU64,

    pub evict: AtomicU64,
    pub expire: AtomicU64,

    pub load_success: AtomicU64,
    pub load_failure: AtomicU64,
    pub load_nanos: AtomicU64,

    /// Read events dropped by the lossy read buffer under contention.
    pub read_drop: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hit: self.hit.load(Ordering::Relaxed),
            miss: self.miss.load(Ordering::Relaxed),
            insert: self.insert.load(Ordering::Relaxed),
            update: self.update.load(Ordering::Relaxed),
            remove: self.remove.load(Ordering::Relaxed),
            evict: self.evict.load(Ordering::Relaxed),
            expire: self.expire.load(Ordering::Relaxed),
            load_success: self.load_success.load(Ordering::Relaxed),
            load_failure: self.load_failure.load(Ordering::Relaxed),
            load_nanos: self.load_nanos.load(Ordering::Relaxed),
            read_drop: self.read_drop.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub hit: u64,
    pub miss: u64,
    pub insert: u64,
    pub update: u64,
    pub remove: u64,
    pub evict: u64,
    pub expire: u64,
    pub load_success: u64,
    pub load_failure: u64,
    pub load_nanos: u64,
    pub read_drop: u64,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit + self.miss;
        if total == 0 {
            return 0.0;
        }
        self.hit as f64 / total as f64
    }
}
