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

use std::{sync::Arc, time::Duration};

use ahash::RandomState;
use serde::{Deserialize, Serialize};

use crate::{
    listener::RemovalListener,
    time::{SystemTicker, Ticker},
};

/// Trait for the customized entry weigher.
///
/// Called at most once per insert or update. The weight of an entry never
/// changes without a write to it.
pub trait Weigher<K, V>: Send + Sync + 'static {
    fn weigh(&self, key: &K, value: &V) -> u32;
}

impl<K, V, F> Weigher<K, V> for F
where
    F: Fn(&K, &V) -> u32 + Send + Sync + 'static,
{
    fn weigh(&self, key: &K, value: &V) -> u32 {
        self(key, value)
    }
}

/// Trait for per-entry variable expiration.
///
/// Evaluated when an entry is created or updated. `None` leaves the entry
/// without a per-entry deadline.
pub trait Expiry<K, V>: Send + Sync + 'static {
    fn expire_after(&self, key: &K, value: &V) -> Option<Duration>;
}

impl<K, V, F> Expiry<K, V> for F
where
    F: Fn(&K, &V) -> Option<Duration> + Send + Sync + 'static,
{
    fn expire_after(&self, key: &K, value: &V) -> Option<Duration> {
        self(key, value)
    }
}

/// Cache configuration.
pub struct CacheConfig<K, V, S = RandomState> {
    /// Maximum total weight. `None` disables size-based eviction.
    pub maximum_weight: Option<u64>,
    /// Shard count of the primary map. Rounded up to a power of two.
    pub shards: usize,
    /// Time-to-idle, measured from the last read or write.
    pub expire_after_access: Option<Duration>,
    /// Time-to-live, measured from the last write.
    pub expire_after_write: Option<Duration>,
    /// Per-entry variable expiration.
    pub expiry: Option<Arc<dyn Expiry<K, V>>>,
    /// Entry weigher. Every entry weighs 1 when absent.
    pub weigher: Option<Arc<dyn Weigher<K, V>>>,
    /// Removal listener, invoked outside all cache locks.
    pub removal_listener: Option<Arc<dyn RemovalListener<K, V>>>,
    /// Time source.
    pub ticker: Arc<dyn Ticker>,
    pub hash_builder: S,
}

impl<K, V> Default for CacheConfig<K, V> {
    fn default() -> Self {
        Self {
            maximum_weight: None,
            shards: default_shards(),
            expire_after_access: None,
            expire_after_write: None,
            expiry: None,
            weigher: None,
            removal_listener: None,
            ticker: Arc::new(SystemTicker::default()),
            hash_builder: RandomState::default(),
        }
    }
}

impl<K, V> CacheConfig<K, V> {
    pub fn with_maximum_weight(maximum_weight: u64) -> Self {
        Self {
            maximum_weight: Some(maximum_weight),
            ..Default::default()
        }
    }
}

impl<K, V, S> CacheConfig<K, V, S> {
    /// Serializable snapshot of the configuration.
    ///
    /// This is the only cache state meant to survive a restart; the cache
    /// contents are volatile.
    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            maximum_weight: self.maximum_weight,
            shards: self.shards,
            expire_after_access: self.expire_after_access,
            expire_after_write: self.expire_after_write,
            has_expiry: self.expiry.is_some(),
            has_weigher: self.weigher.is_some(),
        }
    }
}

fn default_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .next_power_of_two()
}

/// Serializable view of [`CacheConfig`].
///
/// Hooks (weigher, expiry, listener, ticker) are code and only recorded as
/// presence flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    pub maximum_weight: Option<u64>,
    pub shards: usize,
    pub expire_after_access: Option<Duration>,
    pub expire_after_write: Option<Duration>,
    pub has_expiry: bool,
    pub has_weigher: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_roundtrip() {
        let config = CacheConfig::<u64, u64> {
            maximum_weight: Some(1024),
            expire_after_write: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let options = config.options();

        let json = serde_json::to_string(&options).unwrap();
        let restored: CacheOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(options, restored);
    }

    #[test]
    fn test_default_shards_power_of_two() {
        assert!(default_shards().is_power_of_two());
    }
}
