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
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use larder::{Cache, CacheConfig, ManualTicker, RemovalCause};

type Removals = Arc<Mutex<Vec<(u64, String, RemovalCause)>>>;

fn recording<S>(config: &mut CacheConfig<u64, String, S>) -> Removals {
    let removals: Removals = Arc::new(Mutex::new(vec![]));
    let sink = removals.clone();
    config.removal_listener = Some(Arc::new(
        move |key: u64, value: String, cause: RemovalCause| {
            sink.lock().unwrap().push((key, value, cause));
        },
    ));
    removals
}

fn value(key: u64) -> String {
    format!("value-{key}")
}

#[test]
fn eviction_by_frequency() {
    let mut config = CacheConfig {
        maximum_weight: Some(3),
        shards: 1,
        ..Default::default()
    };
    let removals = recording(&mut config);
    let cache = Cache::new(config);

    for key in 1..=3 {
        cache.insert(key, value(key));
    }
    for _ in 0..5 {
        assert_eq!(cache.get(&1), Some(value(1)));
    }
    cache.run_pending_tasks();

    cache.insert(4, value(4));
    cache.run_pending_tasks();

    assert_eq!(cache.entry_count(), 3);
    assert!(cache.weighted_size() <= 3);
    assert!(cache.contains_key(&1));
    assert!(cache.contains_key(&4));

    let evicted = removals
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, _, cause)| *cause == RemovalCause::Size)
        .map(|(key, _, _)| *key)
        .collect::<Vec<_>>();
    assert_eq!(evicted.len(), 1);
    assert!(evicted[0] == 2 || evicted[0] == 3);
}

#[test]
fn expire_after_write() {
    let ticker = Arc::new(ManualTicker::default());
    let mut config = CacheConfig {
        shards: 1,
        expire_after_write: Some(Duration::from_nanos(100)),
        ticker: ticker.clone(),
        ..Default::default()
    };
    let removals = recording(&mut config);
    let cache = Cache::new(config);

    cache.insert(1, "a".to_string());

    ticker.set(99);
    assert_eq!(cache.get(&1), Some("a".to_string()));

    ticker.set(101);
    cache.run_pending_tasks();
    assert_eq!(cache.get(&1), None);
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(
        removals.lock().unwrap().as_slice(),
        &[(1, "a".to_string(), RemovalCause::Expired)]
    );
}

#[tokio::test]
async fn async_single_flight() {
    let cache: Arc<Cache<u64, String>> = Arc::new(Cache::with_maximum_weight(100));
    let loads = Arc::new(AtomicUsize::new(0));

    // The second call arrives while the first load is still in flight, so
    // it observes the same load instead of starting its own.
    let l1 = loads.clone();
    let first = cache.fetch(1, move || async move {
        l1.fetch_add(1, Ordering::SeqCst);
        Ok::<_, std::io::Error>("loaded".to_string())
    });
    let l2 = loads.clone();
    let second = cache.fetch(1, move || async move {
        l2.fetch_add(1, Ordering::SeqCst);
        Ok::<_, std::io::Error>("wrong".to_string())
    });

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap(), "loaded");
    assert_eq!(second.unwrap(), "loaded");
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.metrics().snapshot().load_success, 1);
    assert_eq!(cache.get(&1), Some("loaded".to_string()));
}

#[tokio::test]
async fn load_failure_leaves_no_trace() {
    let cache: Arc<Cache<u64, String>> = Arc::new(Cache::with_maximum_weight(100));

    let result = cache
        .fetch(1, || async {
            Err::<String, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        })
        .await;
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("boom"));

    assert_eq!(cache.get(&1), None);
    assert_eq!(cache.entry_count(), 0);
    let snapshot = cache.metrics().snapshot();
    assert_eq!(snapshot.load_failure, 1);
    assert_eq!(snapshot.load_success, 0);

    // The key is loadable again after the failure.
    let value = cache
        .fetch(1, || async { Ok::<_, std::convert::Infallible>("ok".to_string()) })
        .await
        .unwrap();
    assert_eq!(value, "ok");
}

#[tokio::test]
async fn waiters_observe_load_failure() {
    let cache: Arc<Cache<u64, String>> = Arc::new(Cache::with_maximum_weight(100));
    let loads = Arc::new(AtomicUsize::new(0));

    let l1 = loads.clone();
    let first = cache.fetch(1, move || async move {
        l1.fetch_add(1, Ordering::SeqCst);
        Err::<String, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    });
    let l2 = loads.clone();
    let second = cache.fetch(1, move || async move {
        l2.fetch_add(1, Ordering::SeqCst);
        Err::<String, _>(std::io::Error::new(std::io::ErrorKind::Other, "second"))
    });

    let (first, second) = tokio::join!(first, second);
    assert!(first.is_err());
    assert!(second.is_err());
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.entry_count(), 0);
}

#[tokio::test]
async fn bulk_load_exceeding_request() {
    let cache: Cache<u64, String> = Cache::with_maximum_weight(100);
    let loads = Arc::new(AtomicUsize::new(0));

    let result = cache
        .get_all(vec![1, 2, 3], |mut missing| {
            let loads = loads.clone();
            async move {
                loads.fetch_add(1, Ordering::SeqCst);
                missing.sort_unstable();
                assert_eq!(missing, vec![1, 2, 3]);
                // Return more than was asked for.
                Ok::<_, std::convert::Infallible>(
                    (1..=5).map(|key| (key, value(key))).collect::<Vec<_>>(),
                )
            }
        })
        .await
        .unwrap();

    assert_eq!(result.len(), 3);
    for key in 1..=3 {
        assert_eq!(result[&key], value(key));
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.metrics().snapshot().load_success, 1);

    // The excess entries were cached anyway.
    assert_eq!(cache.entry_count(), 5);
    assert!(cache.contains_key(&4));
    assert!(cache.contains_key(&5));

    // Everything present now: the loader is not consulted again.
    let result = cache
        .get_all(vec![1, 4, 5], |_| async {
            Ok::<Vec<(u64, String)>, std::convert::Infallible>(vec![])
        })
        .await
        .unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[test]
fn compute_removal_with_explicit_cause() {
    let mut config = CacheConfig {
        maximum_weight: Some(100),
        shards: 1,
        ..Default::default()
    };
    let removals = recording(&mut config);
    let cache = Cache::new(config);

    cache.insert(1, "a".to_string());
    cache.insert(2, "b".to_string());
    cache.run_pending_tasks();
    assert_eq!(cache.entry_count(), 2);

    // Computing to nothing removes the mapping.
    assert_eq!(cache.compute(1, |_, _| None), None);
    cache.run_pending_tasks();

    assert_eq!(cache.entry_count(), 1);
    assert_eq!(cache.policy().resident_count(), 1);
    assert_eq!(
        removals.lock().unwrap().as_slice(),
        &[(1, "a".to_string(), RemovalCause::Explicit)]
    );
}

#[test]
fn replace_notifies_replaced() {
    let mut config = CacheConfig {
        maximum_weight: Some(100),
        shards: 1,
        ..Default::default()
    };
    let removals = recording(&mut config);
    let cache = Cache::new(config);

    cache.insert(1, "a".to_string());
    cache.insert(1, "b".to_string());
    assert_eq!(cache.get(&1), Some("b".to_string()));
    assert_eq!(
        removals.lock().unwrap().as_slice(),
        &[(1, "a".to_string(), RemovalCause::Replaced)]
    );
}

#[test]
fn round_trips() -> anyhow::Result<()> {
    let cache: Cache<u64, String> = Cache::with_maximum_weight(100);

    cache.insert(1, "a".to_string());
    assert_eq!(cache.get(&1), Some("a".to_string()));

    cache.invalidate(&1);
    assert_eq!(cache.get(&1), None);

    let loaded = cache.get_with(1, |_| Ok::<_, std::convert::Infallible>("a".to_string()))?;
    assert_eq!(loaded, "a");

    cache.insert_all((2..5).map(|key| (key, value(key))));
    cache.invalidate_keys(2..5);
    assert_eq!(cache.entry_count(), 1);

    // cleanUp is idempotent.
    cache.run_pending_tasks();
    let once = (cache.entry_count(), cache.weighted_size(), cache.policy());
    cache.run_pending_tasks();
    let twice = (cache.entry_count(), cache.weighted_size(), cache.policy());
    assert_eq!(once, twice);
    Ok(())
}

#[tokio::test]
async fn refresh_replaces_and_keeps_on_failure() {
    let cache: Arc<Cache<u64, String>> = Arc::new(Cache::with_maximum_weight(100));
    cache.insert(1, "old".to_string());

    let refreshed = cache
        .refresh(1, || async { Ok::<_, std::io::Error>("new".to_string()) })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed, "new");
    assert_eq!(cache.get(&1), Some("new".to_string()));

    // A failed refresh keeps the current value.
    let failed = cache
        .refresh(1, || async {
            Err::<String, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        })
        .await
        .unwrap();
    assert!(failed.is_err());
    assert_eq!(cache.get(&1), Some("new".to_string()));
    assert_eq!(cache.metrics().snapshot().load_failure, 1);
}

#[test]
fn expired_entries_never_returned() {
    let ticker = Arc::new(ManualTicker::default());
    let cache: Cache<u64, String> = Cache::new(CacheConfig {
        shards: 1,
        expire_after_access: Some(Duration::from_nanos(50)),
        ticker: ticker.clone(),
        ..Default::default()
    });

    cache.insert(1, "a".to_string());
    ticker.set(49);
    assert!(cache.get(&1).is_some());
    ticker.set(100);
    // Expired but not yet collected: still invisible.
    assert_eq!(cache.get(&1), None);
    assert!(!cache.contains_key(&1));
}

#[test]
fn eviction_at_exact_capacity() {
    let mut config = CacheConfig {
        maximum_weight: Some(3),
        shards: 1,
        ..Default::default()
    };
    let removals = recording(&mut config);
    let cache = Cache::new(config);

    for key in 1..=3 {
        cache.insert(key, value(key));
    }
    cache.run_pending_tasks();
    assert_eq!(cache.entry_count(), 3);
    assert_eq!(cache.weighted_size(), 3);

    cache.insert(4, value(4));
    cache.run_pending_tasks();

    // Exactly one unit-weight entry made room for the newcomer.
    assert_eq!(cache.entry_count(), 3);
    assert_eq!(cache.weighted_size(), 3);
    let evicted = removals
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, _, cause)| cause.was_evicted())
        .count();
    assert_eq!(evicted, 1);
}

#[test_log::test]
fn invariants_after_mixed_operations() {
    let cache: Cache<u64, u64> = Cache::new(CacheConfig {
        maximum_weight: Some(64),
        shards: 2,
        ..Default::default()
    });

    for i in 0..10_000u64 {
        match i % 7 {
            0 | 1 | 2 => {
                cache.insert(i % 200, i);
            }
            3 | 4 => {
                let _ = cache.get(&(i % 200));
            }
            5 => {
                cache.invalidate(&(i % 200));
            }
            _ => {
                let _ = cache.compute(i % 200, |_, current| current.map(|v| v + 1));
            }
        }
    }
    cache.run_pending_tasks();

    let policy = cache.policy();
    assert!(policy.weighted_size <= 64);
    assert_eq!(policy.weighted_size, cache.weighted_size());
    assert_eq!(cache.entry_count(), policy.resident_count() as u64);
}

#[test_log::test]
fn concurrent_smoke() {
    let cache: Arc<Cache<u64, u64>> = Arc::new(Cache::new(CacheConfig {
        maximum_weight: Some(128),
        shards: 4,
        ..Default::default()
    }));

    std::thread::scope(|scope| {
        for thread in 0..4u64 {
            let cache = cache.clone();
            scope.spawn(move || {
                for i in 0..20_000u64 {
                    let key = (i * 31 + thread) % 512;
                    if cache.get(&key).is_none() {
                        cache.insert(key, key);
                    }
                    if i % 97 == 0 {
                        cache.invalidate(&key);
                    }
                }
            });
        }
    });
    cache.run_pending_tasks();

    let policy = cache.policy();
    assert!(policy.weighted_size <= 128);
    assert_eq!(cache.entry_count(), policy.resident_count() as u64);
    for (key, value) in cache.iter() {
        assert_eq!(key, value);
    }
}
