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
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// The entry was removed by `invalidate`, `remove`, or a `compute` that
    /// returned no value.
    Explicit,
    /// The entry's value was replaced by a newer one for the same key.
    Replaced,
    /// The entry passed its access, write, or per-entry expiry deadline.
    Expired,
    /// The entry was evicted to keep the weighted size within the maximum.
    Size,
}

impl RemovalCause {
    /// Whether the removal was decided by the cache rather than the caller.
    pub fn was_evicted(&self) -> bool {
        matches!(self, Self::Expired | Self::Size)
    }
}

/// Trait for the customized removal listener.
pub trait RemovalListener<K, V>: Send + Sync + 'static {
    fn on_removal(&self, key: K, value: V, cause: RemovalCause);
}

impl<K, V, F> RemovalListener<K, V> for F
where
    F: Fn(K, V, RemovalCause) + Send + Sync + 'static,
{
    fn on_removal(&self, key: K, value: V, cause: RemovalCause) {
        self(key, value, cause)
    }
}

/// Pending removal notifications.
///
/// Notifications are queued while locks are held and flushed by the first
/// caller that reaches a lock-free point, so a slow listener never extends a
/// lock hold. A listener panic is caught and logged and never affects cache
/// state.
pub(crate) struct RemovalQueue<K: 'static, V: 'static> {
    tx: flume::Sender<(K, V, RemovalCause)>,
    rx: flume::Receiver<(K, V, RemovalCause)>,
    listener: Option<Arc<dyn RemovalListener<K, V>>>,
}

impl<K: 'static, V: 'static> RemovalQueue<K, V> {
    pub fn new(listener: Option<Arc<dyn RemovalListener<K, V>>>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx, listener }
    }

    pub fn push(&self, key: K, value: V, cause: RemovalCause) {
        if self.listener.is_some() {
            // The receiver lives as long as `self`, so the send cannot fail.
            let _ = self.tx.send((key, value, cause));
        }
    }

    pub fn flush(&self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        for (key, value, cause) in self.rx.try_iter() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.on_removal(key, value, cause);
            }));
            if result.is_err() {
                tracing::warn!(?cause, "removal listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_flush_order() {
        let received = Arc::new(Mutex::new(vec![]));
        let listener = {
            let received = received.clone();
            move |key: u64, value: u64, cause: RemovalCause| {
                received.lock().unwrap().push((key, value, cause));
            }
        };
        let queue = RemovalQueue::new(Some(Arc::new(listener)));

        queue.push(1, 10, RemovalCause::Explicit);
        queue.push(2, 20, RemovalCause::Size);
        assert!(received.lock().unwrap().is_empty());

        queue.flush();
        assert_eq!(
            *received.lock().unwrap(),
            vec![(1, 10, RemovalCause::Explicit), (2, 20, RemovalCause::Size)],
        );
    }

    #[test]
    fn test_listener_panic_is_contained() {
        let queue = RemovalQueue::new(Some(Arc::new(|_: u64, _: u64, _| {
            panic!("listener bug");
        })));
        queue.push(1, 1, RemovalCause::Explicit);
        queue.flush();

        // The queue stays usable after a listener panic.
        queue.push(2, 2, RemovalCause::Explicit);
        queue.flush();
    }

    #[test]
    fn test_no_listener_drops_notifications() {
        let queue: RemovalQueue<u64, u64> = RemovalQueue::new(None);
        queue.push(1, 1, RemovalCause::Explicit);
        queue.flush();
    }
}
