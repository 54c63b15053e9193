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

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crossbeam::queue::ArrayQueue;
use itertools::Itertools;

use crate::node::Node;

/// Slots per read-buffer stripe.
const STRIPE_CAPACITY: usize = 16;

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    /// Stable per-thread stripe id.
    static STRIPE: usize = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed);
}

pub(crate) enum ReadOffer {
    Recorded,
    /// Recorded, but the stripe is now full; the caller should attempt a
    /// maintenance pass.
    DrainNeeded,
    /// The stripe was full; the event was dropped. The hot path still
    /// returns the value.
    Dropped,
}

/// Striped, lossy, bounded buffer of read events.
///
/// Hits are recorded with a single lock-free push into the current thread's
/// stripe and replayed against the policy during maintenance. Under
/// contention events may be dropped; dropped events only cost policy
/// accuracy, never correctness.
pub(crate) struct ReadBuffer<K, V> {
    stripes: Vec<ArrayQueue<Arc<Node<K, V>>>>,
    mask: usize,
}

impl<K, V> ReadBuffer<K, V> {
    pub fn new(parallelism: usize) -> Self {
        let stripes = (4 * parallelism.max(1)).next_power_of_two();
        Self {
            stripes: (0..stripes)
                .map(|_| ArrayQueue::new(STRIPE_CAPACITY))
                .collect_vec(),
            mask: stripes - 1,
        }
    }

    pub fn offer(&self, node: Arc<Node<K, V>>) -> ReadOffer {
        let stripe = &self.stripes[STRIPE.with(|s| *s) & self.mask];
        match stripe.push(node) {
            Ok(()) if stripe.is_full() => ReadOffer::DrainNeeded,
            Ok(()) => ReadOffer::Recorded,
            Err(_) => ReadOffer::Dropped,
        }
    }

    /// Replays and clears every stripe. Called under the eviction lock.
    pub fn drain(&self, mut f: impl FnMut(Arc<Node<K, V>>)) {
        for stripe in &self.stripes {
            while let Some(node) = stripe.pop() {
                f(node);
            }
        }
    }
}

/// Pending policy work for one mutation of the primary map.
pub(crate) enum WriteTask<K, V> {
    Added(Arc<Node<K, V>>),
    Updated(Arc<Node<K, V>>),
    Removed(Arc<Node<K, V>>),
}

/// Bounded MPSC buffer of write tasks.
///
/// Unlike read events, write tasks are state changes that must reach the
/// policy: when the buffer is full the writer force-runs maintenance under a
/// blocking lock acquire and retries.
pub(crate) struct WriteBuffer<K, V> {
    tx: flume::Sender<WriteTask<K, V>>,
    rx: flume::Receiver<WriteTask<K, V>>,
}

impl<K, V> WriteBuffer<K, V> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    pub fn offer(&self, task: WriteTask<K, V>) -> Result<(), WriteTask<K, V>> {
        self.tx.try_send(task).map_err(|e| e.into_inner())
    }

    /// Applies and clears every buffered task. Called under the eviction
    /// lock.
    pub fn drain(&self, mut f: impl FnMut(WriteTask<K, V>)) {
        for task in self.rx.try_iter() {
            f(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: u64) -> Arc<Node<u64, u64>> {
        Arc::new(Node::new(key, key, key, 1, 0))
    }

    #[test]
    fn test_read_buffer_fills_then_drops() {
        let buffer = ReadBuffer::new(1);

        // A single thread writes a single stripe.
        let mut recorded = 0;
        loop {
            match buffer.offer(node(recorded)) {
                ReadOffer::Recorded => recorded += 1,
                ReadOffer::DrainNeeded => {
                    recorded += 1;
                    break;
                }
                ReadOffer::Dropped => panic!("dropped before full"),
            }
        }
        assert_eq!(recorded, STRIPE_CAPACITY as u64);
        assert!(matches!(buffer.offer(node(99)), ReadOffer::Dropped));

        let mut drained = vec![];
        buffer.drain(|n| drained.push(*n.key()));
        assert_eq!(drained, (0..STRIPE_CAPACITY as u64).collect::<Vec<_>>());

        // Reads equal writes per stripe after a drain.
        let mut rest = 0;
        buffer.drain(|_| rest += 1);
        assert_eq!(rest, 0);
        assert!(matches!(buffer.offer(node(100)), ReadOffer::Recorded));
    }

    #[test]
    fn test_write_buffer_bounded() {
        let buffer = WriteBuffer::new(2);
        assert!(buffer.offer(WriteTask::Added(node(1))).is_ok());
        assert!(buffer.offer(WriteTask::Updated(node(2))).is_ok());

        // Full: the task comes back instead of being dropped.
        let rejected = buffer.offer(WriteTask::Removed(node(3)));
        let Err(WriteTask::Removed(rejected)) = rejected else {
            panic!("expected the rejected task back");
        };
        assert_eq!(*rejected.key(), 3);

        let mut keys = vec![];
        buffer.drain(|task| match task {
            WriteTask::Added(n) | WriteTask::Updated(n) | WriteTask::Removed(n) => {
                keys.push(*n.key())
            }
        });
        assert_eq!(keys, vec![1, 2]);

        let mut rest = 0;
        buffer.drain(|_| rest += 1);
        assert_eq!(rest, 0);
    }
}
