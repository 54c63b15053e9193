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
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Monotonic time source of the cache.
///
/// Expiration and load timing are driven entirely by the ticker, never by
/// wall-clock timers.
pub trait Ticker: Send + Sync + 'static {
    /// Returns the current tick in nanoseconds.
    fn read(&self) -> u64;
}

/// Default ticker backed by [`Instant`].
#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually driven ticker for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTicker {
    nanos: AtomicU64,
}

impl ManualTicker {
    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Release);
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }
}

impl Ticker for ManualTicker {
    fn read(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}
