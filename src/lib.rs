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

//! A bounded, concurrent, in-memory cache with Window-TinyLFU eviction.
//!
//! Reads and writes go through sharded hash tables; policy bookkeeping is
//! decoupled from the hot path through lock-free read and write buffers and
//! replayed by an amortized maintenance routine under a single try-locked
//! eviction mutex. Admission is frequency-based (a 4-bit CountMinSketch with
//! periodic aging) over a small eden window and an SLRU main space, with an
//! adaptive hill climber tuning the split. Size-, weight-, access-, write-,
//! and per-entry expiry are supported, along with single-flight asynchronous
//! loading.
//!
//! # Example
//!
//! ```
//! use larder::Cache;
//!
//! let cache: Cache<u64, String> = Cache::with_maximum_weight(1024);
//! cache.insert(1, "one".to_string());
//! assert_eq!(cache.get(&1), Some("one".to_string()));
//! cache.invalidate(&1);
//! assert_eq!(cache.get(&1), None);
//! ```

mod buffer;
mod deque;
mod node;
mod policy;
mod sketch;
mod wheel;

pub mod cache;
pub mod code;
pub mod config;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod prelude;
pub mod time;

pub use prelude::*;
