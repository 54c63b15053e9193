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

/// A probabilistic frequency estimator over key hashes.
///
/// A CountMinSketch of 4-bit saturating counters, sixteen counters per `u64`
/// word. Each key maps to four counters through multiply-shift hashing;
/// `frequency` reports their minimum. Once `sample_size` increments have been
/// observed every counter is halved, so the estimate decays and favors
/// recent popularity.
pub(crate) struct FrequencySketch {
    table: Vec<u64>,
    table_mask: u64,
    sample_size: u64,
    size: u64,
}

const SEEDS: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

/// Clears the low bit of every halved counter.
const RESET_MASK: u64 = 0x7777_7777_7777_7777;
const ONE_MASK: u64 = 0x1111_1111_1111_1111;

const MIN_TABLE_LEN: u64 = 128;
const MAX_TABLE_LEN: u64 = 1 << 30;

impl Default for FrequencySketch {
    fn default() -> Self {
        Self {
            table: Vec::new(),
            table_mask: 0,
            sample_size: 0,
            size: 0,
        }
    }
}

impl FrequencySketch {
    /// Grows the table to cover `capacity` slots. Shrinking is not supported;
    /// growing discards the collected counts.
    pub fn ensure_capacity(&mut self, capacity: u64) {
        let len = capacity
            .clamp(MIN_TABLE_LEN, MAX_TABLE_LEN)
            .next_power_of_two();
        if self.table.len() as u64 >= len {
            return;
        }
        self.table = vec![0; len as usize];
        self.table_mask = len - 1;
        self.sample_size = len.saturating_mul(10);
        self.size = 0;
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    /// Estimated occurrences of the hash, saturating at 15.
    pub fn frequency(&self, hash: u64) -> u8 {
        if self.table.is_empty() {
            return 0;
        }
        let start = (hash & 3) << 2;
        let mut frequency = u8::MAX;
        for (i, seed) in SEEDS.iter().enumerate() {
            let index = self.index_of(hash, *seed);
            let count = (self.table[index] >> ((start + i as u64) << 2)) & 0xf;
            frequency = frequency.min(count as u8);
        }
        frequency
    }

    /// Increments the popularity of the hash, aging the sketch when the
    /// sample period is over.
    pub fn increment(&mut self, hash: u64) {
        if self.table.is_empty() {
            return;
        }
        let start = (hash & 3) << 2;
        let mut added = false;
        for (i, seed) in SEEDS.iter().enumerate() {
            let index = self.index_of(hash, *seed);
            added |= self.try_increment(index, start + i as u64);
        }
        if added {
            self.size += 1;
            if self.size == self.sample_size {
                self.reset();
            }
        }
    }

    /// Increments the counter unless it is saturated.
    fn try_increment(&mut self, index: usize, counter: u64) -> bool {
        let offset = counter << 2;
        let mask = 0xf << offset;
        if self.table[index] & mask != mask {
            self.table[index] += 1 << offset;
            return true;
        }
        false
    }

    /// Halves every counter.
    fn reset(&mut self) {
        let mut odds = 0u64;
        for slot in self.table.iter_mut() {
            odds += (*slot & ONE_MASK).count_ones() as u64;
            *slot = (*slot >> 1) & RESET_MASK;
        }
        self.size = (self.size >> 1).saturating_sub(odds >> 2);
    }

    fn index_of(&self, hash: u64, seed: u64) -> usize {
        let mut hash = hash.wrapping_add(seed).wrapping_mul(seed);
        hash = hash.wrapping_add(hash >> 32);
        (hash & self.table_mask) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch(capacity: u64) -> FrequencySketch {
        let mut sketch = FrequencySketch::default();
        sketch.ensure_capacity(capacity);
        sketch
    }

    #[test]
    fn test_disabled_by_default() {
        let mut sketch = FrequencySketch::default();
        sketch.increment(42);
        assert_eq!(sketch.frequency(42), 0);
    }

    #[test]
    fn test_increment_and_frequency() {
        let mut sketch = sketch(512);
        for _ in 0..3 {
            sketch.increment(0xabcd);
        }
        assert_eq!(sketch.frequency(0xabcd), 3);
        assert_eq!(sketch.frequency(0x1234), 0);
    }

    #[test]
    fn test_saturates_at_fifteen() {
        let mut sketch = sketch(512);
        for _ in 0..100 {
            sketch.increment(7);
        }
        assert_eq!(sketch.frequency(7), 15);
    }

    #[test]
    fn test_reset_halves_counters() {
        let mut sketch = sketch(64);
        assert_eq!(sketch.table_len(), 128);

        for _ in 0..10 {
            sketch.increment(1);
        }
        let before = sketch.frequency(1);
        assert!(before >= 10);

        // Push the sketch through its sample period until a reset happens.
        let mut key = 100u64;
        loop {
            let size = sketch.size;
            sketch.increment(key);
            key = key.wrapping_mul(31).wrapping_add(7);
            if sketch.size < size {
                break;
            }
        }
        assert!(sketch.frequency(1) < before);
    }

    #[test]
    fn test_table_sizing() {
        assert_eq!(sketch(0).table_len(), 128);
        assert_eq!(sketch(128).table_len(), 128);
        assert_eq!(sketch(1000).table_len(), 1024);
        // Growing keeps the larger table.
        let mut sketch = sketch(1 << 16);
        sketch.ensure_capacity(128);
        assert_eq!(sketch.table_len(), 1 << 16);
    }
}
