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

use std::hash::{BuildHasher, Hash};

/// Key trait for the cache.
pub trait Key: Send + Sync + Hash + Eq + Clone + 'static {}
impl<T: Send + Sync + Hash + Eq + Clone + 'static> Key for T {}

/// Value trait for the cache.
///
/// Values are handed out by clone, so cheaply clonable types (or `Arc`
/// wrappers) are expected.
pub trait Value: Send + Sync + Clone + 'static {}
impl<T: Send + Sync + Clone + 'static> Value for T {}

/// Hash builder trait for the cache.
pub trait HashBuilder: BuildHasher + Clone + Send + Sync + 'static {}
impl<T: BuildHasher + Clone + Send + Sync + 'static> HashBuilder for T {}
