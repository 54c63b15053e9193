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

use std::{marker::PhantomData, ptr::NonNull};

use crate::node::Node;

/// Intrusive link pair. A node carries one pair per list it can join.
pub(crate) struct Link<K, V> {
    pub(crate) prev: Option<NonNull<Node<K, V>>>,
    pub(crate) next: Option<NonNull<Node<K, V>>>,
}

impl<K, V> Default for Link<K, V> {
    fn default() -> Self {
        Self {
            prev: None,
            next: None,
        }
    }
}

/// Selects one of the node's link pairs.
pub(crate) trait LinkSet {
    /// # Safety
    ///
    /// The caller must hold the eviction lock.
    unsafe fn link<K, V>(node: NonNull<Node<K, V>>) -> *mut Link<K, V>;
}

/// Access-order links, shared by the eden, probation, protected, and
/// zero-weight deques. A node is in at most one of them at a time.
pub(crate) struct AccessOrder;

/// Write-order links, used when a write expiry is configured.
pub(crate) struct WriteOrder;

/// Timer-wheel bucket links.
pub(crate) struct TimerOrder;

impl LinkSet for AccessOrder {
    unsafe fn link<K, V>(node: NonNull<Node<K, V>>) -> *mut Link<K, V> {
        &mut node.as_ref().policy_mut().access
    }
}

impl LinkSet for WriteOrder {
    unsafe fn link<K, V>(node: NonNull<Node<K, V>>) -> *mut Link<K, V> {
        &mut node.as_ref().policy_mut().write
    }
}

impl LinkSet for TimerOrder {
    unsafe fn link<K, V>(node: NonNull<Node<K, V>>) -> *mut Link<K, V> {
        &mut node.as_ref().policy_mut().timer
    }
}

/// Intrusive doubly-linked deque over nodes.
///
/// Not thread-safe; every method requires the eviction lock. All mutations
/// are O(1).
pub(crate) struct Deque<K, V, O: LinkSet> {
    head: Option<NonNull<Node<K, V>>>,
    tail: Option<NonNull<Node<K, V>>>,
    len: usize,
    _marker: PhantomData<O>,
}

impl<K, V, O: LinkSet> Default for Deque<K, V, O> {
    fn default() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _marker: PhantomData,
        }
    }
}

impl<K, V, O: LinkSet> Deque<K, V, O> {
    unsafe fn link_of<'a>(ptr: NonNull<Node<K, V>>) -> &'a mut Link<K, V> {
        &mut *O::link(ptr)
    }

    /// # Safety
    ///
    /// The eviction lock must be held and the node must not be linked in any
    /// deque of this link set.
    pub unsafe fn push_back(&mut self, ptr: NonNull<Node<K, V>>) {
        let link = Self::link_of(ptr);
        debug_assert!(link.prev.is_none() && link.next.is_none());
        link.prev = self.tail;
        match self.tail {
            Some(tail) => Self::link_of(tail).next = Some(ptr),
            None => self.head = Some(ptr),
        }
        self.tail = Some(ptr);
        self.len += 1;
    }

    /// # Safety
    ///
    /// Same contract as [`Deque::push_back`].
    #[allow(dead_code)]
    pub unsafe fn push_front(&mut self, ptr: NonNull<Node<K, V>>) {
        let link = Self::link_of(ptr);
        debug_assert!(link.prev.is_none() && link.next.is_none());
        link.next = self.head;
        match self.head {
            Some(head) => Self::link_of(head).prev = Some(ptr),
            None => self.tail = Some(ptr),
        }
        self.head = Some(ptr);
        self.len += 1;
    }

    /// # Safety
    ///
    /// The eviction lock must be held and the node must be linked in this
    /// deque.
    pub unsafe fn unlink(&mut self, ptr: NonNull<Node<K, V>>) {
        let link = Self::link_of(ptr);
        let (prev, next) = (link.prev.take(), link.next.take());
        match prev {
            Some(prev) => Self::link_of(prev).next = next,
            None => {
                debug_assert_eq!(self.head, Some(ptr));
                self.head = next;
            }
        }
        match next {
            Some(next) => Self::link_of(next).prev = prev,
            None => {
                debug_assert_eq!(self.tail, Some(ptr));
                self.tail = prev;
            }
        }
        self.len -= 1;
    }

    /// # Safety
    ///
    /// Same contract as [`Deque::unlink`].
    pub unsafe fn move_to_back(&mut self, ptr: NonNull<Node<K, V>>) {
        self.unlink(ptr);
        self.push_back(ptr);
    }

    /// # Safety
    ///
    /// The eviction lock must be held.
    pub unsafe fn pop_front(&mut self) -> Option<NonNull<Node<K, V>>> {
        let head = self.head?;
        self.unlink(head);
        Some(head)
    }

    pub fn peek_front(&self) -> Option<NonNull<Node<K, V>>> {
        self.head
    }

    #[allow(dead_code)]
    pub fn peek_back(&self) -> Option<NonNull<Node<K, V>>> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The eviction lock must be held for the iterator's whole lifetime.
    pub unsafe fn iter(&self) -> Iter<'_, K, V, O> {
        Iter {
            next: self.head,
            remaining: self.len,
            _marker: PhantomData,
        }
    }
}

pub(crate) struct Iter<'a, K, V, O: LinkSet> {
    next: Option<NonNull<Node<K, V>>>,
    remaining: usize,
    _marker: PhantomData<&'a Deque<K, V, O>>,
}

impl<K, V, O: LinkSet> Iterator for Iter<'_, K, V, O> {
    type Item = NonNull<Node<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = unsafe { (*O::link(current)).next };
        self.remaining -= 1;
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
