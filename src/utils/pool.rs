// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object pool for values that are expensive to allocate per message.
//!
//! A [`Pool`] hands out [`Pooled`] guards. A guard goes back to its pool exactly
//! once: either through [`Pooled::release`] or when it is dropped. On the way back
//! the pool either resets and re-queues the value (below `max`) or disposes of it
//! and raises an overflow notification (at or above `max`).

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;
type Dispose<T> = Box<dyn Fn(T) + Send + Sync>;
type OverflowListener = Box<dyn Fn(&str) + Send + Sync>;

struct PoolInner<T> {
    name: String,
    min: usize,
    max: usize,
    // the queue length doubles as the pool size, both guarded by this lock
    items: Mutex<VecDeque<T>>,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
    dispose: Option<Dispose<T>>,
    on_overflow: Option<OverflowListener>,
    created: AtomicU64,
    overflowed: AtomicU64,
}

impl<T> PoolInner<T> {
    fn give_back(&self, mut value: T) {
        let mut items = self.items.lock();
        if items.len() < self.max {
            if let Some(reset) = &self.reset {
                reset(&mut value);
            }
            items.push_back(value);
            return;
        }
        drop(items);

        if let Some(dispose) = &self.dispose {
            dispose(value);
        }
        self.overflowed.fetch_add(1, Ordering::Relaxed);
        trace!("pool {} is full, discarding released entry", self.name);
        if let Some(listener) = &self.on_overflow {
            listener(&self.name);
        }
    }
}

/// Shared handle to a pool; cloning shares the same backing queue.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("min", &self.inner.min)
            .field("max", &self.inner.max)
            .field("available", &self.available())
            .finish()
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn builder<F>(name: impl Into<String>, factory: F) -> PoolBuilder<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        PoolBuilder {
            name: name.into(),
            min: 0,
            max: usize::MAX,
            factory: Box::new(factory),
            reset: None,
            dispose: None,
            on_overflow: None,
        }
    }

    /// Takes a queued entry as-is, or builds a fresh one. Never blocks.
    pub fn acquire(&self) -> Pooled<T> {
        let queued = self.inner.items.lock().pop_front();
        let value = match queued {
            Some(value) => value,
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                (self.inner.factory)()
            }
        };
        Pooled {
            value: Some(value),
            pool: self.inner.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Entries currently queued and ready to be acquired.
    pub fn available(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Entries the factory has built so far, pre-warmed ones included.
    pub fn created(&self) -> u64 {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// Releases that found the pool full and discarded their entry.
    pub fn overflowed(&self) -> u64 {
        self.inner.overflowed.load(Ordering::Relaxed)
    }

    fn ensure_minimum(&self) {
        let mut items = self.inner.items.lock();
        while items.len() < self.inner.min {
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            items.push_back((self.inner.factory)());
        }
    }
}

pub struct PoolBuilder<T> {
    name: String,
    min: usize,
    max: usize,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
    dispose: Option<Dispose<T>>,
    on_overflow: Option<OverflowListener>,
}

impl<T: Send + 'static> PoolBuilder<T> {
    /// Entries built up front when the pool is constructed.
    pub fn min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    /// Upper bound on queued entries; releases beyond it are discarded.
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn reset<F>(mut self, reset: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.reset = Some(Box::new(reset));
        self
    }

    pub fn dispose<F>(mut self, dispose: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.dispose = Some(Box::new(dispose));
        self
    }

    pub fn on_overflow<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_overflow = Some(Box::new(listener));
        self
    }

    pub fn build(self) -> Pool<T> {
        let max = self.max.max(self.min);
        let pool = Pool {
            inner: Arc::new(PoolInner {
                name: self.name,
                min: self.min,
                max,
                items: Mutex::new(VecDeque::with_capacity(self.min)),
                factory: self.factory,
                reset: self.reset,
                dispose: self.dispose,
                on_overflow: self.on_overflow,
                created: AtomicU64::new(0),
                overflowed: AtomicU64::new(0),
            }),
        };
        pool.ensure_minimum();
        pool
    }
}

/// A value on loan from a [`Pool`].
pub struct Pooled<T> {
    // `None` once released or detached
    value: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Pooled<T> {
    /// Hands the value back now instead of at drop. Later drops are no-ops.
    pub fn release(mut self) {
        self.release_once();
    }

    /// Takes the value out of pool management; it will never be re-queued.
    pub fn detach(mut self) -> T {
        match self.value.take() {
            Some(value) => value,
            // release/detach consume the guard, so the slot is always full here
            None => unreachable!("pooled value already taken"),
        }
    }

    fn release_once(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.give_back(value);
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.pool.name)
            .field("value", &self.value)
            .finish()
    }
}
