// Copyright 2020 Joyent, Inc.

//! A pool of reusable synchronization control blocks.
//!
//! Every operation needs a mutex and a condition variable. Rather than
//! creating and destroying the pair for each operation the runtime reserves
//! one from a [`ControlPool`](struct.ControlPool.html). The pool keeps the
//! reserved blocks in a slab so each reservation is identified by an index,
//! and keeps released blocks on an idle list for reuse. A reservation is
//! returned to the pool when its [`ControlHandle`](struct.ControlHandle.html)
//! is dropped.

use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use slab::Slab;

/// A mutex-protected state paired with a condition variable.
#[derive(Debug, Default)]
pub struct ControlBlock<S> {
    lock: Mutex<S>,
    cond: Condvar,
}

impl<S> ControlBlock<S> {
    pub fn lock(&self) -> MutexGuard<S> {
        self.lock.lock().unwrap()
    }

    /// Wait on the condition variable. Returns the guard and whether the
    /// wait timed out.
    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, S>,
        m_timeout: Option<Duration>,
    ) -> (MutexGuard<'a, S>, bool) {
        match m_timeout {
            Some(timeout) => {
                let wait_result = self.cond.wait_timeout(g, timeout).unwrap();
                (wait_result.0, wait_result.1.timed_out())
            }
            None => (self.cond.wait(g).unwrap(), false),
        }
    }

    pub fn broadcast(&self) {
        self.cond.notify_all()
    }
}

/// Reservation counts for a control block pool
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlPoolStats {
    /// Blocks currently handed out
    pub reserved: usize,
    /// Blocks available for reuse
    pub idle: usize,
}

struct PoolData<S> {
    reserved: Slab<Arc<ControlBlock<S>>>,
    idle: Vec<Arc<ControlBlock<S>>>,
}

/// An arena of control blocks handed out by index.
pub struct ControlPool<S> {
    data: Mutex<PoolData<S>>,
}

impl<S> fmt::Debug for ControlPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<S> ControlPool<S>
where
    S: Default,
{
    /// Create a pool with `preallocate` idle blocks ready for use.
    pub fn new(preallocate: usize) -> Arc<Self> {
        let idle = (0..preallocate)
            .map(|_| Arc::new(ControlBlock::default()))
            .collect();

        Arc::new(ControlPool {
            data: Mutex::new(PoolData {
                reserved: Slab::with_capacity(preallocate),
                idle,
            }),
        })
    }

    /// Reserve a control block. The block's state is always the default
    /// value of `S` when handed out.
    pub fn reserve(self: &Arc<Self>) -> ControlHandle<S> {
        let mut data = self.data.lock().unwrap();
        let block = data
            .idle
            .pop()
            .unwrap_or_else(|| Arc::new(ControlBlock::default()));
        let key = data.reserved.insert(block.clone());

        ControlHandle {
            key,
            block,
            pool: self.clone(),
        }
    }

    fn release(&self, key: usize, block: &Arc<ControlBlock<S>>) {
        // Reset the state before taking the pool lock. Dropping the old state
        // may drop other handles which release back into this pool.
        let old = {
            let mut state = block.lock();
            mem::take(&mut *state)
        };
        drop(old);

        let mut data = self.data.lock().unwrap();
        if data.reserved.contains(key) {
            let block = data.reserved.remove(key);
            data.idle.push(block);
        }
    }
}

impl<S> ControlPool<S> {
    pub fn stats(&self) -> ControlPoolStats {
        let data = self.data.lock().unwrap();
        ControlPoolStats {
            reserved: data.reserved.len(),
            idle: data.idle.len(),
        }
    }
}

/// A reserved control block. Dropping the handle returns the block to its
/// pool.
pub struct ControlHandle<S>
where
    S: Default,
{
    key: usize,
    block: Arc<ControlBlock<S>>,
    pool: Arc<ControlPool<S>>,
}

impl<S> ControlHandle<S>
where
    S: Default,
{
    pub fn key(&self) -> usize {
        self.key
    }

    pub fn block(&self) -> &ControlBlock<S> {
        &self.block
    }
}

impl<S> fmt::Debug for ControlHandle<S>
where
    S: Default,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlHandle")
            .field("key", &self.key)
            .finish()
    }
}

impl<S> Drop for ControlHandle<S>
where
    S: Default,
{
    fn drop(&mut self) {
        self.pool.release(self.key, &self.block);
    }
}
