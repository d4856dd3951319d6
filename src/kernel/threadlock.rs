//! Hierarchical, deadlock-detecting mutual exclusion
//!
//! A `LockSlot` is the per-synchronization-object handle cell; the actual
//! lock object is created lazily on first use from a kernel-wide arena and
//! recycled on a free list when its last user leaves, so short-lived
//! synchronization objects cause no allocation churn.
//!
//! # Design
//!
//! Each lock keeps a stack of owner frames. The top frame names the thread
//! currently inside the protected region; its *child gate* is what descendant
//! threads of that owner block on, which lets a child re-enter a region its
//! ancestor holds without deadlocking against it. Unrelated threads block on
//! the fallback gate, held for the whole outermost ownership.
//!
//! Before blocking, a thread publishes which lock it is waiting for and walks
//! the waiting-for chain (lock → owning thread → the lock *that* thread waits
//! for → …). Revisiting the walking thread means the waits form a cycle: the
//! walker is aborted with a `deadlock` diagnostic instead of blocking, and
//! the remaining threads proceed. The walk is serialized kernel-wide so that
//! exactly one thread of a cycle aborts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::kernel::context::Kernel;
use crate::kernel::thread::{Aborted, EvalResult, ThreadContext};
use crate::kernel::value::Value;

/// Handle cell binding a synchronization object to its pooled lock.
/// Embed one per object that needs `call_locked`; `LockSlot::new()` is const,
/// so slots can live in statics.
pub struct LockSlot(AtomicUsize);

impl LockSlot {
    pub const fn new() -> LockSlot {
        LockSlot(AtomicUsize::new(0))
    }
}

impl Default for LockSlot {
    fn default() -> LockSlot {
        LockSlot::new()
    }
}

struct OwnerFrame {
    thread: u64,
    /// Gate the owner's descendants queue on while this frame is on top.
    gate: Arc<Mutex<()>>,
}

pub(crate) struct Threadlock {
    index: usize,
    refcount: AtomicUsize,
    owners: Mutex<Vec<OwnerFrame>>,
    fallback: Arc<Mutex<()>>,
}

impl Threadlock {
    fn new(index: usize) -> Threadlock {
        Threadlock {
            index,
            refcount: AtomicUsize::new(0),
            owners: Mutex::new(Vec::new()),
            fallback: Arc::new(Mutex::new(())),
        }
    }

    fn top_owner(&self) -> Option<u64> {
        self.owners.lock().last().map(|f| f.thread)
    }
}

struct ArenaState {
    locks: Vec<Arc<Threadlock>>,
    free: Vec<usize>,
}

/// Kernel-wide pool of lock objects, indexed by small integer handles.
pub(crate) struct LockArena {
    state: Mutex<ArenaState>,
}

impl LockArena {
    pub(crate) fn new() -> LockArena {
        LockArena {
            state: Mutex::new(ArenaState {
                locks: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Bind the slot to a lock object (reusing a pooled one if available) and
    /// take a reference on it.
    fn acquire(&self, slot: &LockSlot) -> Arc<Threadlock> {
        let mut state = self.state.lock();
        let bound = slot.0.load(Ordering::Acquire);
        if bound != 0 {
            let lock = state.locks[bound - 1].clone();
            lock.refcount.fetch_add(1, Ordering::AcqRel);
            return lock;
        }
        let lock = match state.free.pop() {
            Some(index) => state.locks[index].clone(),
            None => {
                let index = state.locks.len();
                let lock = Arc::new(Threadlock::new(index));
                state.locks.push(lock.clone());
                lock
            }
        };
        lock.refcount.store(1, Ordering::Release);
        slot.0.store(lock.index + 1, Ordering::Release);
        lock
    }

    /// Drop a reference; the last user unbinds the slot and recycles the lock
    /// object.
    fn release(&self, slot: &LockSlot, lock: &Arc<Threadlock>) {
        let mut state = self.state.lock();
        if lock.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug_assert!(lock.owners.lock().is_empty());
            slot.0.store(0, Ordering::Release);
            state.free.push(lock.index);
        }
    }

    pub(crate) fn get(&self, index: usize) -> Option<Arc<Threadlock>> {
        self.state.lock().locks.get(index).cloned()
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.state.lock().free.len()
    }
}

impl Kernel {
    /// Run `callback` inside the mutual-exclusion region of `slot`.
    ///
    /// Re-entry by the owning thread and entry by its descendant threads do
    /// not block. A wait that would close a cycle aborts the current thread
    /// with a `deadlock` diagnostic instead of hanging.
    pub fn call_locked<R>(&self, slot: &LockSlot, callback: impl FnOnce() -> R) -> EvalResult<R> {
        let ctx = self.ensure_attached();
        let lock = self.inner().locks.acquire(slot);
        let result = self.enter_locked(&ctx, &lock, callback);
        self.inner().locks.release(slot, &lock);
        result
    }

    fn enter_locked<R>(
        &self,
        ctx: &ThreadContext,
        lock: &Arc<Threadlock>,
        callback: impl FnOnce() -> R,
    ) -> EvalResult<R> {
        // classify: reentrant, queue on an ancestor's child gate, or fallback
        let gate = {
            let owners = lock.owners.lock();
            match owners.last() {
                Some(top) if top.thread == ctx.id => None,
                _ => Some(
                    owners
                        .iter()
                        .rev()
                        .find(|frame| ctx.is_self_or_descendant_of(frame.thread))
                        .map(|frame| frame.gate.clone())
                        .unwrap_or_else(|| lock.fallback.clone()),
                ),
            }
        };

        let Some(gate) = gate else {
            // the current thread already owns the region
            return Ok(callback());
        };

        let guard = {
            let scan = self.inner().deadlock_scan.lock();
            ctx.waiting_lock.store(lock.index + 1, Ordering::Release);
            match gate.try_lock() {
                Some(guard) => {
                    ctx.waiting_lock.store(0, Ordering::Release);
                    drop(scan);
                    guard
                }
                None => {
                    if self.waiting_cycle(ctx, lock) {
                        ctx.waiting_lock.store(0, Ordering::Release);
                        drop(scan);
                        tracing::debug!(
                            target: "syma::threadlock",
                            thread = ctx.id,
                            lock = lock.index,
                            "deadlock detected, aborting current thread"
                        );
                        self.message(
                            &self.general_symbol(),
                            "deadlock",
                            vec![Value::Int(ctx.id as i64)],
                        );
                        return Err(Aborted);
                    }
                    drop(scan);
                    let guard = gate.lock();
                    ctx.waiting_lock.store(0, Ordering::Release);
                    guard
                }
            }
        };

        lock.owners.lock().push(OwnerFrame {
            thread: ctx.id,
            gate: Arc::new(Mutex::new(())),
        });

        let out = callback();

        {
            let mut owners = lock.owners.lock();
            let frame = owners.pop();
            debug_assert!(frame.map(|f| f.thread) == Some(ctx.id));
        }
        drop(guard);
        Ok(out)
    }

    /// Walk lock → owner → that owner's awaited lock → … looking for the
    /// current thread. Called with the detection mutex held.
    fn waiting_cycle(&self, me: &ThreadContext, start: &Arc<Threadlock>) -> bool {
        let mut visited: SmallVec<[usize; 8]> = SmallVec::new();
        let mut cur = start.clone();
        loop {
            if visited.contains(&cur.index) {
                // a cycle not involving the current thread
                return false;
            }
            visited.push(cur.index);

            let Some(owner) = cur.top_owner() else {
                return false;
            };
            if owner == me.id {
                return true;
            }
            let Some(thread) = self.inner().threads.get(&owner).map(|t| t.value().clone()) else {
                return false;
            };
            let awaited = thread.waiting_lock.load(Ordering::Acquire);
            if awaited == 0 {
                return false;
            }
            let Some(next) = self.inner().locks.get(awaited - 1) else {
                return false;
            };
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_exclusion_between_unrelated_threads() {
        let kernel = Kernel::new();
        let slot = Arc::new(LockSlot::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let kernel = kernel.clone();
                let slot = slot.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        kernel
                            .call_locked(&slot, || {
                                let n = inside.fetch_add(1, Ordering::SeqCst) + 1;
                                max_inside.fetch_max(n, Ordering::SeqCst);
                                inside.fetch_sub(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_same_thread() {
        let kernel = Kernel::new();
        let slot = LockSlot::new();
        let out = kernel
            .call_locked(&slot, || {
                kernel.call_locked(&slot, || 42).unwrap()
            })
            .unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn test_descendant_reenters_ancestors_region() {
        let kernel = Kernel::new();
        kernel.attach_current_ctx();
        let slot = Arc::new(LockSlot::new());
        let out = kernel
            .call_locked(&slot, || {
                let kernel2 = kernel.clone();
                let slot2 = slot.clone();
                // a child of the owner enters without blocking
                kernel
                    .spawn(move || kernel2.call_locked(&slot2, || 7).unwrap())
                    .join()
                    .unwrap()
            })
            .unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn test_lock_objects_are_pooled() {
        let kernel = Kernel::new();
        {
            let slot = LockSlot::new();
            kernel.call_locked(&slot, || ()).unwrap();
        }
        assert_eq!(kernel.inner().locks.pooled(), 1);
        {
            // the pooled object is reused, not a new allocation
            let slot = LockSlot::new();
            kernel.call_locked(&slot, || ()).unwrap();
        }
        assert_eq!(kernel.inner().locks.pooled(), 1);
    }

    #[test]
    fn test_two_lock_cycle_aborts_exactly_one() {
        let kernel = Kernel::new();
        let a = Arc::new(LockSlot::new());
        let b = Arc::new(LockSlot::new());

        let spawn_pair = |first: Arc<LockSlot>, second: Arc<LockSlot>| {
            let kernel = kernel.clone();
            std::thread::spawn(move || {
                kernel.call_locked(&first, || {
                    std::thread::sleep(Duration::from_millis(50));
                    kernel.call_locked(&second, || ()).is_err()
                })
            })
        };

        let t1 = spawn_pair(a.clone(), b.clone());
        let t2 = spawn_pair(b, a);

        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();
        // each thread reports whether its inner acquisition was aborted
        let aborted = [r1, r2]
            .iter()
            .map(|r| match r {
                Ok(inner_aborted) => *inner_aborted,
                Err(Aborted) => true,
            })
            .filter(|x| *x)
            .count();
        assert_eq!(aborted, 1, "exactly one thread of the cycle must abort");
        assert!(kernel.has_diagnostic("deadlock"));
    }
}
