//! Reactive Runtime
//!
//! The runtime owns the microtask queue that effect reruns are deferred to.
//!
//! # How It Works
//!
//! 1. A write notifies the tokens tracking the written field.
//!
//! 2. Each notified effect sets its "scheduled" flag and enqueues one
//!    microtask. Further notifications before that microtask runs are
//!    absorbed by the flag, so a burst of writes yields a single rerun.
//!
//! 3. [`flush_effects`] drains the queue, including microtasks enqueued
//!    while draining, in FIFO order.
//!
//! The host is expected to flush at the end of each task, the way a browser
//! performs a microtask checkpoint. The resource cache does this itself after
//! every load completion and timer.
//!
//! Inside a [`tokio::task::LocalSet`] the host can instead hold an
//! [`AutoFlush`] guard: the first microtask queued into an empty queue then
//! spawns a local task that flushes on the next scheduler tick.
//!
//! # Thread Safety
//!
//! The runtime is single-threaded. All state is thread-local; effects and
//! observables are `!Send`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use tracing::{trace, warn};

type Microtask = Box<dyn FnOnce()>;
type SettledCallback = Box<dyn FnOnce()>;

thread_local! {
    static MICROTASKS: RefCell<VecDeque<Microtask>> = const { RefCell::new(VecDeque::new()) };
    static FLUSHING: Cell<bool> = const { Cell::new(false) };
    static PENDING_RERUNS: Cell<usize> = const { Cell::new(0) };
    static SETTLED_CALLBACKS: RefCell<Vec<SettledCallback>> = const { RefCell::new(Vec::new()) };
    static AUTO_FLUSH: Cell<usize> = const { Cell::new(0) };
    static FLUSH_SPAWNED: Cell<bool> = const { Cell::new(false) };
}

/// The microtask queue of the current thread.
pub struct Runtime;

/// Resets the flushing flag even if a microtask panics.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        FLUSHING.with(|flushing| flushing.set(false));
    }
}

/// Keeps automatic flushing on for the current thread. See [`Runtime::auto_flush`].
#[must_use = "automatic flushing stops when the guard is dropped"]
pub struct AutoFlush {
    _private: (),
}

impl Drop for AutoFlush {
    fn drop(&mut self) {
        let remaining = AUTO_FLUSH.with(|depth| {
            let remaining = depth.get().saturating_sub(1);
            depth.set(remaining);
            remaining
        });
        if remaining == 0 {
            FLUSH_SPAWNED.with(|spawned| spawned.set(false));
        }
    }
}

impl Runtime {
    /// Queue work to run at the next flush.
    pub fn enqueue(task: impl FnOnce() + 'static) {
        let was_empty = MICROTASKS.with(|queue| {
            let mut queue = queue.borrow_mut();
            let was_empty = queue.is_empty();
            queue.push_back(Box::new(task));
            was_empty
        });
        if was_empty {
            Self::spawn_flush();
        }
    }

    /// Flush on the next scheduler tick whenever work is queued, until the
    /// guard is dropped.
    ///
    /// # Panics
    ///
    /// Queuing work while the guard is alive panics outside of a
    /// [`tokio::task::LocalSet`].
    pub fn auto_flush() -> AutoFlush {
        AUTO_FLUSH.with(|depth| depth.set(depth.get() + 1));
        AutoFlush { _private: () }
    }

    fn spawn_flush() {
        if AUTO_FLUSH.with(Cell::get) == 0 || Self::is_flushing() || FLUSH_SPAWNED.with(|spawned| spawned.replace(true)) {
            return;
        }
        trace!("auto flush scheduled");
        tokio::task::spawn_local(async {
            FLUSH_SPAWNED.with(|spawned| spawned.set(false));
            Runtime::flush();
        });
    }

    /// Queue an effect rerun and count it as in flight.
    ///
    /// The task must call [`Runtime::rerun_finished`] exactly once.
    pub(crate) fn enqueue_rerun(task: impl FnOnce() + 'static) {
        PENDING_RERUNS.with(|pending| pending.set(pending.get() + 1));
        Self::enqueue(task);
    }

    /// Mark one in-flight rerun as done.
    pub(crate) fn rerun_finished() {
        let remaining = PENDING_RERUNS.with(|pending| {
            let remaining = pending.get().saturating_sub(1);
            pending.set(remaining);
            remaining
        });
        if remaining == 0 {
            Self::fire_settled();
        }
    }

    /// Number of reruns scheduled but not yet executed.
    pub fn pending_reruns() -> usize {
        PENDING_RERUNS.with(Cell::get)
    }

    /// Number of queued microtasks.
    pub fn queued() -> usize {
        MICROTASKS.with(|queue| queue.borrow().len())
    }

    /// Whether a flush is in progress on this thread.
    pub fn is_flushing() -> bool {
        FLUSHING.with(Cell::get)
    }

    /// Run `callback` once no rerun is in flight.
    ///
    /// Runs immediately if the runtime is already settled.
    pub fn when_settled(callback: impl FnOnce() + 'static) {
        if Self::pending_reruns() == 0 {
            callback();
        } else {
            SETTLED_CALLBACKS.with(|callbacks| callbacks.borrow_mut().push(Box::new(callback)));
        }
    }

    fn fire_settled() {
        let callbacks = SETTLED_CALLBACKS.with(|callbacks| std::mem::take(&mut *callbacks.borrow_mut()));
        if !callbacks.is_empty() {
            trace!(count = callbacks.len(), "settled");
        }
        for callback in callbacks {
            callback();
        }
    }

    /// Drain the microtask queue.
    ///
    /// Non-reentrant: a flush requested from inside a microtask returns
    /// immediately, and the outer flush picks up whatever was queued.
    pub fn flush() {
        if FLUSHING.with(|flushing| flushing.replace(true)) {
            warn!("flush requested while already flushing");
            return;
        }
        let _guard = FlushGuard;

        loop {
            let next = MICROTASKS.with(|queue| queue.borrow_mut().pop_front());
            match next {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

/// Drain the microtask queue. See [`Runtime::flush`].
pub fn flush_effects() {
    Runtime::flush();
}

/// Wait until every scheduled rerun has executed.
///
/// Flushes, then yields to the async runtime between flushes for as long as
/// reruns remain in flight.
pub async fn settled() {
    loop {
        Runtime::flush();
        if Runtime::pending_reruns() == 0 && Runtime::queued() == 0 {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn flush_runs_tasks_in_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = Rc::clone(&order);
            Runtime::enqueue(move || order.borrow_mut().push(i));
        }
        assert_eq!(Runtime::queued(), 3);

        flush_effects();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(Runtime::queued(), 0);
    }

    #[test]
    fn tasks_queued_during_flush_run_in_the_same_flush() {
        let ran = Rc::new(Cell::new(false));
        let inner = Rc::clone(&ran);
        Runtime::enqueue(move || {
            Runtime::enqueue(move || inner.set(true));
        });

        flush_effects();
        assert!(ran.get());
    }

    #[test]
    fn nested_flush_is_a_no_op() {
        let count = Rc::new(Cell::new(0));
        let outer = Rc::clone(&count);
        Runtime::enqueue(move || {
            let inner = Rc::clone(&outer);
            Runtime::enqueue(move || inner.set(inner.get() + 1));
            flush_effects();
            assert_eq!(outer.get(), 0);
        });

        flush_effects();
        assert_eq!(count.get(), 1);
        assert!(!Runtime::is_flushing());
    }

    #[test]
    fn settled_callbacks_wait_for_pending_reruns() {
        let fired = Rc::new(Cell::new(false));
        Runtime::enqueue_rerun(Runtime::rerun_finished);

        let flag = Rc::clone(&fired);
        Runtime::when_settled(move || flag.set(true));
        assert!(!fired.get());
        assert_eq!(Runtime::pending_reruns(), 1);

        flush_effects();
        assert!(fired.get());
        assert_eq!(Runtime::pending_reruns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_flush_drains_on_the_next_tick() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let count = Rc::new(Cell::new(0));
                {
                    let _auto = Runtime::auto_flush();
                    for _ in 0..2 {
                        let count = Rc::clone(&count);
                        Runtime::enqueue(move || count.set(count.get() + 1));
                    }
                    assert_eq!(count.get(), 0);

                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    assert_eq!(count.get(), 2);
                    assert_eq!(Runtime::queued(), 0);
                }

                let flag = Rc::clone(&count);
                Runtime::enqueue(move || flag.set(flag.get() + 1));
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                assert_eq!(count.get(), 2, "no automatic flush once the guard is gone");
                flush_effects();
                assert_eq!(count.get(), 3);
            })
            .await;
    }

    #[test]
    fn when_settled_runs_immediately_when_idle() {
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        Runtime::when_settled(move || flag.set(true));
        assert!(fired.get());
    }
}
