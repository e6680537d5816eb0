//! Work queues for deferred execution.
//!
//! A `Workqueue` owns one worker thread draining a queue of `Work` items.
//! Work items are re-queueable: queuing an item that is already pending is a
//! no-op, and the pending mark clears before the closure runs, so a kick
//! arriving while the closure executes queues it again instead of being
//! lost. This is what the deferred-request drain and the per-pool waiting
//! workers rely on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Work states
const WORK_IDLE: u8 = 0;
const WORK_PENDING: u8 = 1;

/// A unit of deferred work.
pub struct Work {
    func: Box<dyn Fn() + Send + Sync>,
    /// Idle -> Pending (queued) -> Idle (about to run)
    state: AtomicU8,
    /// Debug name for this work item
    name: &'static str,
}

impl Work {
    pub fn new<F>(func: F, name: &'static str) -> Arc<Work>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Work {
            func: Box::new(func),
            state: AtomicU8::new(WORK_IDLE),
            name,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Transition from Idle to Pending. Returns false if already pending.
    fn try_set_pending(&self) -> bool {
        self.state
            .compare_exchange(WORK_IDLE, WORK_PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Execute this work item (called by the worker thread).
    fn execute(&self) {
        // Clear the pending mark first so a kick during execution re-queues.
        self.state.store(WORK_IDLE, Ordering::Release);
        (self.func)();
    }
}

struct WqInner {
    queue: spin::Mutex<VecDeque<Arc<Work>>>,
    shutdown: AtomicBool,
    name: &'static str,
}

/// A queue of work items drained by a single worker thread.
pub struct Workqueue {
    inner: Arc<WqInner>,
    worker: spin::Mutex<Option<JoinHandle<()>>>,
}

impl Workqueue {
    pub fn new(name: &'static str) -> Workqueue {
        let inner = Arc::new(WqInner {
            queue: spin::Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
            name,
        });

        let worker = {
            let inner = Arc::clone(&inner);
            match thread::Builder::new()
                .name(name.into())
                .spawn(move || worker_loop(inner))
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("workqueue({}): failed to spawn worker: {}", name, e);
                    None
                }
            }
        };

        Workqueue {
            inner,
            worker: spin::Mutex::new(worker),
        }
    }

    /// Queue work for execution. Returns false if it was already pending.
    pub fn queue(&self, work: &Arc<Work>) -> bool {
        if !work.try_set_pending() {
            // Pending kicks coalesce; the queued run will observe the new state.
            return false;
        }
        self.inner.queue.lock().push_back(Arc::clone(work));
        self.unpark_worker();
        true
    }

    /// Wait for all work queued before this call to complete.
    pub fn flush(&self) {
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let sentinel = {
            let done = Arc::clone(&done);
            Work::new(
                move || {
                    let (flag, cvar) = &*done;
                    *flag.lock().expect("flush flag poisoned") = true;
                    cvar.notify_all();
                },
                "flush_sentinel",
            )
        };
        if self.queue(&sentinel) {
            let (flag, cvar) = &*done;
            let mut flag = flag.lock().expect("flush flag poisoned");
            while !*flag {
                flag = cvar.wait(flag).expect("flush flag poisoned");
            }
        }
    }

    /// Stop the worker thread after completing all pending work.
    pub fn destroy(&self) {
        if self.worker.lock().is_none() {
            return;
        }
        // Flush while the handle is still present so queue() can unpark.
        self.flush();
        self.inner.shutdown.store(true, Ordering::Release);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("workqueue({}): worker thread panicked", self.inner.name);
            }
        }
    }

    fn unpark_worker(&self) {
        if let Some(handle) = &*self.worker.lock() {
            handle.thread().unpark();
        }
    }
}

impl Drop for Workqueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn worker_loop(inner: Arc<WqInner>) {
    log::debug!("workqueue({}): worker thread started", inner.name);

    loop {
        let work = inner.queue.lock().pop_front();
        match work {
            Some(work) => {
                log::trace!("workqueue({}): executing work '{}'", inner.name, work.name);
                work.execute();
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                // queue() unparks after pushing, so a push racing this park
                // leaves the unpark token set and park returns immediately.
                thread::park();
            }
        }
    }

    log::debug!("workqueue({}): worker thread exiting", inner.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_queued_work() {
        let wq = Workqueue::new("wq-test");
        let hits = Arc::new(AtomicUsize::new(0));
        let work = {
            let hits = Arc::clone(&hits);
            Work::new(
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                "count",
            )
        };
        assert!(wq.queue(&work));
        wq.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Re-queueable after running.
        assert!(wq.queue(&work));
        wq.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pending_kicks_coalesce() {
        let wq = Workqueue::new("wq-coalesce");
        let hits = Arc::new(AtomicUsize::new(0));
        let work = {
            let hits = Arc::clone(&hits);
            Work::new(
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                "count",
            )
        };
        // Hold the worker busy so both queue() calls land before execution.
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let blocker = {
            let gate = Arc::clone(&gate);
            Work::new(
                move || {
                    let (flag, cvar) = &*gate;
                    let mut flag = flag.lock().unwrap();
                    while !*flag {
                        flag = cvar.wait(flag).unwrap();
                    }
                },
                "blocker",
            )
        };
        wq.queue(&blocker);
        assert!(wq.queue(&work));
        assert!(!wq.queue(&work)); // coalesced
        {
            let (flag, cvar) = &*gate;
            *flag.lock().unwrap() = true;
            cvar.notify_all();
        }
        wq.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_completes_pending_work() {
        let wq = Workqueue::new("wq-destroy");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let hits = Arc::clone(&hits);
            let work = Work::new(
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                "burst",
            );
            wq.queue(&work);
        }
        wq.destroy();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }
}
