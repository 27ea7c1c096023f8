//! Worker threads and parking.
//!
//! Every worker runs the same loop: scan the shared queue once, poll the
//! selected task, and with nothing to run try to become the I/O leader,
//! the one worker allowed to sit in the kernel wait. Followers park on a
//! permit-model parker. A tickle (new work, or a pinned task skipped by a
//! foreign worker) unparks the followers and breaks the leader out of its
//! wait.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::Shared;

/// Safety-net park bound; real wakeups arrive via `unpark`.
const PARK_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct ParkerInner {
    notified: Mutex<bool>,
    cvar: Condvar,
}

/// Permit-model thread parker: an `unpark` before `park` is not lost.
#[derive(Debug, Clone)]
pub(crate) struct Parker {
    inner: Arc<ParkerInner>,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ParkerInner {
                notified: Mutex::new(false),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Parks the current thread until a permit arrives or `timeout`
    /// passes; consumes the permit either way.
    pub(crate) fn park_timeout(&self, timeout: Duration) {
        let mut notified = self.inner.notified.lock();
        if !*notified {
            let _ = self.inner.cvar.wait_for(&mut notified, timeout);
        }
        *notified = false;
    }

    /// Deposits a permit and wakes the parked thread, if any.
    pub(crate) fn unpark(&self) {
        let mut notified = self.inner.notified.lock();
        *notified = true;
        self.inner.cvar.notify_one();
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// The worker loop. Identical on every worker; `index` only matters for
/// pinned tasks.
pub(crate) fn run(shared: &Arc<Shared>, index: usize, parker: &Parker) {
    let handle = crate::runtime::Handle::from_shared(Arc::clone(shared));
    let _enter = handle.enter();
    debug!(worker = index, name = %shared.name, "worker started");

    loop {
        if shared.queue.is_stopping() && shared.queue.is_empty() {
            break;
        }

        let (task, tickle) = shared.queue.pop_for(Some(index));
        if tickle {
            shared.tickle();
        }
        if let Some(task) = task {
            trace!(worker = index, id = %task.id(), "running task");
            task.run();
            continue;
        }

        // Advertise idleness before the emptiness re-check: a push that
        // lands after the check sees the idle count and tickles, and both
        // the poller notification and the park permit are persistent, so
        // the wait below returns promptly.
        shared.begin_idle();
        if !shared.queue.is_empty() {
            shared.end_idle();
            continue;
        }
        if !shared.driver.turn_once(&shared.queue) {
            parker.park_timeout(PARK_TIMEOUT);
        }
        shared.end_idle();
    }

    debug!(worker = index, name = %shared.name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn permit_before_park_is_not_lost() {
        let parker = Parker::new();
        parker.unpark();
        let start = Instant::now();
        parker.park_timeout(Duration::from_secs(2));
        assert!(
            start.elapsed() < Duration::from_millis(200),
            "pre-deposited permit must make park return immediately"
        );
    }

    #[test]
    fn park_times_out_without_permit() {
        let parker = Parker::new();
        let start = Instant::now();
        parker.park_timeout(Duration::from_millis(50));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "waited {elapsed:?}");
    }

    #[test]
    fn unpark_wakes_parked_thread() {
        let parker = Parker::new();
        let woken = Arc::new(AtomicBool::new(false));

        let p = parker.clone();
        let w = Arc::clone(&woken);
        let handle = thread::spawn(move || {
            p.park_timeout(Duration::from_secs(5));
            w.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(20));
        parker.unpark();
        handle.join().expect("parked thread joins");
        assert!(woken.load(Ordering::SeqCst));
    }

    #[test]
    fn clone_shares_permit_state() {
        let parker = Parker::new();
        let clone = parker.clone();
        assert!(parker.ptr_eq(&clone));
        clone.unpark();
        let start = Instant::now();
        parker.park_timeout(Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
