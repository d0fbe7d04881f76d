//! Completion tracker shared by every physical submission of one logical I/O.
//!
//! The owner ([`IoTracker`]) holds the initial reference. Each physical
//! submission takes an [`IoRef`] before it is issued and releases it exactly
//! once on completion. The first non-zero status wins. When the last
//! reference goes away the tracker resolves: a synchronous tracker wakes its
//! waiter, an asynchronous one runs its callback on the releasing thread.

use fc_error::{Errno, IoStatus};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::trace;

type Callback = Box<dyn FnOnce(IoStatus) + Send + 'static>;

enum Notify {
    Wait { done: Mutex<bool>, cond: Condvar },
    Callback(Mutex<Option<Callback>>),
}

struct Inner {
    count: AtomicUsize,
    error: AtomicI32,
    notify: Notify,
}

impl Inner {
    fn record(&self, status: IoStatus) {
        if let Err(errno) = status {
            // First error wins; later errors are dropped.
            let _ = self
                .error
                .compare_exchange(0, errno.get(), Ordering::AcqRel, Ordering::Acquire);
        }
    }

    fn status(&self) -> IoStatus {
        match self.error.load(Ordering::Acquire) {
            0 => Ok(()),
            e => Err(Errno(e)),
        }
    }

    fn put(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.resolve();
        }
    }

    fn resolve(&self) {
        let status = self.status();
        trace!(target: "fc::tracker", ok = status.is_ok(), "tracker_resolved");
        match &self.notify {
            Notify::Wait { done, cond } => {
                *done.lock() = true;
                cond.notify_all();
            }
            Notify::Callback(slot) => {
                let callback = slot.lock().take();
                if let Some(callback) = callback {
                    callback(status);
                }
            }
        }
    }
}

/// Owner handle of a completion tracker.
pub struct IoTracker {
    inner: Option<Arc<Inner>>,
}

impl IoTracker {
    /// Tracker resolved by [`IoTracker::wait`].
    #[must_use]
    pub fn sync() -> Self {
        Self::with_notify(Notify::Wait {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// Tracker that runs `callback` once every submission has completed.
    #[must_use]
    pub fn with_callback(callback: impl FnOnce(IoStatus) + Send + 'static) -> Self {
        Self::with_notify(Notify::Callback(Mutex::new(Some(Box::new(callback)))))
    }

    fn with_notify(notify: Notify) -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                count: AtomicUsize::new(1),
                error: AtomicI32::new(0),
                notify,
            })),
        }
    }

    fn inner(&self) -> &Arc<Inner> {
        match &self.inner {
            Some(inner) => inner,
            None => unreachable!("tracker used after release"),
        }
    }

    /// Reference for one physical submission. Take it before issuing.
    #[must_use]
    pub fn get(&self) -> IoRef {
        let inner = Arc::clone(self.inner());
        inner.count.fetch_add(1, Ordering::AcqRel);
        IoRef {
            inner: Some(inner),
        }
    }

    /// Outstanding references, including the owner's.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner().count.load(Ordering::Acquire)
    }

    /// Drop the owner's reference and block until every submission has
    /// completed. Asynchronous trackers return immediately after release.
    pub fn wait(mut self) -> IoStatus {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        inner.put();
        if let Notify::Wait { done, cond } = &inner.notify {
            let mut done = done.lock();
            while !*done {
                cond.wait(&mut done);
            }
        }
        inner.status()
    }

    /// Drop the owner's reference. On an asynchronous tracker the callback
    /// runs when the last submission completes, possibly right here.
    pub fn submit(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.put();
        }
    }

    /// Give up after a partial submission: wait (polling every `poll`) until
    /// every already-issued part has completed, then release the tracker
    /// without resolving it. Returns the aggregated status of those parts.
    pub fn abort(mut self, poll: Duration) -> IoStatus {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        while inner.count.load(Ordering::Acquire) > 1 {
            std::thread::sleep(poll);
        }
        inner.status()
    }
}

impl Drop for IoTracker {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.put();
        }
    }
}

impl std::fmt::Debug for IoTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("IoTracker");
        if let Some(inner) = &self.inner {
            d.field("count", &inner.count.load(Ordering::Relaxed))
                .field("error", &inner.error.load(Ordering::Relaxed));
        }
        d.finish_non_exhaustive()
    }
}

/// One physical submission's share of a tracker.
///
/// Dropping an unfinished reference records `EIO`.
pub struct IoRef {
    inner: Option<Arc<Inner>>,
}

impl IoRef {
    pub fn finish(mut self, status: IoStatus) {
        if let Some(inner) = self.inner.take() {
            inner.record(status);
            inner.put();
        }
    }
}

impl Drop for IoRef {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.record(Err(Errno::EIO));
            inner.put();
        }
    }
}

impl std::fmt::Debug for IoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRef").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn sync_wait_blocks_until_last_completion() {
        let tracker = IoTracker::sync();
        let refs: Vec<IoRef> = (0..4).map(|_| tracker.get()).collect();
        assert_eq!(tracker.outstanding(), 5);

        let finisher = thread::spawn(move || {
            for (i, r) in refs.into_iter().enumerate() {
                thread::sleep(Duration::from_millis(2));
                r.finish(if i == 2 { Err(Errno::EIO) } else { Ok(()) });
            }
        });
        assert_eq!(tracker.wait(), Err(Errno::EIO));
        finisher.join().expect("join");
    }

    #[test]
    fn first_error_wins() {
        let tracker = IoTracker::sync();
        let a = tracker.get();
        let b = tracker.get();
        a.finish(Err(Errno::ENOMEM));
        b.finish(Err(Errno::EIO));
        assert_eq!(tracker.wait(), Err(Errno::ENOMEM));
    }

    #[test]
    fn callback_runs_once_after_owner_and_parts_release() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let tracker = IoTracker::with_callback(move |status| {
            assert_eq!(status, Ok(()));
            f.fetch_add(1, Ordering::SeqCst);
        });
        let part = tracker.get();
        tracker.submit();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        part.finish(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_fires_inline_when_nothing_outstanding() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        let tracker = IoTracker::with_callback(move |_| f.store(true, Ordering::SeqCst));
        tracker.submit();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn abort_waits_for_issued_parts_without_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        let tracker = IoTracker::with_callback(move |_| f.store(true, Ordering::SeqCst));
        let part = tracker.get();
        let done = Arc::new(AtomicBool::new(false));
        let d = Arc::clone(&done);
        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            d.store(true, Ordering::SeqCst);
            part.finish(Err(Errno::EIO));
        });
        let status = tracker.abort(Duration::from_millis(1));
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(status, Err(Errno::EIO));
        assert!(!fired.load(Ordering::SeqCst));
        finisher.join().expect("join");
    }

    #[test]
    fn dropped_ref_counts_as_eio() {
        let tracker = IoTracker::sync();
        drop(tracker.get());
        assert_eq!(tracker.wait(), Err(Errno::EIO));
    }
}
