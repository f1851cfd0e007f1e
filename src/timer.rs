//! A single background task scheduler shared by the whole [`crate::runtime::Runtime`].
//!
//! Deadlines are kept in a min-heap on one dedicated thread. When a deadline
//! fires, the timer thread never runs the callback itself — it hands the
//! callback to the endpoint's own [`crate::reactor::LoopHandle`] via
//! `invoke_later`, so the callback always runs on the owning worker thread
//! (spec.md §4.6).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::reactor::LoopHandle;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    target: LoopHandle,
    callback: Mutex<Option<Callback>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse so the BinaryHeap (a max-heap) pops the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<Arc<TimerEntry>>,
    shutdown: bool,
}

/// A cancellation handle returned by [`ScheduledTimer::schedule`].
///
/// Cancellation is idempotent and race-safe: if the timer has already fired
/// and enqueued its callback on the target loop, the callback checks the
/// same flag again immediately before running and becomes a no-op.
#[derive(Clone)]
pub struct TimerCancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerCancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The process's single background task scheduler.
pub struct ScheduledTimer {
    state: Arc<(Mutex<TimerState>, Condvar)>,
    seq: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTimer {
    pub fn start() -> Arc<ScheduledTimer> {
        let state = Arc::new((
            Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let worker_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("protonio-timer".into())
            .spawn(move || run(worker_state))
            .expect("failed to spawn timer thread");
        Arc::new(ScheduledTimer {
            state,
            seq: AtomicU64::new(0),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedules `callback` to run on `target`'s thread after `delay_ms`.
    pub fn schedule<F>(&self, target: LoopHandle, delay_ms: u64, callback: F) -> TimerCancelHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Arc::new(TimerEntry {
            deadline: Instant::now() + Duration::from_millis(delay_ms),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::clone(&cancelled),
            target,
            callback: Mutex::new(Some(Box::new(callback))),
        });
        let (lock, cvar) = &*self.state;
        {
            let mut state = lock.lock().unwrap();
            state.heap.push(entry);
        }
        cvar.notify_all();
        TimerCancelHandle { cancelled }
    }

    /// Drains pending timers and stops the background thread.
    pub fn shutdown(&self) {
        let (lock, cvar) = &*self.state;
        {
            let mut state = lock.lock().unwrap();
            state.shutdown = true;
            state.heap.clear();
        }
        cvar.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run(state: Arc<(Mutex<TimerState>, Condvar)>) {
    let (lock, cvar) = &*state;
    let mut guard = lock.lock().unwrap();
    loop {
        if guard.shutdown {
            return;
        }
        match guard.heap.peek() {
            None => {
                guard = cvar.wait(guard).unwrap();
            }
            Some(entry) => {
                let now = Instant::now();
                if entry.deadline <= now {
                    let entry = guard.heap.pop().unwrap();
                    if !entry.cancelled.load(Ordering::SeqCst) {
                        if let Some(callback) = entry.callback.lock().unwrap().take() {
                            let cancelled = Arc::clone(&entry.cancelled);
                            entry.target.invoke_later(Box::new(move || {
                                if !cancelled.load(Ordering::SeqCst) {
                                    callback();
                                }
                            }));
                        }
                    }
                } else {
                    let wait = entry.deadline - now;
                    let (new_guard, _timeout) = cvar.wait_timeout(guard, wait).unwrap();
                    guard = new_guard;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::test_support::noop_loop_handle;
    use std::sync::mpsc;

    #[test]
    fn fires_after_delay_on_target_loop() {
        let timer = ScheduledTimer::start();
        let (handle, rx) = noop_loop_handle();
        let (tx, fired) = mpsc::channel();
        timer.schedule(handle.clone(), 10, move || {
            tx.send(()).unwrap();
        });
        // The timer thread hands the callback to the loop via invoke_later;
        // pump the fake loop's deferred queue until it shows up.
        let task = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        task();
        fired.recv_timeout(Duration::from_millis(50)).unwrap();
        timer.shutdown();
    }

    #[test]
    fn cancel_before_fire_suppresses_callback() {
        let timer = ScheduledTimer::start();
        let (handle, rx) = noop_loop_handle();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let cancel = timer.schedule(handle, 200, move || {
            fired2.store(true, Ordering::SeqCst);
        });
        cancel.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
        assert!(!fired.load(Ordering::SeqCst));
        timer.shutdown();
    }
}
