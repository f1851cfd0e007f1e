//! The reactor: a pool of worker threads, each running one [`SelectorLoop`]
//! around a single `mio::Poll`, plus one dedicated [`AcceptLoop`] per
//! listener (spec.md §2, §4.2).
//!
//! [`LoopHandle`] is the cross-thread face of a running loop. It is cheap to
//! clone and `Send + Sync`, and is the only way code outside the loop thread
//! (handler callbacks, the timer thread, other workers) may ask a loop to do
//! something: register a new source, queue an outbound write, or run a
//! closure on the loop thread. Every such request is queued and the loop is
//! woken via `mio::Waker`; nothing here ever touches the `mio::Poll` from
//! another thread.

pub mod accept_loop;
pub mod selector_loop;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mio::{Token, Waker};

pub use accept_loop::AcceptLoop;
pub use selector_loop::SelectorLoop;

/// A closure queued for execution on the owning loop thread: a deferred
/// task, a fired timer callback, or a handler-requested write flush.
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// A request to change a running loop's `mio::Registry` or connection
/// table. The loop thread owns the actual `mio::Registry`, all `Token`
/// assignments and the connection table; everyone else can only ask.
pub enum RegistrationRequest {
    /// Hand a freshly accepted or connected TCP connection to its owning
    /// loop, to be registered and inserted into the connection table.
    NewTcp(Box<crate::endpoint::tcp::TcpConn>),
    /// Hand a freshly bound UDP socket to its owning loop.
    NewUdp(Box<crate::endpoint::udp::UdpConn>),
    Reregister {
        token: Token,
        interest: mio::Interest,
    },
    Deregister {
        token: Token,
    },
    /// Accept-loop-only: start listening per the enclosed spec.
    AddListener(Box<accept_loop::PendingListener>),
    /// Accept-loop-only: stop and close a listener.
    RemoveListener(Token),
}

struct LoopShared {
    id: usize,
    waker: Waker,
    next_token: AtomicUsize,
    deferred: Mutex<Vec<DeferredTask>>,
    registrations: Mutex<Vec<RegistrationRequest>>,
    shutdown: AtomicBool,
}

/// Cheap, `Send + Sync` handle to a running [`SelectorLoop`] or
/// [`AcceptLoop`]. Endpoints, the timer thread and other workers hold this
/// instead of the loop itself.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Allocates a fresh `mio::Token`, unique within this loop.
    pub fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Queues `task` to run on the loop thread and wakes the loop so it
    /// runs promptly instead of waiting out the current poll timeout.
    pub fn invoke_later(&self, task: DeferredTask) {
        self.shared.deferred.lock().unwrap().push(task);
        let _ = self.shared.waker.wake();
    }

    /// Queues a registry change (new source, interest change, removal) to
    /// be applied on the loop thread before its next poll.
    pub fn request_registration(&self, request: RegistrationRequest) {
        self.shared.registrations.lock().unwrap().push(request);
        let _ = self.shared.waker.wake();
    }

    pub(crate) fn drain_deferred(&self) -> Vec<DeferredTask> {
        std::mem::take(&mut *self.shared.deferred.lock().unwrap())
    }

    pub(crate) fn drain_registrations(&self) -> Vec<RegistrationRequest> {
        std::mem::take(&mut *self.shared.registrations.lock().unwrap())
    }

    /// Asks the loop to stop after its current iteration; wakes it
    /// immediately rather than waiting out the poll timeout.
    pub fn request_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }
}

/// Token reserved for the loop's own `mio::Waker` registration; real sources
/// are allocated starting from [`FIRST_SOURCE_TOKEN`].
pub const WAKER_TOKEN: Token = Token(0);
pub const FIRST_SOURCE_TOKEN: usize = 1;

pub(crate) fn new_loop_handle(id: usize, poll: &mio::Poll) -> io::Result<LoopHandle> {
    let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
    Ok(LoopHandle {
        shared: Arc::new(LoopShared {
            id,
            waker,
            next_token: AtomicUsize::new(FIRST_SOURCE_TOKEN),
            deferred: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }),
    })
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::mpsc::{self, Receiver, Sender};

    /// A `LoopHandle` for unit tests that don't run a real `SelectorLoop`.
    /// `invoke_later` tasks are delivered over the returned channel instead
    /// of being executed, so a test can assert *that* a task was queued and
    /// then run it itself to assert *what* it does.
    pub fn noop_loop_handle() -> (LoopHandle, Receiver<DeferredTask>) {
        let poll = mio::Poll::new().expect("mio::Poll::new");
        let handle = new_loop_handle(0, &poll).expect("waker");
        let (tx, rx): (Sender<DeferredTask>, Receiver<DeferredTask>) = mpsc::channel();
        // Relay thread: forwards every deferred task posted to `handle`
        // onto `tx`, polling its own idle Poll just to keep `poll` (and so
        // the Waker registered against it) alive for the handle's lifetime.
        let relay_handle = handle.clone();
        std::thread::spawn(move || {
            let mut poll = poll;
            let mut events = mio::Events::with_capacity(4);
            loop {
                let _ = poll.poll(&mut events, Some(std::time::Duration::from_millis(20)));
                for task in relay_handle.drain_deferred() {
                    if tx.send(task).is_err() {
                        return;
                    }
                }
            }
        });
        (handle, rx)
    }
}
