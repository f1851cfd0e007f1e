//! The accept thread: one `mio::Poll`, one or more listening sockets, no
//! per-connection state (spec.md §4.5).
//!
//! Every accepted connection is policy-filtered, given a freshly
//! constructed [`Handler`] and [`Shared`] (with its `TlsSession`
//! constructed immediately if the listener is configured secure), placed
//! on a worker loop chosen round-robin by the caller-supplied `pick_worker`
//! closure, and handed off via [`RegistrationRequest::NewTcp`].

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::endpoint::tcp::{Stream, TcpConn};
use crate::endpoint::{EndpointRef, Role, SharedBuilder};
use crate::handler::ConnectionFactory;
use crate::listener::{AcceptPolicy, PolicyDecision};
use crate::reactor::{new_loop_handle, LoopHandle, RegistrationRequest};
use crate::runtime::Runtime;
use crate::timer::ScheduledTimer;
use crate::transport::TransportFactory;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub(crate) enum AddrSource {
    Tcp(mio::net::TcpListener),
    #[cfg(unix)]
    Unix(mio::net::UnixListener),
}

impl AddrSource {
    /// The bound TCP address, if this is a TCP listener (used to report the
    /// real port back to the caller when `bind_addr` asked for port 0).
    pub(crate) fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            AddrSource::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            AddrSource::Unix(_) => None,
        }
    }
}

/// A listener bind request queued for the accept loop via
/// [`RegistrationRequest::AddListener`].
pub struct PendingListener {
    pub(crate) token: Token,
    pub(crate) source: AddrSource,
    pub(crate) policy: Arc<AcceptPolicy>,
    pub(crate) connection_factory: Arc<dyn ConnectionFactory>,
    pub(crate) transport_factory: Option<Arc<TransportFactory>>,
    pub(crate) immediately_secure: bool,
    pub(crate) max_net_in_size: usize,
    pub(crate) idle_timeout_ms: Option<u64>,
    pub(crate) read_timeout_ms: Option<u64>,
    pub(crate) timer: Arc<ScheduledTimer>,
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) pick_worker: Arc<dyn Fn() -> LoopHandle + Send + Sync>,
}

struct ListenerSlot {
    source: AddrSource,
    policy: Arc<AcceptPolicy>,
    connection_factory: Arc<dyn ConnectionFactory>,
    transport_factory: Option<Arc<TransportFactory>>,
    immediately_secure: bool,
    max_net_in_size: usize,
    idle_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    timer: Arc<ScheduledTimer>,
    runtime: Arc<Runtime>,
    pick_worker: Arc<dyn Fn() -> LoopHandle + Send + Sync>,
}

/// One thread, one `mio::Poll`, no per-connection state.
pub struct AcceptLoop {
    poll: Poll,
    events: Events,
    handle: LoopHandle,
    listeners: HashMap<Token, ListenerSlot>,
}

impl AcceptLoop {
    pub fn new() -> io::Result<AcceptLoop> {
        let poll = Poll::new()?;
        let handle = new_loop_handle(usize::MAX, &poll)?;
        Ok(AcceptLoop {
            poll,
            events: Events::with_capacity(256),
            handle,
            listeners: HashMap::new(),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn spawn() -> io::Result<LoopHandle> {
        let mut loop_ = AcceptLoop::new()?;
        let handle = loop_.handle();
        std::thread::Builder::new()
            .name("protonio-accept".into())
            .spawn(move || loop_.run())?;
        Ok(handle)
    }

    pub fn run(&mut self) {
        loop {
            self.apply_registrations();
            let deferred = self.handle.drain_deferred();
            for task in deferred {
                task();
            }

            if self.handle.shutdown_requested() {
                return;
            }

            if let Err(e) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("accept loop poll failed: {e}");
                return;
            }

            let ready: Vec<Token> = self
                .events
                .iter()
                .filter(|ev| ev.token() != crate::reactor::WAKER_TOKEN)
                .map(|ev| ev.token())
                .collect();
            for token in ready {
                self.accept_all(token);
            }
        }
    }

    fn apply_registrations(&mut self) {
        for request in self.handle.drain_registrations() {
            match request {
                RegistrationRequest::AddListener(pending) => self.add_listener(*pending),
                RegistrationRequest::RemoveListener(token) => self.remove_listener(token),
                _ => log::warn!("accept loop received a worker-only registration request"),
            }
        }
    }

    fn add_listener(&mut self, pending: PendingListener) {
        let token = pending.token;
        let mut slot = ListenerSlot {
            source: pending.source,
            policy: pending.policy,
            connection_factory: pending.connection_factory,
            transport_factory: pending.transport_factory,
            immediately_secure: pending.immediately_secure,
            max_net_in_size: pending.max_net_in_size,
            idle_timeout_ms: pending.idle_timeout_ms,
            read_timeout_ms: pending.read_timeout_ms,
            timer: pending.timer,
            runtime: pending.runtime,
            pick_worker: pending.pick_worker,
        };
        let result = match &mut slot.source {
            AddrSource::Tcp(listener) => self.poll.registry().register(listener, token, Interest::READABLE),
            #[cfg(unix)]
            AddrSource::Unix(listener) => self.poll.registry().register(listener, token, Interest::READABLE),
        };
        match result {
            Ok(()) => {
                log::info!("listener registered at token {token:?}");
                self.listeners.insert(token, slot);
            }
            Err(e) => log::error!("failed to register listener: {e}"),
        }
    }

    fn remove_listener(&mut self, token: Token) {
        if let Some(mut slot) = self.listeners.remove(&token) {
            let result = match &mut slot.source {
                AddrSource::Tcp(listener) => self.poll.registry().deregister(listener),
                #[cfg(unix)]
                AddrSource::Unix(listener) => self.poll.registry().deregister(listener),
            };
            if let Err(e) = result {
                log::warn!("failed to deregister listener {token:?}: {e}");
            }
        }
    }

    fn accept_all(&mut self, token: Token) {
        let Some(slot) = self.listeners.get_mut(&token) else { return };
        loop {
            match accept_one(slot) {
                Ok(AcceptOutcome::Accepted(conn)) => {
                    let worker = (slot.pick_worker)();
                    worker.request_registration(RegistrationRequest::NewTcp(Box::new(conn)));
                }
                Ok(AcceptOutcome::Deferred) => {}
                Ok(AcceptOutcome::Rejected) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}

fn arm_timeouts(endpoint: &crate::endpoint::EndpointRef, idle_timeout_ms: Option<u64>, read_timeout_ms: Option<u64>) {
    if let Some(idle_ms) = idle_timeout_ms {
        crate::endpoint::arm_idle_timeout(endpoint.clone(), idle_ms);
    }
    if let Some(read_ms) = read_timeout_ms {
        crate::endpoint::arm_read_timeout(endpoint.clone(), read_ms);
    }
}

/// What `accept_one` did with one pending connection.
enum AcceptOutcome {
    /// Built on the accept thread; the caller still owes registration.
    Accepted(TcpConn),
    /// A secure listener: endpoint and handler construction was queued onto
    /// the assigned worker via `invoke_later` (spec.md §4.2's "per-connection
    /// setup work runs on the owning loop"), which also requests its own
    /// registration once built.
    Deferred,
    /// The policy filter rejected this connection; already closed.
    Rejected,
}

/// Accepts one connection and runs the policy filter. For a plaintext
/// listener, `Endpoint`/`Handler` construction happens here, on the accept
/// thread, since it is cheap. For a secure listener, that construction
/// (cert parsing, `rustls::ServerConnection` setup) is deferred onto the
/// assigned worker loop instead of serializing it behind this one thread.
fn accept_one(slot: &mut ListenerSlot) -> io::Result<AcceptOutcome> {
    match &mut slot.source {
        AddrSource::Tcp(listener) => {
            let (stream, remote) = listener.accept()?;
            match slot.policy.evaluate(remote) {
                PolicyDecision::Reject(reason) => {
                    log::debug!("rejected connection from {remote}: {reason}");
                    drop(stream);
                    return Ok(AcceptOutcome::Rejected);
                }
                PolicyDecision::Accept => {}
            }
            slot.policy.note_accepted(remote);
            let local = listener.local_addr().ok();
            let worker = (slot.pick_worker)();
            let token = worker.next_token();

            if slot.immediately_secure {
                let policy = Arc::clone(&slot.policy);
                let connection_factory = Arc::clone(&slot.connection_factory);
                let transport_factory = slot.transport_factory.clone();
                let timer = Arc::clone(&slot.timer);
                let runtime = Arc::clone(&slot.runtime);
                let max_net_in_size = slot.max_net_in_size;
                let idle_timeout_ms = slot.idle_timeout_ms;
                let read_timeout_ms = slot.read_timeout_ms;
                let deferred_worker = worker.clone();
                worker.invoke_later(Box::new(move || {
                    let shared = SharedBuilder {
                        role: Role::Server,
                        local_addr: local,
                        remote_addr: Some(remote),
                        loop_handle: deferred_worker.clone(),
                        token,
                        factory: transport_factory,
                        timer,
                        immediately_secure: true,
                        owner: Some(runtime),
                    }
                    .build();
                    let shared = match shared {
                        Ok(shared) => shared,
                        Err(e) => {
                            log::error!("failed to build secure endpoint for {remote}: {e}");
                            return;
                        }
                    };
                    let endpoint = EndpointRef::new(shared);
                    arm_timeouts(&endpoint, idle_timeout_ms, read_timeout_ms);
                    let handler = connection_factory.new_handler(remote);
                    let conn = TcpConn::new(token, Stream::Tcp(stream), endpoint, handler, Role::Server, max_net_in_size)
                        .with_accept_policy(policy, remote);
                    deferred_worker.request_registration(RegistrationRequest::NewTcp(Box::new(conn)));
                }));
                return Ok(AcceptOutcome::Deferred);
            }

            let shared = SharedBuilder {
                role: Role::Server,
                local_addr: local,
                remote_addr: Some(remote),
                loop_handle: worker.clone(),
                token,
                factory: slot.transport_factory.clone(),
                timer: Arc::clone(&slot.timer),
                immediately_secure: false,
                owner: Some(Arc::clone(&slot.runtime)),
            }
            .build()
            .map_err(|e| io::Error::other(e.to_string()))?;
            let endpoint = EndpointRef::new(shared);
            arm_timeouts(&endpoint, slot.idle_timeout_ms, slot.read_timeout_ms);
            let handler = slot.connection_factory.new_handler(remote);
            let conn = TcpConn::new(token, Stream::Tcp(stream), endpoint, handler, Role::Server, slot.max_net_in_size)
                .with_accept_policy(Arc::clone(&slot.policy), remote);
            Ok(AcceptOutcome::Accepted(conn))
        }
        #[cfg(unix)]
        AddrSource::Unix(listener) => {
            let (stream, _) = listener.accept()?;
            let worker = (slot.pick_worker)();
            let token = worker.next_token();

            if slot.immediately_secure {
                let connection_factory = Arc::clone(&slot.connection_factory);
                let transport_factory = slot.transport_factory.clone();
                let timer = Arc::clone(&slot.timer);
                let runtime = Arc::clone(&slot.runtime);
                let max_net_in_size = slot.max_net_in_size;
                let idle_timeout_ms = slot.idle_timeout_ms;
                let read_timeout_ms = slot.read_timeout_ms;
                let deferred_worker = worker.clone();
                worker.invoke_later(Box::new(move || {
                    let shared = SharedBuilder {
                        role: Role::Server,
                        local_addr: None,
                        remote_addr: None,
                        loop_handle: deferred_worker.clone(),
                        token,
                        factory: transport_factory,
                        timer,
                        immediately_secure: true,
                        owner: Some(runtime),
                    }
                    .build();
                    let shared = match shared {
                        Ok(shared) => shared,
                        Err(e) => {
                            log::error!("failed to build secure endpoint for unix accept: {e}");
                            return;
                        }
                    };
                    let endpoint = EndpointRef::new(shared);
                    arm_timeouts(&endpoint, idle_timeout_ms, read_timeout_ms);
                    let handler = connection_factory.new_handler("0.0.0.0:0".parse().unwrap());
                    let conn = TcpConn::new(token, Stream::Unix(stream), endpoint, handler, Role::Server, max_net_in_size);
                    deferred_worker.request_registration(RegistrationRequest::NewTcp(Box::new(conn)));
                }));
                return Ok(AcceptOutcome::Deferred);
            }

            let shared = SharedBuilder {
                role: Role::Server,
                local_addr: None,
                remote_addr: None,
                loop_handle: worker.clone(),
                token,
                factory: slot.transport_factory.clone(),
                timer: Arc::clone(&slot.timer),
                immediately_secure: false,
                owner: Some(Arc::clone(&slot.runtime)),
            }
            .build()
            .map_err(|e| io::Error::other(e.to_string()))?;
            let endpoint = EndpointRef::new(shared);
            arm_timeouts(&endpoint, slot.idle_timeout_ms, slot.read_timeout_ms);
            let handler = slot
                .connection_factory
                .new_handler("0.0.0.0:0".parse().unwrap());
            let conn = TcpConn::new(token, Stream::Unix(stream), endpoint, handler, Role::Server, slot.max_net_in_size);
            Ok(AcceptOutcome::Accepted(conn))
        }
    }
}
