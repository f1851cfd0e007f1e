//! The process-wide lifecycle manager: the worker pool, the accept loop,
//! the shared timer, and the set of live listeners and endpoints
//! (spec.md §2, §4.1).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use mio::Token;

use crate::endpoint::EndpointId;
use crate::error::{Error, Result};
use crate::handler::{ConnectionFactory, DatagramFactory};
use crate::listener::{AcceptPolicy, ListenerConfig};
use crate::reactor::accept_loop::{AddrSource, PendingListener};
use crate::reactor::{AcceptLoop, LoopHandle, RegistrationRequest, SelectorLoop};
use crate::service::Service;
use crate::timer::{ScheduledTimer, TimerCancelHandle};
use crate::transport::TransportFactory;

/// Worker pool sizing and startup options (spec.md §4.1's defaulting
/// policy: 1 worker in client-only mode, `2 * num_cpus` in server mode).
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    pub worker_threads: Option<usize>,
    pub server_mode: bool,
}

impl RuntimeConfig {
    fn resolve_worker_count(&self) -> usize {
        if let Some(n) = self.worker_threads {
            return n.max(1);
        }
        if !self.server_mode {
            return 1;
        }
        2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

/// A token identifying a live listener for [`Runtime::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Token);

/// What [`Runtime::add_listener`] hands back: the id needed to remove the
/// listener later, and the address it actually bound (useful when
/// `bind_addr`'s port was 0 and the OS picked one).
#[derive(Debug, Clone, Copy)]
pub struct BoundListener {
    pub id: ListenerId,
    pub local_addr: Option<SocketAddr>,
}

/// The process's central lifecycle manager. Owns the worker pool, the
/// accept loop's handle, the shared [`ScheduledTimer`], and bookkeeping for
/// live listeners/endpoints/services; `shutdown` tears all of it down in
/// the order spec.md §5 requires (cancel accept, drain workers, close
/// listeners, cancel timers).
pub struct Runtime {
    workers: Vec<LoopHandle>,
    accept: LoopHandle,
    timer: Arc<ScheduledTimer>,
    next_worker: AtomicUsize,
    active_endpoints: Mutex<HashSet<EndpointId>>,
    listeners: Mutex<HashSet<Token>>,
    services: Mutex<Vec<Box<dyn Service>>>,
    shutdown: AtomicBool,
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

impl Runtime {
    /// Starts the default, process-wide runtime, or returns the one already
    /// running. Most embedders only ever call this.
    pub fn global() -> Result<Arc<Runtime>> {
        if let Some(rt) = GLOBAL.get() {
            return Ok(Arc::clone(rt));
        }
        let rt = Runtime::start(RuntimeConfig::default())?;
        Ok(Arc::clone(GLOBAL.get_or_init(|| rt)))
    }

    /// Starts an independent runtime that never touches the process-wide
    /// singleton, for tests that need a fresh worker pool per case.
    pub fn new_isolated(config: RuntimeConfig) -> Result<Arc<Runtime>> {
        Runtime::start(config)
    }

    fn start(config: RuntimeConfig) -> Result<Arc<Runtime>> {
        let worker_count = config.resolve_worker_count();
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let handle = SelectorLoop::spawn(id, format!("protonio-worker-{id}"))
                .map_err(|e| Error::config(format!("failed to start worker {id}: {e}")))?;
            workers.push(handle);
        }
        let accept = AcceptLoop::spawn().map_err(|e| Error::config(format!("failed to start accept loop: {e}")))?;
        let timer = ScheduledTimer::start();
        log::info!("runtime started with {worker_count} worker(s)");
        Ok(Arc::new(Runtime {
            workers,
            accept,
            timer,
            next_worker: AtomicUsize::new(0),
            active_endpoints: Mutex::new(HashSet::new()),
            listeners: Mutex::new(HashSet::new()),
            services: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Picks the next worker loop round-robin (spec.md §4.1, §4.5).
    pub fn next_worker_loop(&self) -> LoopHandle {
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx].clone()
    }

    pub fn schedule_timer<F>(&self, target: LoopHandle, delay_ms: u64, callback: F) -> TimerCancelHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.timer.schedule(target, delay_ms, callback)
    }

    pub(crate) fn register_active_endpoint(&self, id: EndpointId) {
        self.active_endpoints.lock().unwrap().insert(id);
    }

    pub(crate) fn unregister_active_endpoint(&self, id: EndpointId) {
        self.active_endpoints.lock().unwrap().remove(&id);
        self.maybe_auto_shutdown();
    }

    /// Shuts the runtime down once it has no listener, service or active
    /// endpoint left (spec.md §4.1, §9). Only ever consulted from a
    /// deregistration path, so a runtime that has never had anything added
    /// to it is never mistaken for one that has drained.
    fn maybe_auto_shutdown(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let listeners_empty = self.listeners.lock().unwrap().is_empty();
        let services_empty = self.services.lock().unwrap().is_empty();
        let endpoints_empty = self.active_endpoints.lock().unwrap().is_empty();
        if listeners_empty && services_empty && endpoints_empty {
            log::info!("runtime auto-shutdown: no listeners, services or active endpoints remain");
            self.shutdown();
        }
    }

    /// Registers a service; `Service::on_start` is called immediately with
    /// this runtime so it can add its own listeners. A failing `on_start`
    /// is logged and does not prevent other services from starting
    /// (spec.md §4.1's log-and-continue policy).
    pub fn add_service(self: &Arc<Self>, mut service: Box<dyn Service>) -> Result<()> {
        if let Err(e) = service.on_start(self) {
            log::error!("service failed to start: {e}");
        }
        self.services.lock().unwrap().push(service);
        Ok(())
    }

    /// Binds and registers a TCP or Unix-domain listener per `config`,
    /// filtering accepted connections through its [`AcceptPolicy`] and
    /// handing each surviving connection to `connection_factory`.
    pub fn add_listener(
        self: &Arc<Self>,
        config: ListenerConfig,
        connection_factory: Arc<dyn ConnectionFactory>,
    ) -> Result<BoundListener> {
        let transport_factory = Arc::new(TransportFactory::new(config.transport.clone())?);
        let policy = AcceptPolicy::from_config(&config)?;
        let source = bind_source(&config)?;
        let local_addr = source.local_addr();
        let token = self.accept.next_token();
        let immediately_secure = transport_factory.is_secure() && !config.starttls;
        let max_net_in_size = transport_factory.max_net_in_size();

        let runtime = Arc::clone(self);
        let pick_worker: Arc<dyn Fn() -> LoopHandle + Send + Sync> = Arc::new(move || runtime.next_worker_loop());

        let pending = PendingListener {
            token,
            source,
            policy,
            connection_factory,
            transport_factory: Some(transport_factory),
            immediately_secure,
            max_net_in_size,
            idle_timeout_ms: config.idle_timeout_ms,
            read_timeout_ms: config.read_timeout_ms,
            timer: Arc::clone(&self.timer),
            runtime: Arc::clone(self),
            pick_worker,
        };
        self.listeners.lock().unwrap().insert(token);
        self.accept.request_registration(RegistrationRequest::AddListener(Box::new(pending)));
        log::info!("listener queued for bind at token {token:?}");
        Ok(BoundListener {
            id: ListenerId(token),
            local_addr,
        })
    }

    /// Stops and closes a previously added listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().remove(&id.0);
        self.accept.request_registration(RegistrationRequest::RemoveListener(id.0));
        self.maybe_auto_shutdown();
    }

    /// Initiates an outbound TCP connection (spec.md §1). The socket is
    /// connected non-blockingly; `handler` receives `on_connected` once the
    /// first writable event confirms the connect succeeded, or
    /// `on_connect_failed` if it didn't. `transport_factory` is required
    /// only if the caller intends to call `EndpointRef::start_tls` later,
    /// or wants the connection secured immediately via
    /// `immediately_secure`.
    pub fn connect_tcp(
        self: &Arc<Self>,
        addr: SocketAddr,
        handler: Box<dyn crate::handler::Handler>,
        transport_factory: Option<Arc<TransportFactory>>,
        immediately_secure: bool,
        connection_timeout_ms: Option<u64>,
    ) -> Result<crate::endpoint::EndpointRef> {
        let stream = mio::net::TcpStream::connect(addr).map_err(|e| Error::connect_error(addr, e))?;
        let local_addr = stream.local_addr().ok();
        let worker = self.next_worker_loop();
        let token = worker.next_token();
        let max_net_in_size = transport_factory
            .as_ref()
            .map(|f| f.max_net_in_size())
            .unwrap_or(crate::transport::DEFAULT_MAX_NET_IN_SIZE);
        let shared = crate::endpoint::SharedBuilder {
            role: crate::endpoint::Role::Client,
            local_addr,
            remote_addr: Some(addr),
            loop_handle: worker.clone(),
            token,
            factory: transport_factory,
            timer: Arc::clone(&self.timer),
            immediately_secure,
            owner: Some(Arc::clone(self)),
        }
        .build()?;
        let endpoint = crate::endpoint::EndpointRef::new(shared);
        let conn = crate::endpoint::tcp::TcpConn::new(
            token,
            crate::endpoint::tcp::Stream::Tcp(stream),
            endpoint.clone(),
            handler,
            crate::endpoint::Role::Client,
            max_net_in_size,
        );
        worker.request_registration(RegistrationRequest::NewTcp(Box::new(conn)));
        if let Some(timeout_ms) = connection_timeout_ms {
            crate::endpoint::arm_read_timeout(endpoint.clone(), timeout_ms);
        }
        Ok(endpoint)
    }

    /// Binds a UDP socket and hands it to a worker loop, wrapped by a
    /// fresh [`crate::handler::DatagramHandler`] from `factory`.
    pub fn bind_udp(
        &self,
        bind_addr: SocketAddr,
        factory: Arc<dyn DatagramFactory>,
    ) -> Result<crate::handler::UdpEndpointRef> {
        let socket = mio::net::UdpSocket::bind(bind_addr)
            .map_err(|e| Error::transport_io(Some(bind_addr), e))?;
        let local_addr = socket.local_addr().ok();
        let worker = self.next_worker_loop();
        let token = worker.next_token();
        let id = EndpointId::next();
        let shared = crate::endpoint::udp::UdpShared::new(id, local_addr, worker.clone(), token);
        let handler = factory.new_handler();
        let conn = crate::endpoint::udp::UdpConn::new(token, socket, Arc::clone(&shared), handler);
        worker.request_registration(RegistrationRequest::NewUdp(Box::new(conn)));
        Ok(crate::handler::UdpEndpointRef { shared })
    }

    /// Cancels the accept loop, drains and stops every worker, and cancels
    /// all pending timers, in that order (spec.md §5).
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("runtime shutting down");
        self.accept.request_shutdown();
        for worker in &self.workers {
            worker.request_shutdown();
        }
        self.timer.shutdown();
    }

    /// Blocks until every worker thread has exited. Intended to be called
    /// after `shutdown()` by the thread that owns process lifetime.
    pub fn join(&self) {
        // Worker/accept threads are detached at spawn time (mio::Poll has
        // no join-friendly handle once passed to `std::thread::Builder`),
        // so this waits out the same poll-timeout granularity the loops
        // themselves use to notice a shutdown request.
        while !self.workers_are_idle() {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }

    fn workers_are_idle(&self) -> bool {
        self.active_endpoints.lock().unwrap().is_empty()
    }
}

fn bind_source(config: &ListenerConfig) -> Result<AddrSource> {
    #[cfg(unix)]
    if let Some(path) = &config.unix_socket_path {
        let listener = mio::net::UnixListener::bind(path)
            .map_err(|e| Error::config(format!("binding unix socket {}: {e}", path.display())))?;
        return Ok(AddrSource::Unix(listener));
    }
    let addr = config
        .bind_addr
        .ok_or_else(|| Error::config("ListenerConfig has neither bind_addr nor unix_socket_path set"))?;
    let listener =
        mio::net::TcpListener::bind(addr).map_err(|e| Error::transport_io(Some(addr), e))?;
    Ok(AddrSource::Tcp(listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_defaults_to_one_outside_server_mode() {
        let config = RuntimeConfig::default();
        assert_eq!(config.resolve_worker_count(), 1);
    }

    #[test]
    fn worker_count_honors_explicit_override() {
        let config = RuntimeConfig {
            worker_threads: Some(4),
            server_mode: true,
        };
        assert_eq!(config.resolve_worker_count(), 4);
    }

    #[test]
    fn next_worker_loop_cycles_round_robin() {
        let rt = Runtime::new_isolated(RuntimeConfig {
            worker_threads: Some(3),
            server_mode: true,
        })
        .unwrap();
        let ids: Vec<usize> = (0..6).map(|_| rt.next_worker_loop().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
        rt.shutdown();
    }
}
