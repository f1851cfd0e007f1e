//! The transport-agnostic `Endpoint` abstraction (spec.md §3, §4.3).
//!
//! An endpoint is split into two parts, matching the ownership invariant in
//! spec.md §3 ("owned by exactly one `SelectorLoop` ... except for
//! concurrent append to the outgoing buffer"):
//!
//! - [`Shared`] (behind `Arc`): state any thread may touch — the outgoing
//!   buffer and TLS engine (one `Mutex` guarding both, per the buffer-lock
//!   rule), lifecycle flags, timestamps, and the loop handle used to ask the
//!   owning `SelectorLoop` to do something.
//! - A loop-local record (`tcp::TcpConn`, `udp::UdpConn`) owned exclusively
//!   by the owning loop's connection table: the `mio` socket, the
//!   incoming buffer, the registration `Token`, and the handler.
//!
//! [`EndpointRef`] is the cheap, cloneable, `Send + Sync` handle protocol
//! handlers hold; it only ever touches [`Shared`].

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mio::Token;

use crate::buffer::NetBuffer;
use crate::clock::now_millis;
use crate::error::{Error, Result};
use crate::reactor::{LoopHandle, RegistrationRequest};
use crate::timer::{ScheduledTimer, TimerCancelHandle};
use crate::tls::{SecurityInfo, TlsSession};
use crate::transport::TransportFactory;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for an endpoint, unique for the process's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    pub(crate) fn next() -> EndpointId {
        EndpointId(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Whether a stream endpoint was accepted by a listener or initiated by an
/// outbound connect, per spec.md §3 ("client or server role").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The outgoing buffer and TLS engine, guarded by one lock per the
/// buffer-lock concurrency rule: both `send` (handler thread) and
/// `process_inbound` (loop thread, which may need to emit handshake
/// records) mutate the same TLS engine.
pub(crate) struct Outgoing {
    pub(crate) buffer: NetBuffer,
    pub(crate) tls: Option<TlsSession>,
}

/// Cross-thread endpoint state. Lives behind `Arc`; the loop-local record
/// holds one reference, every [`EndpointRef`] holds another.
pub(crate) struct Shared {
    id: EndpointId,
    role: Role,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    loop_handle: LoopHandle,
    token: Token,
    factory: Option<Arc<TransportFactory>>,
    timer: Arc<ScheduledTimer>,

    outgoing: Mutex<Outgoing>,
    security_info: Mutex<Option<SecurityInfo>>,
    tls_upgraded: AtomicBool,
    closing: AtomicBool,
    close_requested: AtomicBool,

    created_ms: AtomicI64,
    last_activity_ms: AtomicI64,

    /// Present whenever this endpoint was constructed through a
    /// [`crate::runtime::Runtime`] (accept or `connect_tcp`), so the
    /// runtime's live-endpoint set (spec.md §4.1's
    /// `register_active_endpoint`/`unregister_active_endpoint`) stays
    /// accurate without every call site remembering to unregister by hand.
    owner: Option<Arc<crate::runtime::Runtime>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(runtime) = &self.owner {
            runtime.unregister_active_endpoint(self.id);
        }
    }
}

/// The handle protocol handlers and timer callbacks hold. Cheap to clone,
/// `Send + Sync`; every method that touches the network only ever appends to
/// the shared outgoing buffer and asks the owning loop to flush it.
#[derive(Clone)]
pub struct EndpointRef {
    shared: Arc<Shared>,
}

impl EndpointRef {
    pub(crate) fn new(shared: Arc<Shared>) -> EndpointRef {
        EndpointRef { shared }
    }

    pub fn id(&self) -> EndpointId {
        self.shared.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    pub fn is_secure(&self) -> bool {
        self.shared.factory.as_ref().is_some_and(|f| f.is_secure())
            && self.shared.tls_upgraded.load(Ordering::SeqCst)
    }

    /// Negotiated TLS parameters, once the handshake has completed.
    pub fn security_info(&self) -> Option<SecurityInfo> {
        self.shared.security_info.lock().unwrap().clone()
    }

    /// A handle for scheduling work on this endpoint's own loop thread,
    /// per spec.md §4.6 ("callback delivery on the endpoint's own loop").
    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            loop_handle: self.shared.loop_handle.clone(),
            timer: Arc::clone(&self.shared.timer),
        }
    }

    /// Appends `data` to the outgoing buffer (wrapping it in TLS first if
    /// the session is secure) and asks the owning loop to flush it.
    /// Test-intercept and closed-drop semantics: a send on a closing
    /// endpoint is silently dropped, per spec.md §4.3.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut guard = self.shared.outgoing.lock().unwrap();
            let Outgoing { buffer, tls } = &mut *guard;
            match tls {
                Some(tls) => tls.wrap(data, buffer)?,
                None => buffer.append(data)?,
            }
        }
        self.touch_activity();
        self.request_write();
        Ok(())
    }

    /// Idempotent. Emits a TLS close-notify if secure, marks the endpoint
    /// closing, and asks the owning loop to flush and then tear down the
    /// socket once the outgoing buffer drains.
    pub fn close(&self) {
        if self.shared.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.closing.store(true, Ordering::SeqCst);
        {
            let mut guard = self.shared.outgoing.lock().unwrap();
            let Outgoing { buffer, tls } = &mut *guard;
            if let Some(tls) = tls {
                tls.close_outbound(buffer);
            }
        }
        self.request_write();
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// STARTTLS upgrade: legal exactly once, only while plaintext and only
    /// when the endpoint was constructed with a secure `TransportFactory`.
    /// The client role emits its ClientHello immediately; the server role
    /// waits for the client's.
    pub fn start_tls(&self, server_name: Option<&str>) -> Result<()> {
        if self.shared.tls_upgraded.swap(true, Ordering::SeqCst) {
            return Err(Error::tls(self.shared.remote_addr, "start_tls called more than once"));
        }
        let factory = self
            .shared
            .factory
            .as_ref()
            .ok_or_else(|| Error::tls(self.shared.remote_addr, "no TransportFactory configured for this endpoint"))?;

        let mut outgoing = self.shared.outgoing.lock().unwrap();
        let mut session = match self.shared.role {
            Role::Server => TlsSession::new_server(factory)?,
            Role::Client => {
                let name = server_name
                    .map(|s| s.to_string())
                    .or_else(|| self.shared.remote_addr.map(|a| a.ip().to_string()))
                    .unwrap_or_default();
                let server_name = rustls::pki_types::ServerName::try_from(name)
                    .map_err(|e| Error::tls(self.shared.remote_addr, format!("invalid server name: {e}")))?;
                TlsSession::new_client(factory, server_name)?
            }
        };
        if matches!(self.shared.role, Role::Client) {
            session.start_client_handshake(&mut outgoing.buffer)?;
        }
        outgoing.tls = Some(session);
        drop(outgoing);
        self.request_write();
        Ok(())
    }

    fn request_write(&self) {
        self.shared.loop_handle.request_registration(RegistrationRequest::Reregister {
            token: self.shared.token,
            interest: mio::Interest::READABLE | mio::Interest::WRITABLE,
        });
    }

    pub(crate) fn touch_activity(&self) {
        self.shared
            .last_activity_ms
            .store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn last_activity_ms(&self) -> i64 {
        self.shared.last_activity_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn created_ms(&self) -> i64 {
        self.shared.created_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn set_handshake_complete(&self, info: SecurityInfo) {
        *self.shared.security_info.lock().unwrap() = Some(info);
    }
}

/// A handle for scheduling a callback on the endpoint's owning loop thread.
/// See [`crate::timer::ScheduledTimer`].
#[derive(Clone)]
pub struct Scheduler {
    loop_handle: LoopHandle,
    timer: Arc<ScheduledTimer>,
}

impl Scheduler {
    pub fn schedule_timer<F>(&self, delay_ms: u64, callback: F) -> TimerCancelHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.timer.schedule(self.loop_handle.clone(), delay_ms, callback)
    }
}

pub(crate) struct SharedBuilder {
    pub(crate) role: Role,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) loop_handle: LoopHandle,
    pub(crate) token: Token,
    pub(crate) factory: Option<Arc<TransportFactory>>,
    pub(crate) timer: Arc<ScheduledTimer>,
    pub(crate) immediately_secure: bool,
    pub(crate) owner: Option<Arc<crate::runtime::Runtime>>,
}

impl SharedBuilder {
    pub(crate) fn build(self) -> Result<Arc<Shared>> {
        let now = now_millis();
        let id = EndpointId::next();
        if let Some(runtime) = &self.owner {
            runtime.register_active_endpoint(id);
        }
        let mut buffer = NetBuffer::unbounded(8192);
        let tls = if self.immediately_secure {
            let factory = self
                .factory
                .as_ref()
                .ok_or_else(|| Error::config("immediately_secure endpoint requires a TransportFactory"))?;
            Some(match self.role {
                Role::Server => TlsSession::new_server(factory)?,
                Role::Client => {
                    let name = self
                        .remote_addr
                        .map(|a| a.ip().to_string())
                        .unwrap_or_default();
                    let server_name = rustls::pki_types::ServerName::try_from(name)
                        .map_err(|e| Error::tls(self.remote_addr, format!("invalid server name: {e}")))?;
                    let mut session = TlsSession::new_client(factory, server_name)?;
                    session.start_client_handshake(&mut buffer)?;
                    session
                }
            })
        } else {
            None
        };
        let tls_upgraded = tls.is_some();
        Ok(Arc::new(Shared {
            id,
            role: self.role,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            loop_handle: self.loop_handle,
            token: self.token,
            factory: self.factory,
            timer: self.timer,
            outgoing: Mutex::new(Outgoing { buffer, tls }),
            security_info: Mutex::new(None),
            tls_upgraded: AtomicBool::new(tls_upgraded),
            closing: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            created_ms: AtomicI64::new(now),
            last_activity_ms: AtomicI64::new(now),
            owner: self.owner,
        }))
    }
}

pub(crate) const MIN_INITIAL_BUFFER: usize = 8192;

pub(crate) fn incoming_buffer(max_net_in_size: usize) -> NetBuffer {
    NetBuffer::bounded(MIN_INITIAL_BUFFER.min(max_net_in_size), max_net_in_size)
}

/// Arms (and, on every fire that finds recent activity, re-arms) an idle
/// timeout: closes `endpoint` once `idle_ms` has passed with no activity.
/// Timers are the only cancellation primitive handler-initiated work gets
/// (spec.md §5), so this is implemented as a self-rescheduling one-shot
/// rather than a cancel-and-replace on every read.
pub(crate) fn arm_idle_timeout(endpoint: EndpointRef, idle_ms: u64) {
    let scheduler = endpoint.scheduler();
    scheduler.schedule_timer(idle_ms, move || {
        if endpoint.is_closing() {
            return;
        }
        let elapsed = now_millis() - endpoint.last_activity_ms();
        if elapsed >= idle_ms as i64 {
            endpoint.close();
        } else {
            arm_idle_timeout(endpoint, idle_ms);
        }
    });
}

/// One-shot: closes `endpoint` if no byte has ever been received by the
/// time `read_timeout_ms` elapses since it was constructed.
pub(crate) fn arm_read_timeout(endpoint: EndpointRef, read_timeout_ms: u64) {
    let scheduler = endpoint.scheduler();
    scheduler.schedule_timer(read_timeout_ms, move || {
        if endpoint.is_closing() {
            return;
        }
        if endpoint.last_activity_ms() == endpoint.created_ms() {
            endpoint.close();
        }
    });
}
