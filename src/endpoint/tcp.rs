//! Loop-local stream connection state (spec.md §4.2, §4.3).
//!
//! [`TcpConn`] lives exclusively in the owning [`crate::reactor::SelectorLoop`]'s
//! connection table. Nothing outside that loop thread ever touches it
//! directly; other threads go through the [`EndpointRef`] clone held in
//! [`TcpConn::endpoint`], which only reaches [`super::Shared`]'s locked
//! outgoing buffer and atomics. Being a descendant of `endpoint`, this
//! module reaches straight into `Shared`'s private fields rather than
//! through `EndpointRef`'s public (cross-module) API.
//!
//! Despite the name, [`TcpConn`] backs both TCP and (on Unix) Unix domain
//! stream listeners (spec.md §10's supplemented Unix socket feature):
//! [`Stream`] is a small enum over the two `mio` socket types, the same
//! forwarding shape as [`crate::tls::TlsSession`]'s `Engine`.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::buffer::NetBuffer;
use crate::endpoint::{self, EndpointRef, Outgoing, Role};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::listener::AcceptPolicy;
use crate::reactor::RegistrationRequest;
use crate::tls::TlsEvent;

/// The two duplex byte-stream socket types this core accepts connections
/// over. Outbound connects are TCP-only, per spec.md §1.
pub(crate) enum Stream {
    Tcp(mio::net::TcpStream),
    #[cfg(unix)]
    Unix(mio::net::UnixStream),
}

macro_rules! forward_io {
    ($self:expr, $method:ident($($arg:expr),*)) => {
        match $self {
            Stream::Tcp(s) => s.$method($($arg),*),
            #[cfg(unix)]
            Stream::Unix(s) => s.$method($($arg),*),
        }
    };
}

impl Stream {
    fn set_nodelay_if_tcp(&self) {
        if let Stream::Tcp(s) = self {
            let _ = s.set_nodelay(true);
        }
    }

    /// Outbound connects are always TCP, so only that variant can ever have
    /// a pending `SO_ERROR` worth checking.
    fn take_connect_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Stream::Tcp(s) => s.take_error(),
            #[cfg(unix)]
            Stream::Unix(_) => Ok(None),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        forward_io!(self, read(buf))
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        forward_io!(self, write(buf))
    }
    fn flush(&mut self) -> io::Result<()> {
        forward_io!(self, flush())
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        forward_io!(self, register(registry, token, interests))
    }
    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        forward_io!(self, reregister(registry, token, interests))
    }
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        forward_io!(self, deregister(registry))
    }
}

/// A single accepted-or-connected stream connection, owned by one loop thread.
pub struct TcpConn {
    pub(crate) token: Token,
    pub(crate) stream: Stream,
    pub(crate) endpoint: EndpointRef,
    pub(crate) handler: Box<dyn Handler>,
    pub(crate) incoming: NetBuffer,
    /// Set once an outbound (client-role) connect has been confirmed, so
    /// the loop knows whether first-writability still owes `on_connected`.
    pub(crate) connect_notified: bool,
    /// The accept-time policy and remote address this connection was
    /// counted against, so disconnect can give the count back. `None` for
    /// outbound connects and Unix domain accepts, neither of which have a
    /// meaningful per-IP policy.
    accept_policy: Option<(Arc<AcceptPolicy>, SocketAddr)>,
}

impl TcpConn {
    pub(crate) fn new(
        token: Token,
        stream: Stream,
        endpoint: EndpointRef,
        handler: Box<dyn Handler>,
        role: Role,
        max_net_in_size: usize,
    ) -> TcpConn {
        stream.set_nodelay_if_tcp();
        TcpConn {
            token,
            stream,
            endpoint,
            handler,
            incoming: endpoint::incoming_buffer(max_net_in_size),
            connect_notified: !matches!(role, Role::Client),
            accept_policy: None,
        }
    }

    /// Attaches the accept-time policy and remote address an accepted
    /// connection was counted against, so [`TcpConn::handle_eof`] can give
    /// the per-IP count back on disconnect.
    pub(crate) fn with_accept_policy(mut self, policy: Arc<AcceptPolicy>, remote: SocketAddr) -> TcpConn {
        self.accept_policy = Some((policy, remote));
        self
    }

    pub(crate) fn remote_addr(&self) -> Option<SocketAddr> {
        self.endpoint.remote_addr()
    }

    /// Reads available bytes into the incoming buffer, bounded by
    /// `max_net_in_size`, then either hands ciphertext to the TLS session
    /// or plaintext directly to the handler. Returns `Ok(true)` if the peer
    /// closed the connection (EOF).
    pub(crate) fn process_inbound(&mut self) -> Result<bool> {
        let mut scratch = [0u8; 8192];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Ok(true),
                Ok(n) => self.incoming.append(&scratch[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transport_io(self.remote_addr(), e)),
            }
        }
        self.deliver_inbound()?;
        Ok(false)
    }

    fn deliver_inbound(&mut self) -> Result<()> {
        self.endpoint.touch_activity();
        let has_tls = self.endpoint.shared.outgoing.lock().unwrap().tls.is_some();
        if !has_tls {
            if !self.incoming.is_empty() {
                self.handler.receive(&self.endpoint, &mut self.incoming);
            }
            return Ok(());
        }

        // `tls.unwrap` may need to write handshake records to `buffer`, so the
        // outgoing lock covers that call — but `Handler::receive` is allowed
        // to call `EndpointRef::send`, which takes the same lock, so decrypted
        // application data is only collected here and delivered to the
        // handler after the guard is dropped.
        let mut decrypted = Vec::new();
        let info = {
            let mut guard = self.endpoint.shared.outgoing.lock().unwrap();
            let Outgoing { buffer, tls } = &mut *guard;
            let incoming = &mut self.incoming;
            let tls = tls.as_mut().expect("checked has_tls above");
            let event = tls.unwrap(incoming, buffer, |data| decrypted.extend_from_slice(data))?;
            (event == TlsEvent::HandshakeComplete).then(|| tls.security_info())
        };

        if !decrypted.is_empty() {
            let mut view = NetBuffer::unbounded(decrypted.len());
            view.append(&decrypted)?;
            self.handler.receive(&self.endpoint, &mut view);
        }

        if let Some(info) = info {
            let alpn = info.alpn_protocol.clone();
            self.endpoint.set_handshake_complete(info);
            self.handler.on_handshake_complete(&self.endpoint, alpn.as_deref());
        }
        Ok(())
    }

    /// Called when `process_inbound` observes EOF, or on a fatal read/write
    /// error. Always the last thing that happens to this connection on
    /// this loop iteration: it asks the owning loop to deregister and drop
    /// this connection's table entry, mirroring `udp::close`.
    pub(crate) fn handle_eof(&mut self) {
        self.endpoint.shared.closing.store(true, Ordering::SeqCst);
        self.handler.disconnected(&self.endpoint);
        self.note_disconnected();
        self.request_deregister();
    }

    pub(crate) fn handle_read_error(&mut self, err: Error) {
        log::warn!("stream read error{}: {err}", addr_tag(self.remote_addr()));
        self.handle_eof();
    }

    pub(crate) fn handle_write_error(&mut self, err: Error) {
        log::warn!("stream write error{}: {err}", addr_tag(self.remote_addr()));
        self.handle_eof();
    }

    pub(crate) fn handle_connect_error(&mut self, err: Error) {
        log::warn!("connect error{}: {err}", addr_tag(self.remote_addr()));
        self.endpoint.shared.closing.store(true, Ordering::SeqCst);
        self.handler.on_connect_failed(&self.endpoint, &err);
        self.request_deregister();
    }

    fn note_disconnected(&self) {
        if let Some((policy, remote)) = &self.accept_policy {
            policy.note_disconnected(*remote);
        }
    }

    fn request_deregister(&self) {
        self.endpoint
            .shared
            .loop_handle
            .request_registration(RegistrationRequest::Deregister { token: self.token });
    }

    /// Checked on the first writable event for a client-role connection,
    /// before `notify_connected` fires.
    pub(crate) fn take_connect_error(&self) -> Option<io::Error> {
        match self.stream.take_connect_error() {
            Ok(pending) => pending,
            Err(e) => Some(e),
        }
    }

    /// Called once an outbound connect's first writable event confirms the
    /// socket connected successfully (checked via `take_connect_error` by
    /// the caller first).
    pub(crate) fn notify_connected(&mut self) {
        if !self.connect_notified {
            self.connect_notified = true;
            self.endpoint.touch_activity();
            self.handler.on_connected(&self.endpoint);
        }
    }

    /// Drains the outgoing buffer to the socket, preserving any bytes a
    /// short write leaves behind. Returns `true` once fully drained.
    pub(crate) fn flush_outbound(&mut self) -> Result<bool> {
        loop {
            let pending = {
                let outgoing = self.endpoint.shared.outgoing.lock().unwrap();
                if outgoing.buffer.is_empty() {
                    return Ok(true);
                }
                outgoing.buffer.as_slice().to_vec()
            };
            match self.stream.write(&pending) {
                Ok(written) => {
                    let mut outgoing = self.endpoint.shared.outgoing.lock().unwrap();
                    outgoing.buffer.drain_front(written);
                    if written < pending.len() {
                        return Ok(false);
                    }
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transport_io(self.remote_addr(), e)),
            }
        }
    }

    /// Whether the owning loop should tear this connection down once its
    /// outgoing buffer has fully drained (the peer, or `close()`, asked).
    pub(crate) fn should_close_after_drain(&self) -> bool {
        self.endpoint.shared.closing.load(Ordering::SeqCst)
    }
}

fn addr_tag(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => format!(" on {addr}"),
        None => String::new(),
    }
}
