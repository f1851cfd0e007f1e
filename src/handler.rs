//! The external interfaces a protocol implementation plugs into the core
//! through (spec.md §6). Everything in this module is a collaborator: the
//! core never inspects a `Handler`'s internals, only calls its hooks.

use std::net::SocketAddr;

use crate::buffer::NetBuffer;
use crate::endpoint::udp::UdpShared;
use crate::endpoint::EndpointRef;
use crate::error::Error;
use std::sync::Arc;

/// Receives plaintext application data and lifecycle notifications for one
/// stream endpoint. Runs synchronously on the endpoint's owning worker
/// thread; implementations must not block (spec.md §5).
pub trait Handler: Send + 'static {
    /// New plaintext bytes are available in `buf`. Implementations consume
    /// a prefix via [`NetBuffer::drain_front`]; unconsumed bytes remain
    /// buffered for the next call.
    fn receive(&mut self, endpoint: &EndpointRef, buf: &mut NetBuffer);

    /// The TLS handshake completed (or, for a plaintext endpoint that never
    /// enables TLS, this is never called).
    fn on_handshake_complete(&mut self, _endpoint: &EndpointRef, _alpn: Option<&[u8]>) {}

    /// The endpoint was closed, locally or by the peer. Always the last
    /// call a `Handler` receives for a given endpoint.
    fn disconnected(&mut self, endpoint: &EndpointRef);

    /// An outbound connection finished connecting.
    fn on_connected(&mut self, _endpoint: &EndpointRef) {}

    /// An outbound connection attempt failed before it ever connected.
    fn on_connect_failed(&mut self, _endpoint: &EndpointRef, _error: &Error) {}
}

/// A handle to a UDP endpoint, passed to [`DatagramHandler`]. UDP has no
/// connection lifecycle, so this exposes only what spec.md §3 attributes to
/// a datagram endpoint: send and close.
#[derive(Clone)]
pub struct UdpEndpointRef {
    pub(crate) shared: Arc<UdpShared>,
}

impl UdpEndpointRef {
    /// Queues `data` for delivery to `to`.
    pub fn send_to(&self, data: &[u8], to: SocketAddr) -> crate::error::Result<()> {
        crate::endpoint::udp::send_to(&self.shared, data, to)
    }

    pub fn close(&self) {
        crate::endpoint::udp::close(&self.shared);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }
}

/// Receives datagrams for one bound UDP socket.
pub trait DatagramHandler: Send + 'static {
    fn receive(&mut self, endpoint: &UdpEndpointRef, data: &[u8], from: SocketAddr);
    fn on_error(&mut self, _endpoint: &UdpEndpointRef, _error: &Error) {}
}

/// Constructs a fresh [`Handler`] for each accepted or outbound stream
/// endpoint. One factory is shared by every worker thread, so it must be
/// `Sync`.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn new_handler(&self, remote: SocketAddr) -> Box<dyn Handler>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(SocketAddr) -> Box<dyn Handler> + Send + Sync + 'static,
{
    fn new_handler(&self, remote: SocketAddr) -> Box<dyn Handler> {
        self(remote)
    }
}

/// Constructs the [`DatagramHandler`] for a bound UDP socket.
pub trait DatagramFactory: Send + Sync + 'static {
    fn new_handler(&self) -> Box<dyn DatagramHandler>;
}

impl<F> DatagramFactory for F
where
    F: Fn() -> Box<dyn DatagramHandler> + Send + Sync + 'static,
{
    fn new_handler(&self) -> Box<dyn DatagramHandler> {
        self()
    }
}
