//! Loop-local UDP endpoint state (spec.md §3, §4.2).
//!
//! UDP has no connection lifecycle and no TLS, so it does not reuse
//! [`super::Shared`]: [`UdpShared`] is its own cross-thread state (send
//! queue plus lifecycle flags), and [`UdpConn`] is the loop-local record
//! (the bound socket, the handler). A fixed 65535-byte receive buffer (the
//! maximum possible datagram size) and a FIFO send queue keyed by
//! destination address match spec.md §4.2's datagram read/write handling.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::UdpSocket;
use mio::Token;

use crate::clock::now_millis;
use crate::endpoint::EndpointId;
use crate::error::{Error, Result};
use crate::handler::DatagramHandler;
use crate::reactor::{LoopHandle, RegistrationRequest};

const MAX_DATAGRAM_SIZE: usize = 65535;

struct QueuedDatagram {
    data: Vec<u8>,
    to: SocketAddr,
}

/// Cross-thread state for one bound UDP socket.
pub struct UdpShared {
    id: EndpointId,
    local_addr: Option<SocketAddr>,
    loop_handle: LoopHandle,
    token: Token,
    closing: AtomicBool,
    queue: Mutex<VecDeque<QueuedDatagram>>,
    last_activity_ms: AtomicI64,
}

impl UdpShared {
    pub(crate) fn new(id: EndpointId, local_addr: Option<SocketAddr>, loop_handle: LoopHandle, token: Token) -> Arc<UdpShared> {
        let now = now_millis();
        Arc::new(UdpShared {
            id,
            local_addr,
            loop_handle,
            token,
            closing: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            last_activity_ms: AtomicI64::new(now),
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn touch_activity(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
    }
}

pub(crate) fn send_to(shared: &Arc<UdpShared>, data: &[u8], to: SocketAddr) -> Result<()> {
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(Error::transport_io(
            Some(to),
            io::Error::new(io::ErrorKind::InvalidInput, "datagram exceeds 65535 bytes"),
        ));
    }
    if shared.closing.load(Ordering::SeqCst) {
        return Ok(());
    }
    shared.queue.lock().unwrap().push_back(QueuedDatagram { data: data.to_vec(), to });
    shared.loop_handle.request_registration(RegistrationRequest::Reregister {
        token: shared.token,
        interest: mio::Interest::READABLE | mio::Interest::WRITABLE,
    });
    Ok(())
}

pub(crate) fn close(shared: &Arc<UdpShared>) {
    shared.closing.store(true, Ordering::SeqCst);
    shared.loop_handle.request_registration(RegistrationRequest::Deregister { token: shared.token });
}

/// A single bound UDP socket, owned by one loop thread.
pub struct UdpConn {
    pub(crate) token: Token,
    pub(crate) socket: UdpSocket,
    pub(crate) shared: Arc<UdpShared>,
    pub(crate) handler: Box<dyn DatagramHandler>,
}

impl UdpConn {
    pub(crate) fn new(token: Token, socket: UdpSocket, shared: Arc<UdpShared>, handler: Box<dyn DatagramHandler>) -> UdpConn {
        UdpConn { token, socket, shared, handler }
    }

    fn endpoint_ref(&self) -> crate::handler::UdpEndpointRef {
        crate::handler::UdpEndpointRef {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn process_inbound(&mut self) -> Result<()> {
        let mut scratch = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.socket.recv_from(&mut scratch) {
                Ok((n, from)) => {
                    self.shared.touch_activity();
                    let endpoint = self.endpoint_ref();
                    self.handler.receive(&endpoint, &scratch[..n], from);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transport_io(self.shared.local_addr, e)),
            }
        }
    }

    /// Drains the send queue in FIFO order. UDP has no partial-write
    /// concept, so each datagram is sent whole or requeued whole.
    pub(crate) fn flush_outbound(&mut self) -> Result<bool> {
        loop {
            let next = self.shared.queue.lock().unwrap().pop_front();
            let Some(datagram) = next else { return Ok(true) };
            match self.socket.send_to(&datagram.data, datagram.to) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.shared.queue.lock().unwrap().push_front(datagram);
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.shared.queue.lock().unwrap().push_front(datagram);
                    continue;
                }
                Err(e) => return Err(Error::transport_io(Some(datagram.to), e)),
            }
        }
    }

    pub(crate) fn on_error(&mut self, err: &Error) {
        let endpoint = self.endpoint_ref();
        self.handler.on_error(&endpoint, err);
    }
}

