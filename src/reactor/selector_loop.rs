//! One worker's event loop (spec.md §4.2).
//!
//! Each `SelectorLoop` owns exactly one `mio::Poll`, one connection table,
//! and runs the same six steps every iteration: drain registrations, drain
//! pending writes (folded into the connection dispatch below, since a write
//! request just reregisters for writable interest), drain deferred tasks,
//! block on `poll` with a fixed short timeout, dispatch ready events by
//! type (reads before writes within one key), repeat.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::endpoint::tcp::TcpConn;
use crate::endpoint::udp::UdpConn;
use crate::error::Error;
use crate::reactor::{new_loop_handle, LoopHandle, RegistrationRequest, WAKER_TOKEN};

/// Poll timeout when nothing else is pending. Real deadline-awareness lives
/// in `ScheduledTimer`'s own thread (spec.md §4.6); the loop only needs to
/// wake often enough to notice deferred tasks promptly, since `invoke_later`
/// and `request_registration` both also wake it directly via `mio::Waker`.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

enum Conn {
    Tcp(TcpConn),
    Udp(UdpConn),
}

/// A single worker thread's reactor: accepts no connections itself (that is
/// [`super::AcceptLoop`]'s job) but owns every connection handed to it.
pub struct SelectorLoop {
    poll: Poll,
    events: Events,
    handle: LoopHandle,
    conns: HashMap<Token, Conn>,
}

impl SelectorLoop {
    pub fn new(id: usize) -> io::Result<SelectorLoop> {
        let poll = Poll::new()?;
        let handle = new_loop_handle(id, &poll)?;
        Ok(SelectorLoop {
            poll,
            events: Events::with_capacity(256),
            handle,
            conns: HashMap::new(),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Spawns this loop onto its own OS thread and returns a handle to it.
    pub fn spawn(id: usize, name: String) -> io::Result<LoopHandle> {
        let mut loop_ = SelectorLoop::new(id)?;
        let handle = loop_.handle();
        std::thread::Builder::new().name(name).spawn(move || loop_.run())?;
        Ok(handle)
    }

    pub fn run(&mut self) {
        loop {
            self.apply_registrations();
            let deferred = self.handle.drain_deferred();
            for task in deferred {
                task();
            }

            if self.handle.shutdown_requested() && self.conns.is_empty() {
                return;
            }

            if let Err(e) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("selector loop {} poll failed: {e}", self.handle.id());
                return;
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .filter(|ev| ev.token() != WAKER_TOKEN)
                .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                self.dispatch(token, readable, writable);
            }
        }
    }

    fn apply_registrations(&mut self) {
        for request in self.handle.drain_registrations() {
            match request {
                RegistrationRequest::NewTcp(conn) => self.insert_tcp(*conn),
                RegistrationRequest::NewUdp(conn) => self.insert_udp(*conn),
                RegistrationRequest::Reregister { token, interest } => {
                    self.reregister(token, interest)
                }
                RegistrationRequest::Deregister { token } => self.deregister(token),
                RegistrationRequest::AddListener(_) | RegistrationRequest::RemoveListener(_) => {
                    log::warn!("worker loop {} received an accept-loop-only registration request", self.handle.id());
                }
            }
        }
    }

    fn insert_tcp(&mut self, mut conn: TcpConn) {
        let token = conn.token;
        if let Err(e) = self.poll.registry().register(
            &mut conn.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            log::error!("failed to register tcp connection: {e}");
            return;
        }
        self.conns.insert(token, Conn::Tcp(conn));
    }

    fn insert_udp(&mut self, mut conn: UdpConn) {
        let token = conn.token;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.socket, token, Interest::READABLE)
        {
            log::error!("failed to register udp socket: {e}");
            return;
        }
        self.conns.insert(token, Conn::Udp(conn));
    }

    fn reregister(&mut self, token: Token, interest: Interest) {
        let result = match self.conns.get_mut(&token) {
            Some(Conn::Tcp(conn)) => self.poll.registry().reregister(&mut conn.stream, token, interest),
            Some(Conn::Udp(conn)) => self.poll.registry().reregister(&mut conn.socket, token, interest),
            None => return,
        };
        if let Err(e) = result {
            log::warn!("reregister failed for token {token:?}: {e}");
        }
    }

    fn deregister(&mut self, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let result = match &mut conn {
                Conn::Tcp(c) => self.poll.registry().deregister(&mut c.stream),
                Conn::Udp(c) => self.poll.registry().deregister(&mut c.socket),
            };
            if let Err(e) = result {
                log::warn!("deregister failed for token {token:?}: {e}");
            }
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let poll = &self.poll;
        let Some(conn) = self.conns.get_mut(&token) else { return };
        match conn {
            Conn::Tcp(conn) => dispatch_tcp(conn, readable, writable),
            Conn::Udp(conn) => dispatch_udp(conn, readable, writable, poll, token),
        }
    }
}

fn dispatch_tcp(conn: &mut TcpConn, readable: bool, writable: bool) {
        if writable && !conn.connect_notified {
            if let Some(e) = conn.take_connect_error() {
                conn.handle_connect_error(Error::connect_error(
                    conn.remote_addr().unwrap_or_else(|| "0.0.0.0:0".parse().unwrap()),
                    e,
                ));
                return;
            }
            conn.notify_connected();
        }

        // Reads before writes within one ready-key pass (spec.md §4.2).
        if readable {
            match conn.process_inbound() {
                Ok(true) => {
                    conn.handle_eof();
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    conn.handle_read_error(e);
                    return;
                }
            }
        }
        if writable {
            match conn.flush_outbound() {
                Ok(true) if conn.should_close_after_drain() => {
                    conn.handle_eof();
                }
                Ok(_) => {}
                Err(e) => conn.handle_write_error(e),
            }
        }
}

fn dispatch_udp(conn: &mut UdpConn, readable: bool, writable: bool, poll: &Poll, token: Token) {
    if readable {
        if let Err(e) = conn.process_inbound() {
            conn.on_error(&e);
        }
    }
    if writable {
        match conn.flush_outbound() {
            Ok(true) => {
                let _ = poll.registry().reregister(&mut conn.socket, token, Interest::READABLE);
            }
            Ok(false) => {}
            Err(e) => conn.on_error(&e),
        }
    }
}
