//! The TLS state machine bridging the reactor's byte-stream view and the
//! handler's plaintext view.
//!
//! Grounded on the rustls pump loop in `oasis-os`'s `tls_rustls.rs`
//! (`read_tls` / `write_tls` / `process_new_packets`), adapted from a
//! blocking `Read`/`Write` adapter to the reactor's buffer-and-callback
//! model: `unwrap` drains ciphertext that the loop already placed in the
//! incoming [`NetBuffer`] and hands decrypted bytes to the handler; `wrap`
//! appends produced ciphertext to the outgoing [`NetBuffer`] instead of
//! writing to a socket directly.
//!
//! rustls does not expose a Java-`SSLEngine`-shaped
//! `{OK, BUFFER_UNDERFLOW, BUFFER_OVERFLOW, CLOSED}` status, or a
//! `{NEED_WRAP, NEED_UNWRAP, NEED_TASK}` handshake status; both loops below
//! are written directly against rustls's actual `is_handshaking` /
//! `wants_read` / `wants_write` / `process_new_packets` primitives, which
//! is where every rustls-backed reactor in the corpus drives its engine.
//! See DESIGN.md for the mapping from spec vocabulary to these calls.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};

use crate::buffer::NetBuffer;
use crate::error::{Error, Result};
use crate::transport::TransportFactory;

/// Negotiated parameters exposed to the handler once the handshake completes.
#[derive(Debug, Clone, Default)]
pub struct SecurityInfo {
    pub protocol_version: Option<&'static str>,
    pub cipher_suite: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
    pub peer_certificates: Vec<Vec<u8>>,
}

enum Engine {
    Client(Box<ClientConnection>),
    Server(Box<ServerConnection>),
}

macro_rules! forward {
    ($self:expr, $method:ident($($arg:expr),*)) => {
        match $self {
            Engine::Client(c) => c.$method($($arg),*),
            Engine::Server(c) => c.$method($($arg),*),
        }
    };
}

impl Engine {
    fn is_handshaking(&self) -> bool {
        forward!(self, is_handshaking())
    }

    fn wants_write(&self) -> bool {
        forward!(self, wants_write())
    }

    fn wants_read(&self) -> bool {
        forward!(self, wants_read())
    }

    fn write_tls(&mut self, out: &mut dyn io::Write) -> io::Result<usize> {
        forward!(self, write_tls(out))
    }

    fn read_tls(&mut self, input: &mut dyn io::Read) -> io::Result<usize> {
        forward!(self, read_tls(input))
    }

    fn process_new_packets(&mut self) -> std::result::Result<rustls::IoState, rustls::Error> {
        forward!(self, process_new_packets())
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Engine::Client(c) => c.reader(),
            Engine::Server(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Engine::Client(c) => c.writer(),
            Engine::Server(c) => c.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        forward!(self, send_close_notify())
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        forward!(self, alpn_protocol())
    }

    fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        forward!(self, negotiated_cipher_suite())
    }

    fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        forward!(self, protocol_version())
    }

    fn peer_certificates(&self) -> Option<&[rustls::pki_types::CertificateDer<'static>]> {
        forward!(self, peer_certificates())
    }
}

/// A `Read`/`Write` view of a [`NetBuffer`] used to feed ciphertext into and
/// pull ciphertext out of rustls without copying through a real socket.
struct BufferCursor<'a> {
    buf: &'a mut NetBuffer,
    read_pos: usize,
}

impl<'a> BufferCursor<'a> {
    fn new(buf: &'a mut NetBuffer) -> Self {
        BufferCursor { buf, read_pos: 0 }
    }
}

impl io::Read for BufferCursor<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.buf.as_slice()[self.read_pos..];
        if remaining.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no ciphertext available"));
        }
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl io::Write for BufferCursor<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .append(data)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Per-connection TLS state. See module docs for the mapping from
/// spec.md's engine vocabulary onto rustls.
pub struct TlsSession {
    engine: Engine,
    handshake_done: bool,
    closed: bool,
}

impl TlsSession {
    pub(crate) fn new_server(factory: &TransportFactory) -> Result<TlsSession> {
        let config = factory.server_config()?;
        let conn = ServerConnection::new(config)
            .map_err(|e| Error::tls(None, format!("server handshake init: {e}")))?;
        Ok(TlsSession {
            engine: Engine::Server(Box::new(conn)),
            handshake_done: false,
            closed: false,
        })
    }

    pub(crate) fn new_client(
        factory: &TransportFactory,
        server_name: ServerName<'static>,
    ) -> Result<TlsSession> {
        let config = factory.client_config()?;
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::tls(None, format!("client handshake init: {e}")))?;
        Ok(TlsSession {
            engine: Engine::Client(Box::new(conn)),
            handshake_done: false,
            closed: false,
        })
    }

    /// Client role only: synthesizes ClientHello into `outgoing`. Idempotent.
    pub(crate) fn start_client_handshake(&mut self, outgoing: &mut NetBuffer) -> Result<()> {
        if !matches!(self.engine, Engine::Client(_)) {
            return Ok(());
        }
        self.pump_handshake_writes(outgoing)
    }

    fn pump_handshake_writes(&mut self, outgoing: &mut NetBuffer) -> Result<()> {
        while self.engine.wants_write() {
            let mut cursor = BufferCursor::new(outgoing);
            match self.engine.write_tls(&mut cursor) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => return Err(Error::tls(None, format!("wrap: {e}"))),
            }
        }
        Ok(())
    }

    /// Drains ciphertext already appended to `incoming` by the reactor,
    /// delivers any resulting plaintext via `on_plaintext`, and compacts
    /// `incoming`. Mirrors spec.md's event loop over handshake status.
    pub(crate) fn unwrap(
        &mut self,
        incoming: &mut NetBuffer,
        outgoing: &mut NetBuffer,
        mut on_plaintext: impl FnMut(&[u8]),
    ) -> Result<TlsEvent> {
        if self.closed {
            return Ok(TlsEvent::Closed);
        }

        let mut cursor = BufferCursor::new(incoming);
        loop {
            if self.engine.wants_read() {
                match self.engine.read_tls(&mut cursor) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(Error::tls(None, format!("unwrap read_tls: {e}"))),
                }
                match self.engine.process_new_packets() {
                    Ok(_) => {}
                    Err(e) => {
                        let consumed = cursor.read_pos;
                        cursor.buf.drain_front(consumed);
                        return Err(Error::tls(None, format!("unwrap process_new_packets: {e}")));
                    }
                }
            } else {
                break;
            }
        }
        let consumed = cursor.read_pos;
        incoming.drain_front(consumed);

        // Drain any decrypted application data.
        let mut scratch = [0u8; 8192];
        loop {
            match self.engine.reader().read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => on_plaintext(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        let was_handshaking = !self.handshake_done;
        if was_handshaking && !self.engine.is_handshaking() {
            self.handshake_done = true;
        }

        // The engine may need to emit handshake records in response (e.g.
        // server Certificate/Finished, or a post-handshake NewSessionTicket).
        self.pump_handshake_writes(outgoing)?;

        if was_handshaking && self.handshake_done {
            return Ok(TlsEvent::HandshakeComplete);
        }
        Ok(TlsEvent::Progress)
    }

    /// Encrypts `data` into `outgoing`. Called from the handler thread via
    /// `send`; always runs under the endpoint's buffer lock.
    pub(crate) fn wrap(&mut self, data: &[u8], outgoing: &mut NetBuffer) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut remaining = data;
        while !remaining.is_empty() {
            let n = self
                .engine
                .writer()
                .write(remaining)
                .map_err(|e| Error::tls(None, format!("wrap: {e}")))?;
            if n == 0 {
                break;
            }
            remaining = &remaining[n..];
        }
        self.pump_handshake_writes(outgoing)
    }

    /// Produces the close-notify record. No further application data may be
    /// wrapped after this.
    pub(crate) fn close_outbound(&mut self, outgoing: &mut NetBuffer) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.engine.send_close_notify();
        let _ = self.pump_handshake_writes(outgoing);
    }

    pub(crate) fn is_handshake_complete(&self) -> bool {
        self.handshake_done
    }

    pub(crate) fn security_info(&self) -> SecurityInfo {
        SecurityInfo {
            protocol_version: self.engine.protocol_version().map(protocol_name),
            cipher_suite: self
                .engine
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            alpn_protocol: self.engine.alpn_protocol().map(|p| p.to_vec()),
            peer_certificates: self
                .engine
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default(),
        }
    }
}

fn protocol_name(v: rustls::ProtocolVersion) -> &'static str {
    match v {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
        _ => "unknown",
    }
}

/// Result of a single `unwrap` pass.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TlsEvent {
    /// More ciphertext is needed, or application data was delivered; no
    /// handshake transition happened this pass.
    Progress,
    /// The handshake finished during this pass.
    HandshakeComplete,
    /// The session is closed; no further processing should occur.
    Closed,
}

#[allow(dead_code)]
fn _assert_send(_: Arc<TransportFactory>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportFactoryConfig;

    fn self_signed_factory() -> (TransportFactory, rcgen::CertifiedKey) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = certified.cert.der().to_vec();
        let key_der = certified.key_pair.serialize_der();
        let cfg = TransportFactoryConfig {
            secure: true,
            cert_chain_der: Some(vec![cert_der]),
            private_key_der: Some(key_der),
            ..Default::default()
        };
        (TransportFactory::new(cfg).unwrap(), certified)
    }

    #[test]
    fn client_server_handshake_and_application_data_round_trip() {
        let (server_factory, certified) = self_signed_factory();
        let mut root_store = rustls::RootCertStore::empty();
        root_store
            .add(rustls::pki_types::CertificateDer::from(
                certified.cert.der().to_vec(),
            ))
            .unwrap();
        let client_cfg = TransportFactoryConfig {
            secure: true,
            trusted_roots_der: Some(vec![certified.cert.der().to_vec()]),
            ..Default::default()
        };
        let client_factory = TransportFactory::new(client_cfg).unwrap();

        let mut server = TlsSession::new_server(&server_factory).unwrap();
        let mut client = TlsSession::new_client(
            &client_factory,
            ServerName::try_from("localhost").unwrap(),
        )
        .unwrap();

        let mut client_out = NetBuffer::unbounded(4096);
        let mut server_out = NetBuffer::unbounded(4096);
        client.start_client_handshake(&mut client_out).unwrap();

        let mut received_on_server = Vec::new();
        let mut received_on_client = Vec::new();
        let mut client_done = false;
        let mut server_done = false;

        for _ in 0..20 {
            if !client_out.is_empty() {
                let bytes = client_out.take();
                let mut incoming = NetBuffer::unbounded(bytes.len());
                incoming.append(&bytes).unwrap();
                let ev = server
                    .unwrap(&mut incoming, &mut server_out, |data| {
                        received_on_server.extend_from_slice(data)
                    })
                    .unwrap();
                if ev == TlsEvent::HandshakeComplete {
                    server_done = true;
                }
            }
            if !server_out.is_empty() {
                let bytes = server_out.take();
                let mut incoming = NetBuffer::unbounded(bytes.len());
                incoming.append(&bytes).unwrap();
                let ev = client
                    .unwrap(&mut incoming, &mut client_out, |data| {
                        received_on_client.extend_from_slice(data)
                    })
                    .unwrap();
                if ev == TlsEvent::HandshakeComplete {
                    client_done = true;
                }
            }
            if client_done && server_done && client_out.is_empty() && server_out.is_empty() {
                break;
            }
        }
        assert!(client_done && server_done, "handshake did not complete");

        client.wrap(b"hello from client", &mut client_out).unwrap();
        let bytes = client_out.take();
        let mut incoming = NetBuffer::unbounded(bytes.len());
        incoming.append(&bytes).unwrap();
        server
            .unwrap(&mut incoming, &mut server_out, |data| {
                received_on_server.extend_from_slice(data)
            })
            .unwrap();
        assert_eq!(received_on_server, b"hello from client");

        server.wrap(b"hello from server", &mut server_out).unwrap();
        let bytes = server_out.take();
        let mut incoming = NetBuffer::unbounded(bytes.len());
        incoming.append(&bytes).unwrap();
        client
            .unwrap(&mut incoming, &mut client_out, |data| {
                received_on_client.extend_from_slice(data)
            })
            .unwrap();
        assert_eq!(received_on_client, b"hello from server");
    }

    #[test]
    fn fragmented_ciphertext_still_decodes() {
        let (server_factory, certified) = self_signed_factory();
        let client_cfg = TransportFactoryConfig {
            secure: true,
            trusted_roots_der: Some(vec![certified.cert.der().to_vec()]),
            ..Default::default()
        };
        let client_factory = TransportFactory::new(client_cfg).unwrap();
        let mut server = TlsSession::new_server(&server_factory).unwrap();
        let mut client = TlsSession::new_client(
            &client_factory,
            ServerName::try_from("localhost").unwrap(),
        )
        .unwrap();

        let mut client_out = NetBuffer::unbounded(4096);
        let mut server_out = NetBuffer::unbounded(4096);
        client.start_client_handshake(&mut client_out).unwrap();

        // Feed the handshake one byte at a time in both directions.
        for _ in 0..40 {
            feed_one_byte_at_a_time(&mut client_out, &mut server, &mut server_out);
            feed_one_byte_at_a_time(&mut server_out, &mut client, &mut client_out);
        }

        assert!(server.is_handshake_complete());
        assert!(client.is_handshake_complete());
    }

    fn feed_one_byte_at_a_time(
        from: &mut NetBuffer,
        into: &mut TlsSession,
        into_out: &mut NetBuffer,
    ) {
        let bytes = from.take();
        for byte in bytes {
            let mut incoming = NetBuffer::unbounded(1);
            incoming.append(&[byte]).unwrap();
            let _ = into.unwrap(&mut incoming, into_out, |_| {});
        }
    }
}
