//! End-to-end scenarios exercising a `Runtime` against real sockets: a
//! plaintext round trip, a TLS handshake, a STARTTLS upgrade mid-connection,
//! inbound backpressure, timer firing/cancellation on the owning worker, and
//! accept-time rate limiting.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protonio::{
    ConnectionFactory, Error, EndpointRef, Handler, ListenerConfig, NetBuffer, Runtime, RuntimeConfig,
    TransportFactory, TransportFactoryConfig,
};

fn isolated_runtime() -> Arc<Runtime> {
    Runtime::new_isolated(RuntimeConfig::default()).unwrap()
}

fn base_listener_config(transport: TransportFactoryConfig) -> ListenerConfig {
    ListenerConfig {
        bind_addr: Some("127.0.0.1:0".parse().unwrap()),
        #[cfg(unix)]
        unix_socket_path: None,
        transport,
        max_connections_per_ip: None,
        rate_limit: None,
        allowed_networks: vec![],
        blocked_networks: vec![],
        idle_timeout_ms: None,
        read_timeout_ms: None,
        connection_timeout_ms: None,
        starttls: false,
    }
}

// --- Scenario 1: plaintext echo ---------------------------------------

struct EchoHandler {
    disconnected_tx: mpsc::Sender<()>,
}

impl Handler for EchoHandler {
    fn receive(&mut self, endpoint: &EndpointRef, buf: &mut NetBuffer) {
        let data = buf.take();
        endpoint.send(&data).unwrap();
    }

    fn disconnected(&mut self, _endpoint: &EndpointRef) {
        let _ = self.disconnected_tx.send(());
    }
}

#[test]
fn plaintext_echo_round_trip_and_single_disconnect() {
    let rt = isolated_runtime();
    let (tx, rx) = mpsc::channel();
    let factory = move |_addr| -> Box<dyn Handler> {
        Box::new(EchoHandler {
            disconnected_tx: tx.clone(),
        })
    };
    let listener = rt
        .add_listener(base_listener_config(TransportFactoryConfig::default()), Arc::new(factory))
        .unwrap();
    let addr = listener.local_addr.unwrap();

    let mut sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    sock.write_all(b"ping\n").unwrap();
    let mut buf = [0u8; 5];
    sock.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping\n");

    drop(sock);
    rx.recv_timeout(Duration::from_secs(2))
        .expect("handler should observe exactly one disconnect");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    rt.shutdown();
}

// --- Scenario 2: TLS single-record exchange ---------------------------

#[cfg(feature = "tls")]
mod tls_scenarios {
    use super::*;
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

    fn self_signed() -> (Vec<u8>, Vec<u8>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = certified.cert.der().to_vec();
        let key_der = certified.key_pair.serialize_der();
        (cert_der, key_der)
    }

    fn tls_client(addr: std::net::SocketAddr, cert_der: Vec<u8>) -> StreamOwned<ClientConnection, TcpStream> {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(cert_der)).unwrap();
        let config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from("localhost").unwrap();
        let conn = ClientConnection::new(config, server_name).unwrap();
        let sock = TcpStream::connect(addr).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        StreamOwned::new(conn, sock)
    }

    struct TlsEchoHandler {
        handshake_tx: mpsc::Sender<()>,
    }

    impl Handler for TlsEchoHandler {
        fn receive(&mut self, endpoint: &EndpointRef, buf: &mut NetBuffer) {
            let data = buf.take();
            endpoint.send(&data).unwrap();
        }

        fn on_handshake_complete(&mut self, _endpoint: &EndpointRef, _alpn: Option<&[u8]>) {
            let _ = self.handshake_tx.send(());
        }

        fn disconnected(&mut self, _endpoint: &EndpointRef) {}
    }

    #[test]
    fn tls_handshake_completes_and_application_data_round_trips() {
        let (cert_der, key_der) = self_signed();
        let rt = isolated_runtime();
        let (handshake_tx, handshake_rx) = mpsc::channel();
        let factory = move |_addr| -> Box<dyn Handler> {
            Box::new(TlsEchoHandler {
                handshake_tx: handshake_tx.clone(),
            })
        };
        let transport = TransportFactoryConfig {
            secure: true,
            cert_chain_der: Some(vec![cert_der.clone()]),
            private_key_der: Some(key_der),
            ..Default::default()
        };
        let listener = rt.add_listener(base_listener_config(transport), Arc::new(factory)).unwrap();
        let addr = listener.local_addr.unwrap();

        let mut tls = tls_client(addr, cert_der);
        tls.write_all(b"hello").unwrap();
        handshake_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("server should report handshake completion");

        let mut echoed = [0u8; 5];
        tls.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello");

        rt.shutdown();
    }

    // --- Scenario 3: STARTTLS upgrade mid-connection -------------------

    struct StartTlsHandler {
        hello_tx: mpsc::Sender<Vec<u8>>,
        started_tls: bool,
    }

    impl Handler for StartTlsHandler {
        fn receive(&mut self, endpoint: &EndpointRef, buf: &mut NetBuffer) {
            let data = buf.take();
            if !self.started_tls {
                if data == b"STARTTLS\r\n" {
                    endpoint.send(b"OK\r\n").unwrap();
                    endpoint.start_tls(None).unwrap();
                    self.started_tls = true;
                }
            } else {
                let _ = self.hello_tx.send(data);
            }
        }

        fn disconnected(&mut self, _endpoint: &EndpointRef) {}
    }

    #[test]
    fn starttls_upgrades_a_plaintext_connection_in_place() {
        let (cert_der, key_der) = self_signed();
        let rt = isolated_runtime();
        let (hello_tx, hello_rx) = mpsc::channel();
        let factory = move |_addr| -> Box<dyn Handler> {
            Box::new(StartTlsHandler {
                hello_tx: hello_tx.clone(),
                started_tls: false,
            })
        };
        let transport = TransportFactoryConfig {
            secure: true,
            cert_chain_der: Some(vec![cert_der.clone()]),
            private_key_der: Some(key_der),
            ..Default::default()
        };
        let mut config = base_listener_config(transport);
        config.starttls = true;
        let listener = rt.add_listener(config, Arc::new(factory)).unwrap();
        let addr = listener.local_addr.unwrap();

        let mut plain = TcpStream::connect(addr).unwrap();
        plain.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        plain.write_all(b"STARTTLS\r\n").unwrap();
        let mut ack = [0u8; 4];
        plain.read_exact(&mut ack).unwrap();
        assert_eq!(&ack, b"OK\r\n");

        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(cert_der)).unwrap();
        let client_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from("localhost").unwrap();
        let conn = ClientConnection::new(client_config, server_name).unwrap();
        let mut tls = StreamOwned::new(conn, plain);
        tls.write_all(b"hello").unwrap();

        let received = hello_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("server should observe the upgraded plaintext");
        assert_eq!(received, b"hello");

        rt.shutdown();
    }

    // --- Scenario: immediately-secure outbound connect ------------------

    struct SecureEchoHandler;

    impl Handler for SecureEchoHandler {
        fn receive(&mut self, endpoint: &EndpointRef, buf: &mut NetBuffer) {
            let data = buf.take();
            endpoint.send(&data).unwrap();
        }

        fn disconnected(&mut self, _endpoint: &EndpointRef) {}
    }

    struct ClientTlsHandler {
        connected_tx: mpsc::Sender<()>,
        echoed_tx: mpsc::Sender<Vec<u8>>,
    }

    impl Handler for ClientTlsHandler {
        fn receive(&mut self, _endpoint: &EndpointRef, buf: &mut NetBuffer) {
            let _ = self.echoed_tx.send(buf.take());
        }

        fn on_connected(&mut self, endpoint: &EndpointRef) {
            let _ = self.connected_tx.send(());
            endpoint.send(b"hello").unwrap();
        }

        fn disconnected(&mut self, _endpoint: &EndpointRef) {}
    }

    #[test]
    fn immediately_secure_client_connect_emits_client_hello_and_completes_handshake() {
        // `connect_tcp`'s immediately-secure path has no server-name
        // parameter (unlike `start_tls`), so it verifies against the peer's
        // IP address; the certificate needs a matching IP SAN.
        let certified = rcgen::generate_simple_self_signed(vec!["127.0.0.1".into()]).unwrap();
        let cert_der = certified.cert.der().to_vec();
        let key_der = certified.key_pair.serialize_der();
        let rt = isolated_runtime();
        let server_factory = move |_addr| -> Box<dyn Handler> { Box::new(SecureEchoHandler) };
        let server_transport = TransportFactoryConfig {
            secure: true,
            cert_chain_der: Some(vec![cert_der.clone()]),
            private_key_der: Some(key_der),
            ..Default::default()
        };
        let listener = rt
            .add_listener(base_listener_config(server_transport), Arc::new(server_factory))
            .unwrap();
        let addr = listener.local_addr.unwrap();

        let client_transport = Arc::new(
            TransportFactory::new(TransportFactoryConfig {
                secure: true,
                trusted_roots_der: Some(vec![cert_der]),
                ..Default::default()
            })
            .unwrap(),
        );
        let (connected_tx, connected_rx) = mpsc::channel();
        let (echoed_tx, echoed_rx) = mpsc::channel();
        let handler = Box::new(ClientTlsHandler { connected_tx, echoed_tx });
        let _endpoint = rt
            .connect_tcp(addr, handler, Some(client_transport), true, None)
            .unwrap();

        connected_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("the socket connect should still complete even though TLS is secured immediately");
        let echoed = echoed_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("a ClientHello must have been sent for the handshake to ever complete");
        assert_eq!(echoed, b"hello");

        rt.shutdown();
    }
}

// --- Scenario 4: inbound backpressure ---------------------------------

struct SilentHandler {
    disconnected_tx: mpsc::Sender<()>,
}

impl Handler for SilentHandler {
    fn receive(&mut self, _endpoint: &EndpointRef, _buf: &mut NetBuffer) {
        // Never drains: forces the incoming buffer toward its cap.
    }

    fn disconnected(&mut self, _endpoint: &EndpointRef) {
        let _ = self.disconnected_tx.send(());
    }
}

#[test]
fn oversized_burst_overflows_the_incoming_buffer_and_closes() {
    let rt = isolated_runtime();
    let (tx, rx) = mpsc::channel();
    let factory = move |_addr| -> Box<dyn Handler> {
        Box::new(SilentHandler {
            disconnected_tx: tx.clone(),
        })
    };
    let transport = TransportFactoryConfig {
        max_net_in_size: Some(1024),
        ..Default::default()
    };
    let listener = rt.add_listener(base_listener_config(transport), Arc::new(factory)).unwrap();
    let addr = listener.local_addr.unwrap();

    let mut sock = TcpStream::connect(addr).unwrap();
    sock.write_all(&vec![b'x'; 2048]).unwrap();

    rx.recv_timeout(Duration::from_secs(2))
        .expect("overflow should close the endpoint exactly once");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    rt.shutdown();
}

// --- Scenario 5: timer fires on the owning worker, is cancellable -----

struct NoopHandler;

impl Handler for NoopHandler {
    fn receive(&mut self, _endpoint: &EndpointRef, _buf: &mut NetBuffer) {}
    fn disconnected(&mut self, _endpoint: &EndpointRef) {}
}

struct TimerHandler {
    fire_tx: mpsc::Sender<std::thread::ThreadId>,
    owner_thread: Arc<Mutex<Option<std::thread::ThreadId>>>,
}

impl Handler for TimerHandler {
    fn receive(&mut self, _endpoint: &EndpointRef, _buf: &mut NetBuffer) {}
    fn disconnected(&mut self, _endpoint: &EndpointRef) {}

    fn on_connected(&mut self, endpoint: &EndpointRef) {
        *self.owner_thread.lock().unwrap() = Some(std::thread::current().id());
        let tx = self.fire_tx.clone();
        endpoint.scheduler().schedule_timer(50, move || {
            let _ = tx.send(std::thread::current().id());
        });
    }
}

struct CancelHandler {
    fired_tx: mpsc::Sender<()>,
}

impl Handler for CancelHandler {
    fn receive(&mut self, _endpoint: &EndpointRef, _buf: &mut NetBuffer) {}
    fn disconnected(&mut self, _endpoint: &EndpointRef) {}

    fn on_connected(&mut self, endpoint: &EndpointRef) {
        let tx = self.fired_tx.clone();
        let handle = endpoint.scheduler().schedule_timer(50, move || {
            let _ = tx.send(());
        });
        handle.cancel();
    }
}

#[test]
fn timer_fires_on_owning_worker_thread_and_is_cancellable() {
    let rt = isolated_runtime();
    let factory = |_addr| -> Box<dyn Handler> { Box::new(NoopHandler) };
    let listener = rt.add_listener(base_listener_config(TransportFactoryConfig::default()), Arc::new(factory)).unwrap();
    let addr = listener.local_addr.unwrap();

    let (fire_tx, fire_rx) = mpsc::channel();
    let owner_thread = Arc::new(Mutex::new(None));
    let handler = Box::new(TimerHandler {
        fire_tx,
        owner_thread: Arc::clone(&owner_thread),
    });
    let _endpoint = rt.connect_tcp(addr, handler, None, false, None).unwrap();
    let fired_on = fire_rx
        .recv_timeout(Duration::from_millis(500))
        .expect("timer should fire within 500ms");
    assert_eq!(Some(fired_on), *owner_thread.lock().unwrap());

    let (cancel_tx, cancel_rx) = mpsc::channel();
    let handler2 = Box::new(CancelHandler { fired_tx: cancel_tx });
    let _endpoint2 = rt.connect_tcp(addr, handler2, None, false, None).unwrap();
    assert!(
        cancel_rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "cancelled timer must not fire"
    );

    rt.shutdown();
}

// --- Scenario 6: accept-time rate limiting -----------------------------

#[test]
fn max_connections_per_ip_rejects_beyond_the_limit() {
    let rt = isolated_runtime();
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_clone = Arc::clone(&accepted);
    let factory = move |_addr| -> Box<dyn Handler> {
        accepted_clone.fetch_add(1, Ordering::SeqCst);
        Box::new(NoopHandler)
    };
    let mut config = base_listener_config(TransportFactoryConfig::default());
    config.max_connections_per_ip = Some(1);
    let listener = rt.add_listener(config, Arc::new(factory)).unwrap();
    let addr = listener.local_addr.unwrap();

    let first = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    let mut second = TcpStream::connect(addr).unwrap();
    second.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    let mut buf = [0u8; 1];
    let read_result = second.read(&mut buf);
    assert!(
        matches!(read_result, Ok(0)) || read_result.is_err(),
        "the second connection from the same IP should be rejected"
    );
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(accepted.load(Ordering::SeqCst), 1, "handler must not run for a rejected connection");

    drop(first);
    std::thread::sleep(Duration::from_millis(100));

    let third = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(
        accepted.load(Ordering::SeqCst),
        2,
        "the per-IP count must have been given back once the first connection disconnected"
    );

    drop(third);
    rt.shutdown();
}

#[allow(dead_code)]
fn _assert_error_is_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<Error>();
    let _: Option<Arc<dyn ConnectionFactory>> = None;
}
