//! `protonio` — a multi-protocol, event-driven network server core.
//!
//! Protocol logic is written against the transport-agnostic [`endpoint`]
//! abstraction: a central [`runtime::Runtime`] multiplexes TCP, UDP and TLS
//! I/O across a small pool of worker threads, each running one
//! [`reactor::SelectorLoop`] around a single `mio::Poll`. A dedicated
//! [`reactor::AcceptLoop`] accepts inbound connections and hands them to a
//! worker round-robin; a dedicated [`timer::ScheduledTimer`] thread delivers
//! deadline-based callbacks back onto the endpoint's own worker.
//!
//! Protocol grammars, persisted connection state, certificate issuance and
//! QUIC framing are out of scope: this crate is the reactor, the transport
//! and the TLS bridge underneath a protocol implementation, not the
//! protocol itself.

pub mod buffer;
pub mod clock;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod listener;
pub mod reactor;
pub mod runtime;
pub mod service;
pub mod timer;

#[cfg(feature = "tls")]
pub mod tls;

pub mod transport;

pub use buffer::NetBuffer;
pub use endpoint::{EndpointId, EndpointRef};
pub use error::{Error, Result};
pub use handler::{ConnectionFactory, DatagramFactory, DatagramHandler, Handler, UdpEndpointRef};
pub use listener::ListenerConfig;
pub use runtime::{BoundListener, ListenerId, Runtime, RuntimeConfig};
pub use service::Service;
pub use transport::{TransportFactory, TransportFactoryConfig};
