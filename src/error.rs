//! Categorized error type at the module boundary.
//!
//! Every I/O or TLS failure inside the reactor is converted into one of the
//! variants below before it reaches a [`crate::handler::Handler`]. Callers
//! above this boundary never see a raw [`std::io::Error`] or
//! [`rustls::Error`].

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Errors surfaced by the reactor, transport and TLS layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A read or write on a socket failed.
    #[error("transport I/O error{}: {source}", addr_suffix(*addr))]
    TransportIo {
        addr: Option<SocketAddr>,
        #[source]
        source: io::Error,
    },

    /// The peer closed the connection or sent a reset.
    #[error("connection lost{}: {reason}", addr_suffix(*addr))]
    ConnectionLost {
        addr: Option<SocketAddr>,
        reason: String,
    },

    /// An outbound connect attempt failed.
    #[error("connect to {addr} failed: {source}")]
    ConnectError {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The TLS engine reported failure or an unexpected close during handshake.
    #[error("TLS error{}: {message}", addr_suffix(*addr))]
    TlsError {
        addr: Option<SocketAddr>,
        message: String,
    },

    /// The incoming buffer would have exceeded `max_net_in_size`.
    #[error("incoming buffer{} would exceed max_net_in_size ({limit} bytes)", addr_suffix(*addr))]
    EndpointOverflow {
        addr: Option<SocketAddr>,
        limit: usize,
    },

    /// A rate limiter or CIDR filter denied a connection before the handler ran.
    #[error("connection from {addr} rejected by policy: {reason}")]
    PolicyReject { addr: SocketAddr, reason: String },

    /// Invalid keystore/certificate material or listener configuration at startup.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

fn addr_suffix(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => format!(" on {addr}"),
        None => String::new(),
    }
}

impl Error {
    pub fn transport_io(addr: Option<SocketAddr>, source: io::Error) -> Error {
        Error::TransportIo { addr, source }
    }

    pub fn connection_lost(addr: Option<SocketAddr>, reason: impl Into<String>) -> Error {
        Error::ConnectionLost {
            addr,
            reason: reason.into(),
        }
    }

    pub fn connect_error(addr: SocketAddr, source: io::Error) -> Error {
        Error::ConnectError { addr, source }
    }

    pub fn tls(addr: Option<SocketAddr>, message: impl Into<String>) -> Error {
        Error::TlsError {
            addr,
            message: message.into(),
        }
    }

    pub fn overflow(addr: Option<SocketAddr>, limit: usize) -> Error {
        Error::EndpointOverflow { addr, limit }
    }

    pub fn policy_reject(addr: SocketAddr, reason: impl Into<String>) -> Error {
        Error::PolicyReject {
            addr,
            reason: reason.into(),
        }
    }

    pub fn config(message: impl fmt::Display) -> Error {
        Error::ConfigError(message.to_string())
    }

    /// Remote address associated with this error, if any.
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            Error::TransportIo { addr, .. }
            | Error::ConnectionLost { addr, .. }
            | Error::TlsError { addr, .. }
            | Error::EndpointOverflow { addr, .. } => *addr,
            Error::ConnectError { addr, .. } | Error::PolicyReject { addr, .. } => Some(*addr),
            Error::ConfigError(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
