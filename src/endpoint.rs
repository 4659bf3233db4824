//! Endpoint addressing for the server and client.
//!
//! Endpoints are written as URLs:
//! - `vsock://any:5555` - any context ID, port 5555 (the default listener)
//! - `vsock://103:5555` - guest with CID 103
//! - `tcp://127.0.0.1:5555` - TCP, for hosts without vsock
//!
//! Sockets are created through `socket2` so both families share one code path.

use socket2::{Domain, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Well-known service port of the command server.
pub const DEFAULT_PORT: u32 = 5555;

/// Wildcard context ID, accepts connections from any peer.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const CID_ANY: u32 = libc::VMADDR_CID_ANY;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const CID_ANY: u32 = u32::MAX;

/// Context ID of the hypervisor host.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const CID_HOST: u32 = libc::VMADDR_CID_HOST;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const CID_HOST: u32 = 2;

/// A socket address the server listens on or a client connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// AF_VSOCK address.
    Vsock { cid: u32, port: u32 },
    /// TCP address.
    Tcp(SocketAddr),
}

impl Endpoint {
    /// The default listening endpoint: any CID on the well-known port.
    pub fn default_listen() -> Self {
        Endpoint::Vsock {
            cid: CID_ANY,
            port: DEFAULT_PORT,
        }
    }

    /// Replace the port, keeping the address family and host.
    pub fn with_port(self, port: u32) -> Result<Self, EndpointError> {
        match self {
            Endpoint::Vsock { cid, .. } => Ok(Endpoint::Vsock { cid, port }),
            Endpoint::Tcp(mut addr) => {
                let port = u16::try_from(port).map_err(|_| EndpointError::InvalidPort)?;
                addr.set_port(port);
                Ok(Endpoint::Tcp(addr))
            }
        }
    }

    /// Convert a raw socket address back into an endpoint, if the family is known.
    pub fn from_sock_addr(addr: &SockAddr) -> Option<Self> {
        if let Some(addr) = addr.as_socket() {
            return Some(Endpoint::Tcp(addr));
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some((cid, port)) = addr.as_vsock_address() {
            return Some(Endpoint::Vsock { cid, port });
        }

        None
    }

    /// Create a blocking listening socket bound to this endpoint.
    ///
    /// The socket has `SO_REUSEADDR` set so a restarted server can rebind
    /// while old connections linger.
    pub fn bind(&self, backlog: i32) -> io::Result<Socket> {
        let socket = Socket::new(self.domain()?, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&self.sock_addr()?)?;
        socket.listen(backlog)?;
        Ok(socket)
    }

    /// Open a blocking stream socket connected to this endpoint.
    pub fn connect(&self, timeout: Duration) -> io::Result<Socket> {
        let socket = Socket::new(self.domain()?, Type::STREAM, None)?;
        socket.connect_timeout(&self.sock_addr()?, timeout)?;
        Ok(socket)
    }

    fn domain(&self) -> io::Result<Domain> {
        match self {
            Endpoint::Tcp(SocketAddr::V4(_)) => Ok(Domain::IPV4),
            Endpoint::Tcp(SocketAddr::V6(_)) => Ok(Domain::IPV6),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Endpoint::Vsock { .. } => Ok(Domain::VSOCK),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Endpoint::Vsock { .. } => Err(vsock_unsupported()),
        }
    }

    fn sock_addr(&self) -> io::Result<SockAddr> {
        match self {
            Endpoint::Tcp(addr) => Ok(SockAddr::from(*addr)),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Endpoint::Vsock { cid, port } => Ok(SockAddr::vsock(*cid, *port)),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Endpoint::Vsock { .. } => Err(vsock_unsupported()),
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn vsock_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "vsock endpoints are only supported on Linux",
    )
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Vsock { cid, port } if *cid == CID_ANY => write!(f, "vsock://any:{port}"),
            Endpoint::Vsock { cid, port } => write!(f, "vsock://{cid}:{port}"),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| EndpointError::MissingScheme(s.to_string()))?;

        match scheme {
            "vsock" => {
                let (cid, port) = rest.rsplit_once(':').ok_or(EndpointError::InvalidPort)?;
                let cid = match cid {
                    "any" => CID_ANY,
                    "host" => CID_HOST,
                    other => other
                        .parse()
                        .map_err(|_| EndpointError::InvalidCid(other.to_string()))?,
                };
                let port = port.parse().map_err(|_| EndpointError::InvalidPort)?;
                Ok(Endpoint::Vsock { cid, port })
            }
            "tcp" => rest
                .parse()
                .map(Endpoint::Tcp)
                .map_err(|_| EndpointError::InvalidAddress(rest.to_string())),
            other => Err(EndpointError::UnknownScheme(other.to_string())),
        }
    }
}

/// Endpoint parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    MissingScheme(String),
    UnknownScheme(String),
    InvalidCid(String),
    InvalidPort,
    InvalidAddress(String),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::MissingScheme(s) => {
                write!(f, "endpoint '{s}' has no scheme (expected vsock:// or tcp://)")
            }
            EndpointError::UnknownScheme(s) => write!(f, "unknown endpoint scheme '{s}'"),
            EndpointError::InvalidCid(s) => write!(f, "invalid vsock context ID '{s}'"),
            EndpointError::InvalidPort => write!(f, "invalid port number"),
            EndpointError::InvalidAddress(s) => write!(f, "invalid TCP address '{s}'"),
        }
    }
}

impl std::error::Error for EndpointError {}
