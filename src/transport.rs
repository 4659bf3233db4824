//! Async transport over `socket2` sockets.
//!
//! Tokio has no native vsock types, so both vsock and TCP sockets are put
//! into non-blocking mode and registered with the reactor through
//! `AsyncFd`. `Connection` then implements `AsyncRead`/`AsyncWrite` so the
//! session handler stays independent of the address family.

use crate::endpoint::Endpoint;
use socket2::Socket;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bound, listening socket.
pub struct Listener {
    inner: AsyncFd<Socket>,
}

impl Listener {
    /// Bind and listen on `endpoint`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(endpoint: &Endpoint, backlog: i32) -> io::Result<Self> {
        let socket = endpoint.bind(backlog)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        let addr = self.inner.get_ref().local_addr()?;
        Endpoint::from_sock_addr(&addr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "unknown address family")
        })
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> io::Result<(Connection, PeerAddr)> {
        loop {
            let mut guard = self.inner.readable().await?;

            match guard.try_io(|inner| inner.get_ref().accept()) {
                Ok(Ok((socket, addr))) => {
                    let peer = PeerAddr(Endpoint::from_sock_addr(&addr));
                    return Ok((Connection::new(socket)?, peer));
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Remote address of an accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub Option<Endpoint>);

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(Endpoint::Vsock { cid, port }) => write!(f, "CID={cid} PORT={port}"),
            Some(Endpoint::Tcp(addr)) => write!(f, "{addr}"),
            None => write!(f, "unknown"),
        }
    }
}

/// One accepted client stream. Dropping it closes the socket.
pub struct Connection {
    inner: AsyncFd<Socket>,
}

impl Connection {
    fn new(socket: Socket) -> io::Result<Self> {
        // Accepted sockets do not inherit O_NONBLOCK on Linux.
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;

            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.get_ref().shutdown(Shutdown::Write))
    }
}
