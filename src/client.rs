//! Host-side client for running one command on a server.
//!
//! Connects (retrying a few times, since a freshly booted guest may not be
//! listening yet), sends the command line, reads until the server closes
//! and splits the reply at its trailer.

use crate::config::ClientSettings;
use crate::endpoint::Endpoint;
use crate::protocol::{Reply, TRAILER_PREFIX};
use bytes::Bytes;
use socket2::Socket;
use std::fmt;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Exit code reported when no connection could be made or the request
/// could not be sent.
pub const EXIT_CONNECT_FAILED: i32 = 255;

/// Exit code reported when the connection broke before the trailer arrived.
pub const EXIT_CONNECTION_LOST: i32 = 254;

const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(1);
const RECV_CHUNK: usize = 4096;

/// Client for the command protocol
pub struct Client {
    endpoint: Endpoint,
    timeout: Duration,
    receive_timeout: Duration,
    retries: u32,
}

impl Client {
    pub fn new(settings: &ClientSettings) -> Self {
        Self {
            endpoint: settings.connect,
            timeout: settings.timeout,
            receive_timeout: settings.timeout.max(MIN_RECEIVE_TIMEOUT),
            retries: settings.retries.max(1),
        }
    }

    /// Run `command` remotely and return its output and exit code.
    pub fn run(&self, command: &str) -> Result<Reply, ClientError> {
        debug!(endpoint = %self.endpoint, command, "Running remote command");

        let mut socket = self.connect_with_retries()?;
        socket
            .set_read_timeout(Some(self.receive_timeout))
            .map_err(ClientError::Io)?;
        socket
            .set_write_timeout(Some(self.receive_timeout))
            .map_err(ClientError::Io)?;

        socket
            .write_all(format!("{command}\n").as_bytes())
            .map_err(ClientError::Io)?;

        let (data, ending) = receive(&mut socket);

        match ending {
            Ending::Closed => {}
            // A slow command is not a lost guest: keep what arrived
            Ending::TimedOut => {
                warn!(
                    received = data.len(),
                    timeout = ?self.receive_timeout,
                    "Timed out while receiving"
                );
            }
            Ending::Failed(e) if !contains(&data, TRAILER_PREFIX) => {
                error!(error = %e, "Connection lost");
                return Err(ClientError::ConnectionLost {
                    partial: Bytes::from(data),
                    source: e,
                });
            }
            Ending::Failed(e) => {
                warn!(error = %e, "Error after reply trailer, keeping reply");
            }
        }

        // A reply without a trailer is taken as success
        Ok(Reply::parse(&data).unwrap_or_else(|| Reply {
            output: Bytes::from(data),
            exit_code: 0,
        }))
    }

    fn connect_with_retries(&self) -> Result<Socket, ClientError> {
        let timeout = self.timeout.max(MIN_CONNECT_TIMEOUT);
        let mut last_error = None;

        for attempt in 1..=self.retries {
            match self.endpoint.connect(timeout) {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint,
                        attempt,
                        retries = self.retries,
                        error = %e,
                        "Connection failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < self.retries {
                thread::sleep(RETRY_DELAY);
            }
        }

        Err(ClientError::Connect {
            attempts: self.retries,
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no attempts made")),
        })
    }
}

/// How reading a reply came to an end.
#[derive(Debug)]
enum Ending {
    /// The server closed the connection.
    Closed,
    /// The read timeout expired.
    TimedOut,
    /// The connection failed (reset, broken pipe, ...).
    Failed(io::Error),
}

/// Read until end-of-stream, the read timeout, or a connection error.
fn receive(socket: &mut Socket) -> (Vec<u8>, Ending) {
    let mut data = Vec::new();
    let mut chunk = [0u8; RECV_CHUNK];

    loop {
        match socket.read(&mut chunk) {
            Ok(0) => return (data, Ending::Closed),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) => match e.kind() {
                io::ErrorKind::Interrupted => continue,
                // SO_RCVTIMEO expiry surfaces as EAGAIN on Linux
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    return (data, Ending::TimedOut)
                }
                _ => return (data, Ending::Failed(e)),
            },
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    Connect { attempts: u32, source: io::Error },
    ConnectionLost { partial: Bytes, source: io::Error },
    Io(io::Error),
}

impl ClientError {
    /// Process exit code matching this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Connect { .. } | ClientError::Io(_) => EXIT_CONNECT_FAILED,
            ClientError::ConnectionLost { .. } => EXIT_CONNECTION_LOST,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect { attempts, source } => {
                write!(f, "ERROR: Failed to connect after {attempts} retries: {source}")
            }
            ClientError::ConnectionLost { partial, source } => write!(
                f,
                "ERROR: Connection lost: {source}\nPartial output: {}",
                String::from_utf8_lossy(partial)
            ),
            ClientError::Io(e) => write!(f, "ERROR: {e}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Connect { source, .. } | ClientError::ConnectionLost { source, .. } => {
                Some(source)
            }
            ClientError::Io(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn settings(endpoint: Endpoint, retries: u32) -> ClientSettings {
        ClientSettings {
            connect: endpoint,
            timeout: Duration::from_secs(1),
            retries,
        }
    }

    /// One-shot fake server replying with `reply` after reading a line.
    fn fake_server(reply: &'static [u8]) -> (Endpoint, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap());

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = vec![0u8; 256];
            let n = stream.read(&mut request).unwrap();
            request.truncate(n);
            stream.write_all(reply).unwrap();
            request
        });

        (endpoint, handle)
    }

    #[test]
    fn test_run_parses_reply() {
        let (endpoint, server) = fake_server(b"hello\nEXIT_CODE: 3\n");
        let reply = Client::new(&settings(endpoint, 1)).run("echo hello").unwrap();

        assert_eq!(server.join().unwrap(), b"echo hello\n");
        assert_eq!(reply.output, Bytes::from_static(b"hello\n"));
        assert_eq!(reply.exit_code, 3);
    }

    #[test]
    fn test_reply_without_trailer_is_success() {
        let (endpoint, server) = fake_server(b"just text\n");
        let reply = Client::new(&settings(endpoint, 1)).run("x").unwrap();
        server.join().unwrap();

        assert_eq!(reply.output, Bytes::from_static(b"just text\n"));
        assert_eq!(reply.exit_code, 0);
    }

    #[test]
    fn test_connect_failure_after_retries() {
        // Grab a free port, then release it so nothing listens there
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let endpoint: Endpoint = format!("tcp://127.0.0.1:{port}").parse().unwrap();

        let err = Client::new(&settings(endpoint, 2)).run("true").unwrap_err();
        assert!(matches!(err, ClientError::Connect { attempts: 2, .. }));
        assert_eq!(err.exit_code(), EXIT_CONNECT_FAILED);
        assert!(err.to_string().starts_with("ERROR: Failed to connect after 2 retries"));
    }

    #[test]
    fn test_error_exit_codes() {
        let lost = ClientError::ConnectionLost {
            partial: Bytes::from_static(b"part"),
            source: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        };
        assert_eq!(lost.exit_code(), EXIT_CONNECTION_LOST);
        assert!(lost.to_string().contains("Partial output: part"));

        let io = ClientError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "send failed"));
        assert_eq!(io.exit_code(), EXIT_CONNECT_FAILED);
    }

    #[test]
    fn test_receive_timeout_keeps_partial_output() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap());
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        // Sends part of a reply, then holds the connection open
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 256];
            let _ = stream.read(&mut request).unwrap();
            stream.write_all(b"partial").unwrap();
            let _ = done_rx.recv();
        });

        let mut client = Client::new(&settings(endpoint, 1));
        client.receive_timeout = Duration::from_millis(200);
        let reply = client.run("sleep 60").unwrap();

        assert_eq!(reply.output, Bytes::from_static(b"partial"));
        assert_eq!(reply.exit_code, 0);

        done_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_receive_timeout_after_trailer_uses_exit_code() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap());
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 256];
            let _ = stream.read(&mut request).unwrap();
            stream.write_all(b"out\nEXIT_CODE: 6\n").unwrap();
            let _ = done_rx.recv();
        });

        let mut client = Client::new(&settings(endpoint, 1));
        client.receive_timeout = Duration::from_millis(200);
        let reply = client.run("x").unwrap();

        assert_eq!(reply.output, Bytes::from_static(b"out\n"));
        assert_eq!(reply.exit_code, 6);

        done_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_reset_before_trailer_is_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap());

        // Close with unread request data pending, which makes Linux send RST
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(100));
            drop(stream);
        });

        let mut client = Client::new(&settings(endpoint, 1));
        client.receive_timeout = Duration::from_secs(5);
        let err = client.run("echo never read").unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, ClientError::ConnectionLost { .. }));
        assert_eq!(err.exit_code(), EXIT_CONNECTION_LOST);
    }

    #[test]
    fn test_contains() {
        assert!(contains(b"abcEXIT_CODE: 0\n", TRAILER_PREFIX));
        assert!(!contains(b"abc", TRAILER_PREFIX));
        assert!(!contains(b"", TRAILER_PREFIX));
    }
}
