//! Command server listener.
//!
//! Binds the configured endpoint, accepts connections and hands each one to
//! the session handler. With `max_sessions = 1` sessions are served strictly
//! one after another; larger values run sessions as separate tasks, gated
//! by a semaphore.

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::executor::Executor;
use crate::session::SessionHandler;
use crate::transport::Listener;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info};

/// Pause after a failed accept, so persistent errors (e.g. EMFILE) do not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listen: Endpoint,
    backlog: i32,
    max_sessions: usize,
    handler: SessionHandler,
    session_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: &Config) -> Self {
        let executor = Executor::new(config.shell.clone(), config.output_capacity);

        Server {
            listen: config.listen,
            backlog: config.backlog,
            max_sessions: config.max_sessions,
            handler: SessionHandler::new(executor, config.request_buffer),
            session_limit: Arc::new(Semaphore::new(config.max_sessions)),
        }
    }

    /// Bind the endpoint and serve until Ctrl-C.
    ///
    /// A bind or listen failure is returned before any connection is accepted.
    pub async fn run(&self) -> io::Result<()> {
        let listener = Listener::bind(&self.listen, self.backlog)?;
        let bound = listener.local_endpoint().unwrap_or(self.listen);
        info!(endpoint = %bound, "Ready to accept connections");

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

        info!("Server shut down");
        Ok(())
    }

    /// Accept loop on an already bound listener; returns when `shutdown` completes.
    pub async fn serve<F>(&self, listener: Listener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Wait for a session slot
            let permit = tokio::select! {
                _ = &mut shutdown => return,
                permit = self.session_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => return,
                },
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => return,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer)) => {
                    info!(peer = %peer, "Connection accepted");

                    if self.max_sessions == 1 {
                        tokio::select! {
                            _ = &mut shutdown => return,
                            _ = self.handler.handle(conn) => {}
                        }
                        drop(permit);
                    } else {
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            handler.handle(conn).await;
                            drop(permit);
                        });
                    }
                }
                Err(e) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => return,
                        _ = accept_failed(&e) => {}
                    }
                }
            }
        }
    }
}

/// Log an accept failure and back off before the next attempt.
async fn accept_failed(e: &io::Error) {
    error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::{Action, ClientSettings};
    use std::net::SocketAddr;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn test_config(max_sessions: usize) -> Config {
        let loopback: Endpoint = "tcp://127.0.0.1:0".parse().unwrap();
        Config {
            action: Action::Serve,
            listen: loopback,
            backlog: 5,
            max_sessions,
            shell: "/bin/sh".into(),
            request_buffer: 4096,
            output_capacity: 64,
            client: ClientSettings {
                connect: loopback,
                timeout: Duration::from_secs(5),
                retries: 1,
            },
            log_level: "info".to_string(),
        }
    }

    /// Start a server on an ephemeral port; dropping the sender stops it.
    fn start(max_sessions: usize) -> (SocketAddr, oneshot::Sender<()>) {
        let config = test_config(max_sessions);
        let listener = Listener::bind(&config.listen, config.backlog).unwrap();
        let addr = match listener.local_endpoint().unwrap() {
            Endpoint::Tcp(addr) => addr,
            other => panic!("unexpected: {:?}", other),
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = Server::new(&config);
            server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await;
        });

        (addr, stop_tx)
    }

    async fn request(addr: SocketAddr, data: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(data).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_end_to_end_scenarios() {
        let (addr, _stop) = start(1);

        assert_eq!(request(addr, b"echo hello\n").await, b"hello\nEXIT_CODE: 0\n");
        assert_eq!(request(addr, b"false\n").await, b"EXIT_CODE: 1\n");
        assert_eq!(request(addr, b"nonexistent-cmd-xyz\n").await, b"EXIT_CODE: 127\n");
        assert_eq!(request(addr, b"QUIT\n").await, b"OK\nEXIT_CODE: 0\n");
        assert_eq!(request(addr, b"EXIT\n").await, b"OK\nEXIT_CODE: 0\n");
        assert_eq!(request(addr, b"\n").await, b"EXIT_CODE: 0\n");
    }

    #[tokio::test]
    async fn test_truncation_over_the_wire() {
        let (addr, _stop) = start(1);

        // output_capacity is 64, so 63 bytes survive
        let reply = request(addr, b"seq 1 1000; exit 2\n").await;
        let expected: Vec<u8> = (1..=1000)
            .flat_map(|n| format!("{n}\n").into_bytes())
            .take(63)
            .chain(b"EXIT_CODE: 2\n".iter().copied())
            .collect();
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn test_zero_byte_session_then_next_client() {
        let (addr, _stop) = start(1);

        // Connect and leave without sending anything: no reply
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());

        // The server keeps serving
        assert_eq!(request(addr, b"echo again\n").await, b"again\nEXIT_CODE: 0\n");
    }

    #[tokio::test]
    async fn test_one_command_per_connection() {
        let (addr, _stop) = start(1);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"echo first\n").await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"first\nEXIT_CODE: 0\n");

        // Server already closed its side; anything further is ignored
        let _ = stream.write_all(b"echo second\n").await;
        let mut more = Vec::new();
        let _ = stream.read_to_end(&mut more).await;
        assert!(more.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_sessions_are_isolated() {
        let (addr, _stop) = start(4);

        // A slow session does not hold up others
        let slow = tokio::spawn(request(addr, b"sleep 1; echo slow\n"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let fast = tokio::time::timeout(Duration::from_millis(800), request(addr, b"echo fast\n"))
            .await
            .expect("fast session should not wait for the slow one");
        assert_eq!(fast, b"fast\nEXIT_CODE: 0\n");

        assert_eq!(slow.await.unwrap(), b"slow\nEXIT_CODE: 0\n");
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let (addr, stop) = start(1);
        assert_eq!(request(addr, b"echo up\n").await, b"up\nEXIT_CODE: 0\n");

        drop(stop);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_against_server() {
        let (addr, _stop) = start(1);
        let settings = ClientSettings {
            connect: Endpoint::Tcp(addr),
            timeout: Duration::from_secs(5),
            retries: 1,
        };

        let reply = tokio::task::spawn_blocking(move || Client::new(&settings).run("printf hi; exit 5"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply.output[..], b"hi");
        assert_eq!(reply.exit_code, 5);
    }

    #[tokio::test]
    async fn test_accept_failure_backs_off() {
        let e = io::Error::from_raw_os_error(libc::EMFILE);
        let started = Instant::now();
        accept_failed(&e).await;
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(1);
        config.listen = Endpoint::Tcp(taken.local_addr().unwrap());

        // SO_REUSEADDR does not allow binding over an active listener
        assert!(Server::new(&config).run().await.is_err());
    }
}
