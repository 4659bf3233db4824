//! Per-connection session handling.
//!
//! A session reads a single request, answers it and closes:
//!
//! ```text
//! AWAIT_COMMAND --(0 bytes / read error)--------------------> CLOSED
//!       |
//!       +--> QUIT | EMPTY | EXECUTE --> RESPOND --> CLOSED
//! ```
//!
//! The connection is owned by the handler and dropped on every path.

use crate::executor::Executor;
use crate::protocol::{Request, Response};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Serves one request per connection.
#[derive(Debug, Clone)]
pub struct SessionHandler {
    executor: Arc<Executor>,
    request_buffer: usize,
}

impl SessionHandler {
    pub fn new(executor: Executor, request_buffer: usize) -> Self {
        Self {
            executor: Arc::new(executor),
            request_buffer,
        }
    }

    /// Run a session to completion. Failures end the session silently
    /// (after logging) and never reach the caller.
    pub async fn handle<S>(&self, mut conn: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; self.request_buffer];

        let n = match conn.read(&mut buffer).await {
            Ok(0) => {
                info!("Client disconnected (no command)");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to receive command");
                return;
            }
        };

        let reply = match Request::parse(&buffer[..n]) {
            Request::Quit => {
                debug!("Quit requested");
                Bytes::from_static(Response::quit())
            }
            Request::Empty => Bytes::from_static(Response::empty()),
            Request::Execute(command) => {
                info!(command = %String::from_utf8_lossy(&command), "Executing");
                let result = self.executor.execute(&command).await;
                let reply = Response::executed(&result).freeze();
                info!(
                    exit_code = result.exit_code,
                    output_bytes = result.output.len(),
                    "Command completed"
                );
                reply
            }
        };

        match send_all(&mut conn, &reply).await {
            Ok(sent) => {
                debug!(sent, "Reply sent");
                // Best effort; the drop below closes the socket regardless.
                let _ = conn.shutdown().await;
            }
            Err((sent, e)) => {
                warn!(sent, total = reply.len(), error = %e, "Failed to send reply");
            }
        }
    }
}

/// Write all of `data`, looping over partial writes.
///
/// Returns the number of bytes sent, or the count reached before the first
/// failing write. A write accepting zero bytes counts as a failure.
async fn send_all<W>(writer: &mut W, data: &[u8]) -> Result<usize, (usize, io::Error)>
where
    W: AsyncWrite + Unpin,
{
    let mut total_sent = 0;

    while total_sent < data.len() {
        match writer.write(&data[total_sent..]).await {
            Ok(0) => return Err((total_sent, io::ErrorKind::WriteZero.into())),
            Ok(n) => total_sent += n,
            Err(e) => return Err((total_sent, e)),
        }
    }

    Ok(total_sent)
}
