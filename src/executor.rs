//! Shell command execution with bounded output capture.
//!
//! Each command runs as `<shell> -c <command>` with the server's privileges.
//! Running arbitrary commands for whoever can reach the endpoint is the
//! purpose of the service, so no sandboxing is applied here.
//!
//! Only standard output is captured. Standard error is inherited by the
//! server process and shows up in its console.

use bytes::{Bytes, BytesMut};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code reported when a command could not run to normal completion.
pub const EXIT_SENTINEL: i32 = 127;

/// Default output buffer capacity. At most `capacity - 1` bytes are captured.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 16 * 1024;

/// Default shell used to interpret command lines.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Output placed in the result when the shell itself could not be spawned.
pub const SPAWN_FAILURE_OUTPUT: &[u8] = b"ERROR: Failed to execute command\n";

/// Size of each read from the child's stdout pipe.
const READ_CHUNK: usize = 1024;

/// Captured output and exit status of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: Bytes,
    pub exit_code: i32,
}

impl ExecutionResult {
    fn spawn_failed() -> Self {
        Self {
            output: Bytes::from_static(SPAWN_FAILURE_OUTPUT),
            exit_code: EXIT_SENTINEL,
        }
    }
}

/// Runs shell commands and captures their stdout.
#[derive(Debug, Clone)]
pub struct Executor {
    shell: PathBuf,
    output_capacity: usize,
}

impl Executor {
    /// Create an executor using `shell` and an output buffer of
    /// `output_capacity` bytes (one byte of which is never filled).
    pub fn new(shell: impl Into<PathBuf>, output_capacity: usize) -> Self {
        Self {
            shell: shell.into(),
            output_capacity,
        }
    }

    /// Maximum number of output bytes a result can carry.
    pub fn output_limit(&self) -> usize {
        self.output_capacity.saturating_sub(1)
    }

    /// Run `command` to completion.
    ///
    /// Never fails: spawn errors, wait errors and abnormal termination are
    /// all reported through `EXIT_SENTINEL`.
    pub async fn execute(&self, command: &[u8]) -> ExecutionResult {
        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(OsStr::from_bytes(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            // An abandoned session must not leave its command running
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(shell = %self.shell.display(), error = %e, "Failed to spawn command");
                return ExecutionResult::spawn_failed();
            }
        };

        let output = match child.stdout.take() {
            Some(stdout) => capture(stdout, self.output_limit()).await,
            None => Bytes::new(),
        };

        let exit_code = match child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(error = %e, "Failed to wait for command");
                EXIT_SENTINEL
            }
        };

        ExecutionResult { output, exit_code }
    }
}

/// Read `reader` to end-of-stream, keeping at most `limit` bytes.
///
/// Bytes past the limit are read and dropped so the writer never blocks on
/// a full pipe.
async fn capture<R>(mut reader: R, limit: usize) -> Bytes
where
    R: AsyncRead + Unpin,
{
    let mut output = BytesMut::with_capacity(limit.min(READ_CHUNK * 4));
    let mut chunk = [0u8; READ_CHUNK];
    let mut dropped = 0usize;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to read command output");
                break;
            }
        };

        let room = limit - output.len();
        let keep = n.min(room);
        output.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }

    if dropped > 0 {
        debug!(kept = output.len(), dropped, "Command output truncated");
    }

    output.freeze()
}

/// Map a process exit status to the protocol's exit code.
fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => {
            debug!(signal = ?status.signal(), "Command terminated abnormally");
            EXIT_SENTINEL
        }
    }
}
