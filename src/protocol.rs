//! Command protocol parser and response generator.
//!
//! One request per connection:
//! - Client sends: `<command>\n`
//! - Server replies: `<stdout bytes>EXIT_CODE: <n>\n` and closes
//!
//! `QUIT` and `EXIT` are answered with `OK\nEXIT_CODE: 0\n` without running
//! anything; an empty line is answered with `EXIT_CODE: 0\n`.

use crate::executor::ExecutionResult;
use bytes::{Bytes, BytesMut};

/// Prefix of the trailer line closing every reply.
pub const TRAILER_PREFIX: &[u8] = b"EXIT_CODE: ";

/// Default size of the single request read.
pub const DEFAULT_REQUEST_BUFFER: usize = 4096;

/// Parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `QUIT` or `EXIT`: acknowledge and close.
    Quit,
    /// Empty line: nothing to run.
    Empty,
    /// Shell command line, without its line terminator.
    Execute(Bytes),
}

impl Request {
    /// Parse the bytes of the first read on a connection.
    ///
    /// Everything from the first `\n` on is discarded. Matching of the
    /// reserved words is exact and case-sensitive.
    pub fn parse(input: &[u8]) -> Request {
        let line = match input.iter().position(|&b| b == b'\n') {
            Some(pos) => &input[..pos],
            None => input,
        };

        match line {
            b"QUIT" | b"EXIT" => Request::Quit,
            b"" => Request::Empty,
            command => Request::Execute(Bytes::copy_from_slice(command)),
        }
    }
}

/// Response generator
pub struct Response;

impl Response {
    /// Reply to `QUIT` / `EXIT`.
    pub fn quit() -> &'static [u8] {
        b"OK\nEXIT_CODE: 0\n"
    }

    /// Reply to an empty command line.
    pub fn empty() -> &'static [u8] {
        b"EXIT_CODE: 0\n"
    }

    /// Output followed by the exit code trailer.
    pub fn executed(result: &ExecutionResult) -> BytesMut {
        let mut response = BytesMut::with_capacity(result.output.len() + TRAILER_PREFIX.len() + 5);
        response.extend_from_slice(&result.output);
        response.extend_from_slice(&Response::trailer(result.exit_code));
        response
    }

    /// The `EXIT_CODE: <n>\n` line.
    pub fn trailer(exit_code: i32) -> Vec<u8> {
        format!("EXIT_CODE: {exit_code}\n").into_bytes()
    }
}

/// A reply split into output and exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub output: Bytes,
    pub exit_code: i32,
}

impl Reply {
    /// Split a complete reply at its trailer.
    ///
    /// The trailer does not necessarily start a line: truncated output can
    /// end mid-line. Returns `None` if no well-formed trailer ends the data.
    pub fn parse(data: &[u8]) -> Option<Reply> {
        let body = data.strip_suffix(b"\n").unwrap_or(data);
        let start = rfind(body, TRAILER_PREFIX)?;
        let code = std::str::from_utf8(&body[start + TRAILER_PREFIX.len()..]).ok()?;
        let exit_code = code.trim().parse().ok()?;

        Some(Reply {
            output: Bytes::copy_from_slice(&data[..start]),
            exit_code,
        })
    }
}

/// Position of the last occurrence of `needle` in `haystack`.
fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}
