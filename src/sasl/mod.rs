//! The SASL handshake D-Bus performs before switching to binary framing.
//!
//! The exchange is line based and ASCII: the client sends `AUTH EXTERNAL`
//! with its uid, falls back to `AUTH ANONYMOUS` on rejection, optionally
//! negotiates file descriptor passing, and finishes with `BEGIN`.

use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::transport::Transport;


/// The result of a completed handshake.
pub(crate) struct SaslOutcome {
    /// The server GUID from the `OK` response.
    pub(crate) guid: String,
    /// Whether the server agreed to pass file descriptors.
    pub(crate) unix_fd: bool,
    /// Bytes read past the final response line. They belong to the binary
    /// stream and are handed to the message reader.
    pub(crate) leftover: Vec<u8>,
}

/// A response line sent by the server.
#[derive(Debug, PartialEq, Eq)]
enum Response {
    Ok(String),
    Rejected,
    AgreeUnixFd,
    Error,
    Data,
}

/// Run the client side of the handshake over a freshly connected transport.
///
/// The caller must already have sent the credentials nul byte.
pub(crate) async fn authenticate(
    transport: &Transport,
    expected_guid: Option<&str>,
    negotiate_fd: bool,
) -> Result<SaslOutcome> {
    let mut lines = LineReader::new();

    let uid = unsafe { libc::getuid() };
    let mut command = String::from("AUTH EXTERNAL ");
    push_external_payload(&mut command, uid);
    command.push_str("\r\n");
    transport.send(command.as_bytes()).await?;

    let guid = match parse_response(&lines.next_line(transport).await?)? {
        Response::Ok(guid) => guid,
        Response::Rejected | Response::Error | Response::Data => {
            transport.send(b"AUTH ANONYMOUS\r\n").await?;

            match parse_response(&lines.next_line(transport).await?)? {
                Response::Ok(guid) => guid,
                _ => return Err(Error::auth("server rejected every mechanism")),
            }
        }
        Response::AgreeUnixFd => {
            return Err(Error::auth("unexpected response to AUTH"));
        }
    };

    if let Some(expected) = expected_guid {
        if !guid.eq_ignore_ascii_case(expected) {
            return Err(Error::auth("server guid does not match the address"));
        }
    }

    let unix_fd = if negotiate_fd {
        transport.send(b"NEGOTIATE_UNIX_FD\r\n").await?;

        match parse_response(&lines.next_line(transport).await?)? {
            Response::AgreeUnixFd => true,
            // Anything else means the server will not pass descriptors;
            // carry on without them.
            _ => false,
        }
    } else {
        false
    };

    transport.send(b"BEGIN\r\n").await?;

    Ok(SaslOutcome {
        guid,
        unix_fd,
        leftover: lines.buf,
    })
}

/// Parse a single response line.
fn parse_response(line: &[u8]) -> Result<Response> {
    let (command, rest) = split_line(line);

    match command {
        b"OK" => {
            let guid = std::str::from_utf8(rest)
                .map_err(|_| Error::auth("server guid is not valid ASCII"))?;
            Ok(Response::Ok(guid.to_owned()))
        }
        b"REJECTED" => Ok(Response::Rejected),
        b"AGREE_UNIX_FD" => Ok(Response::AgreeUnixFd),
        b"ERROR" => Ok(Response::Error),
        b"DATA" => Ok(Response::Data),
        _ => Err(Error::auth("unexpected response line")),
    }
}

/// Split a raw response line into its command and the remainder, dropping
/// the `\r\n` terminator. A line without a space is all command.
fn split_line(line: &[u8]) -> (&[u8], &[u8]) {
    let mut end = line.len();

    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }

    let line = &line[..end];

    match line.iter().position(|&b| b == b' ') {
        Some(at) => (&line[..at], &line[at + 1..]),
        None => (line, &b""[..]),
    }
}

/// Append the EXTERNAL initial response, the uid as a decimal string in
/// ASCII hex.
fn push_external_payload(out: &mut String, id: u32) {
    let decimal = id.to_string();

    for b in decimal.bytes() {
        let _ = write!(out, "{b:02x}");
    }
}

struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    async fn next_line(&mut self, transport: &Transport) -> Result<Vec<u8>> {
        loop {
            if let Some(at) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.drain(..=at).collect();
                return Ok(line);
            }

            let mut chunk = [0u8; 512];
            let mut fds = Vec::new();
            let n = transport.recv(&mut chunk, &mut fds).await?;

            if n == 0 {
                return Err(Error::auth("connection closed during authentication"));
            }

            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
