//! Wire protocol: line framing and command grammar.
//!
//! One command per newline-delimited line. Lines can be long — the
//! serialized metadata table travels as a single line — so the reader
//! enforces a 4 MiB cap instead of assuming short lines.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::error::SyncError;

/// Upper bound on a single protocol line, large enough to admit a
/// serialized metadata table for big experiments.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// A command sent by a peer to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// The peer's local unix clock reading, sent exactly once, first.
    Time(f64),
    /// One metadata key/value pair.
    Set { key: String, value: String },
    /// The peer is ready to start.
    Ready,
}

impl PeerCommand {
    /// Parses one peer-to-coordinator line.
    pub fn parse(line: &str) -> Result<Self, SyncError> {
        if line == "ready" {
            return Ok(PeerCommand::Ready);
        }
        if let Some(stamp) = line.strip_prefix("time:") {
            let value: f64 = stamp
                .parse()
                .map_err(|_| SyncError::protocol(format!("bad time value '{stamp}'")))?;
            if !value.is_finite() {
                return Err(SyncError::protocol(format!("non-finite time '{stamp}'")));
            }
            return Ok(PeerCommand::Time(value));
        }
        if let Some(rest) = line.strip_prefix("set:") {
            return match rest.split_once(':') {
                Some((key, value)) if !key.is_empty() => Ok(PeerCommand::Set {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
                _ => Err(SyncError::protocol(format!("bad set command '{line}'"))),
            };
        }
        Err(SyncError::protocol(format!("unrecognized command '{line}'")))
    }

    /// Encodes the command as one line, newline included.
    pub fn encode(&self) -> String {
        match self {
            PeerCommand::Time(t) => format!("time:{t}\n"),
            PeerCommand::Set { key, value } => format!("set:{key}:{value}\n"),
            PeerCommand::Ready => "ready\n".to_string(),
        }
    }
}

/// Reads newline-delimited protocol lines with the size cap enforced.
///
/// Returns `Ok(None)` on a clean EOF at a line boundary.
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wraps a raw reader.
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Reads the next line, stripped of its `\n` (and `\r`, tolerated for
    /// hand-driven debugging sessions).
    pub async fn next_line(&mut self) -> Result<Option<String>, SyncError> {
        let mut buf: Vec<u8> = Vec::new();
        // Bound the read: if no newline shows up within the cap, the
        // remote is violating the protocol and the extra byte proves it.
        let mut capped = (&mut self.inner).take(MAX_LINE_BYTES as u64 + 1);
        let n = capped.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() > MAX_LINE_BYTES {
                return Err(SyncError::LineTooLong);
            }
            // EOF mid-line: surface the partial content as a line; the
            // state machines reject it if it is not a complete command.
        } else {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8(buf)
            .map_err(|_| SyncError::protocol("line is not valid UTF-8"))?;
        Ok(Some(line))
    }
}

/// Current unix time as float seconds, the clock representation used on
/// the wire.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
