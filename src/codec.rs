//! Line framing shared by the POP3 and SMTP clients
//!
//! Both protocols are CRLF-delimited text with the same multi-line
//! convention: a block ends with a line holding a single `.`, and any
//! data line that starts with `.` gets one extra `.` on the wire.
//! SMTP additionally groups lines into numeric replies where `250-`
//! continues and `250 ` ends a reply.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound on a single line, excluding the terminator.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024;

/// `tokio_util` codec reading and writing CRLF-terminated lines.
///
/// Decoded lines are returned without their terminator. A bare LF is
/// accepted as a terminator and a trailing CR is stripped, which keeps
/// sloppy servers working without affecting well-behaved ones.
#[derive(Debug, Clone)]
pub struct MailCodec {
    max_line_length: usize,
    /// Bytes already scanned for a newline in the pending buffer.
    next_index: usize,
}

impl MailCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    #[must_use]
    pub const fn with_max_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
        }
    }

    #[must_use]
    pub const fn max_line_length(&self) -> usize {
        self.max_line_length
    }
}

impl Default for MailCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MailCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        // Room for the content plus CRLF.
        let scan_limit = buf.len().min(self.max_line_length.saturating_add(2));
        let start = self.next_index.min(scan_limit);
        let newline = buf[start..scan_limit].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let idx = start + offset;
                self.next_index = 0;
                let mut line = buf.split_to(idx + 1);
                line.truncate(idx);
                if line.last() == Some(&b'\r') {
                    line.truncate(idx - 1);
                }
                if line.len() > self.max_line_length {
                    return Err(Error::LineTooLong(self.max_line_length));
                }
                Ok(Some(line.freeze()))
            }
            None if scan_limit >= self.max_line_length.saturating_add(2) => {
                Err(Error::LineTooLong(self.max_line_length))
            }
            None => {
                self.next_index = scan_limit;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::ConnectionClosed),
        }
    }
}

impl<'a> Encoder<&'a [u8]> for MailCodec {
    type Error = Error;

    fn encode(&mut self, line: &'a [u8], dst: &mut BytesMut) -> Result<()> {
        if line.iter().any(|b| matches!(b, b'\r' | b'\n')) {
            return Err(Error::InvalidInput(
                "line contains a bare CR or LF".to_string(),
            ));
        }
        dst.reserve(line.len() + 2);
        dst.put_slice(line);
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Whether `line` is the multi-line block terminator.
#[must_use]
pub fn is_terminator(line: &[u8]) -> bool {
    line == b"."
}

/// Undo dot-stuffing on one received data line.
#[must_use]
pub fn unstuff_line(line: Bytes) -> Bytes {
    if line.first() == Some(&b'.') {
        line.slice(1..)
    } else {
        line
    }
}

/// Split a body into wire lines, dot-stuffing each one.
///
/// CRLF and LF line endings are both accepted. A single trailing line
/// ending does not produce an extra empty line. The terminator itself
/// is not included.
#[must_use]
pub fn stuff_lines(body: &[u8]) -> Vec<Vec<u8>> {
    if body.is_empty() {
        return Vec::new();
    }
    let body = body.strip_suffix(b"\n").unwrap_or(body);
    body.split(|b| *b == b'\n')
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let mut out = Vec::with_capacity(line.len() + 1);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out
        })
        .collect()
}

/// One line of a numeric (SMTP-style) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    /// `true` when a space (or nothing) follows the code.
    pub last: bool,
    pub text: String,
}

impl ReplyLine {
    /// Parse `NNN-text` / `NNN text` / `NNN`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] carrying the raw line when it does
    /// not start with a three digit code in the 1xx-5xx range or the
    /// code is followed by anything but `-` or a space.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let raw = String::from_utf8_lossy(line);
        let digits = match line.get(..3) {
            Some(d) if d.iter().all(u8::is_ascii_digit) && (b'1'..=b'5').contains(&d[0]) => d,
            _ => return Err(Error::protocol(raw)),
        };
        let code = digits
            .iter()
            .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));

        let (last, text) = match line.get(3) {
            None => (true, String::new()),
            Some(b' ') => (true, raw[4..].to_string()),
            Some(b'-') => (false, raw[4..].to_string()),
            Some(_) => return Err(Error::protocol(raw)),
        };

        Ok(Self { code, last, text })
    }
}

/// A complete numeric reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// Text of every line, without the code prefix.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Text of the reply joined into one line.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Turn an unexpected reply into a protocol error with the wire text.
    pub(crate) fn unexpected(&self) -> Error {
        Error::protocol(self.to_string())
    }
}

impl fmt::Display for Reply {
    /// Reconstructs the wire form, one line per reply line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            if i == last {
                write!(f, "{} {line}", self.code)?;
            } else {
                writeln!(f, "{}-{line}", self.code)?;
            }
        }
        Ok(())
    }
}

/// Accumulates reply lines until the final one arrives.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    code: Option<u16>,
    lines: Vec<String>,
}

impl ReplyAssembler {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            code: None,
            lines: Vec::new(),
        }
    }

    /// Feed one raw line; returns the reply once it is complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for malformed lines and for a
    /// continuation line whose code differs from the first line's.
    pub fn push(&mut self, raw: &[u8]) -> Result<Option<Reply>> {
        let line = ReplyLine::parse(raw)?;
        match self.code {
            Some(code) if code != line.code => {
                return Err(Error::protocol(String::from_utf8_lossy(raw)));
            }
            Some(_) => {}
            None => self.code = Some(line.code),
        }
        self.lines.push(line.text);

        if line.last {
            Ok(Some(Reply {
                code: line.code,
                lines: std::mem::take(&mut self.lines),
            }))
        } else {
            Ok(None)
        }
    }
}
