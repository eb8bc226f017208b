//! Mail data handed back to callers
//!
//! Summaries and messages come out of a POP3 session; outgoing
//! messages and send results belong to an SMTP session. Ordinals are
//! only meaningful inside the session that produced them.

use bytes::Bytes;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

/// One entry of a mailbox listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    /// Session-relative message number, starting at 1.
    pub ordinal: u32,
    /// Size in octets as reported by the server.
    pub size: u64,
    /// Server-assigned unique id, stable across sessions (`UIDL`).
    pub uid: Option<String>,
}

/// Mailbox totals returned when the mailbox is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStat {
    pub count: u32,
    pub size: u64,
}

/// A single header field, unfolded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A retrieved message (complete, or headers plus the first body lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    ordinal: u32,
    raw: Vec<u8>,
    header_end: usize,
    body_start: usize,
}

impl Message {
    /// Build a message from its raw RFC 5322 bytes.
    #[must_use]
    pub fn new(ordinal: u32, raw: Vec<u8>) -> Self {
        let (header_end, body_start) = if raw.starts_with(b"\r\n") {
            (0, 2)
        } else {
            raw.windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map_or((raw.len(), raw.len()), |idx| (idx + 2, idx + 4))
        };
        Self {
            ordinal,
            raw,
            header_end,
            body_start,
        }
    }

    /// Build a message from un-stuffed protocol lines.
    #[must_use]
    pub fn from_lines(ordinal: u32, lines: &[Bytes]) -> Self {
        let mut raw = Vec::with_capacity(lines.iter().map(|l| l.len() + 2).sum());
        for line in lines {
            raw.extend_from_slice(line);
            raw.extend_from_slice(b"\r\n");
        }
        Self::new(ordinal, raw)
    }

    #[must_use]
    pub const fn ordinal(&self) -> u32 {
        self.ordinal
    }

    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    #[must_use]
    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    /// The header block, including the CRLF after the last field.
    #[must_use]
    pub fn header_block(&self) -> &[u8] {
        &self.raw[..self.header_end]
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.raw[self.body_start..]
    }

    #[must_use]
    pub fn body_lines(&self) -> Vec<&[u8]> {
        let body = self.body();
        if body.is_empty() {
            return Vec::new();
        }
        let body = body.strip_suffix(b"\r\n").unwrap_or(body);
        body.split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .collect()
    }

    /// Header fields in order, unfolded, with RFC 2047 encoded-words
    /// decoded. A header block that does not parse yields no fields.
    #[must_use]
    pub fn headers(&self) -> Vec<Header> {
        let fields = match mailparse::parse_headers(self.header_block()) {
            Ok((fields, _)) => fields,
            Err(e) => {
                debug!("Unparseable header block in message {}: {}", self.ordinal, e);
                return Vec::new();
            }
        };
        fields
            .iter()
            .map(|field| Header {
                name: field.get_key(),
                value: field
                    .get_value_utf8()
                    .unwrap_or_else(|_| field.get_value())
                    .trim()
                    .to_string(),
            })
            .collect()
    }

    /// First header with this name, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers()
            .into_iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
    }

    #[must_use]
    pub fn subject(&self) -> Option<String> {
        self.header("Subject")
    }

    #[must_use]
    pub fn from(&self) -> Option<String> {
        self.header("From")
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Message", 4)?;
        state.serialize_field("ordinal", &self.ordinal)?;
        state.serialize_field("size", &self.raw.len())?;
        state.serialize_field("headers", &self.headers())?;
        state.serialize_field("body", &String::from_utf8_lossy(self.body()))?;
        state.end()
    }
}

/// A message to submit: envelope addresses plus a plain text body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl OutgoingMessage {
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        to: impl IntoIterator<Item = impl Into<String>>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into_iter().map(Into::into).collect(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Outcome of one `RCPT TO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStatus {
    pub address: String,
    pub accepted: bool,
    pub code: u16,
    /// Server text, kept verbatim for display.
    pub reply: String,
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub recipients: Vec<RecipientStatus>,
    /// Whether the server accepted the message data.
    pub accepted: bool,
    /// Final reply to the data terminator.
    pub reply: String,
}

impl SendResult {
    pub fn accepted_recipients(&self) -> impl Iterator<Item = &RecipientStatus> {
        self.recipients.iter().filter(|r| r.accepted)
    }

    pub fn rejected_recipients(&self) -> impl Iterator<Item = &RecipientStatus> {
        self.recipients.iter().filter(|r| !r.accepted)
    }

    #[must_use]
    pub fn accepted_count(&self) -> usize {
        self.accepted_recipients().count()
    }

    #[must_use]
    pub fn rejected_count(&self) -> usize {
        self.rejected_recipients().count()
    }

    /// Every recipient and the data were accepted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.accepted && self.rejected_count() == 0
    }
}
