//! STOMP 1.2 frame parsing, encoding, and stream splitting.
//!
//! Wire format:
//! ```text
//! COMMAND\n
//! header:value\n
//! ...\n
//! \n
//! BODY \0
//! ```
//!
//! Bodies with a `content-length` header may contain NUL bytes; otherwise
//! the body runs to the first NUL. Bare EOLs between frames are
//! heartbeats and are swallowed by the splitter.

use crate::error::StompError;

const NUL: u8 = 0x00;
const LF: u8 = b'\n';
const CR: u8 = b'\r';

/// A parsed STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StompFrame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_owned(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// First value for `name`, per the STOMP repeated-header rule.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Encode into a complete wire frame (with NUL terminator).
    ///
    /// A `content-length` header is added for non-empty bodies so binary
    /// payloads survive embedded NULs.
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(64 + self.body.len());
        wire.extend_from_slice(self.command.as_bytes());
        wire.push(LF);
        for (name, value) in &self.headers {
            wire.extend_from_slice(escape_header(name).as_bytes());
            wire.push(b':');
            wire.extend_from_slice(escape_header(value).as_bytes());
            wire.push(LF);
        }
        if !self.body.is_empty() && self.get_header("content-length").is_none() {
            wire.extend_from_slice(format!("content-length:{}", self.body.len()).as_bytes());
            wire.push(LF);
        }
        wire.push(LF);
        wire.extend_from_slice(&self.body);
        wire.push(NUL);
        wire
    }

    fn parse_head(head: &[u8], body: Vec<u8>) -> Result<Self, StompError> {
        let mut lines = head.split(|&b| b == LF).map(strip_cr);

        let command = match lines.next() {
            Some(line) if !line.is_empty() => String::from_utf8_lossy(line).into_owned(),
            other => {
                return Err(StompError::BadCommand(
                    String::from_utf8_lossy(other.unwrap_or_default()).into_owned(),
                ))
            }
        };
        if !command.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(StompError::BadCommand(command));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| StompError::BadHeader(String::from_utf8_lossy(line).into_owned()))?;
            let name = unescape_header(&String::from_utf8_lossy(&line[..colon]))?;
            let value = unescape_header(&String::from_utf8_lossy(&line[colon + 1..]))?;
            headers.push((name, value));
        }

        Ok(Self {
            command,
            headers,
            body,
        })
    }
}

/// STOMP 1.2 header escaping: `\` `\n` `\r` `:`.
fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => return Err(StompError::BadEscape(other)),
            None => return Err(StompError::BadEscape('\0')),
        }
    }
    Ok(out)
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(&CR) => &line[..line.len() - 1],
        _ => line,
    }
}

/// Splits a byte stream into individual STOMP frames. Buffers partial
/// data across calls, so it can be fed TCP segment boundaries.
pub struct StompSplitter {
    buf: Vec<u8>,
}

impl StompSplitter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
        }
    }

    /// Feed new data and extract any complete frames.
    ///
    /// Heartbeat EOLs are swallowed. A malformed frame yields one `Err`
    /// entry and the splitter resyncs past the next NUL, so a single bad
    /// frame never wedges the stream.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<StompFrame, StompError>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            // Swallow heartbeats between frames.
            let lead = self
                .buf
                .iter()
                .take_while(|&&b| b == LF || b == CR)
                .count();
            if lead > 0 {
                self.buf.drain(..lead);
            }
            if self.buf.is_empty() {
                break;
            }

            // Locate the blank line separating headers from body.
            let Some((head_end, body_start)) = find_head_end(&self.buf) else {
                break; // incomplete headers
            };

            // A content-length header bounds the body; otherwise it runs to
            // the first NUL.
            let head = &self.buf[..head_end];
            let body_end = match content_length(head) {
                Ok(Some(len)) => {
                    // The header is untrusted; a length near usize::MAX
                    // must not overflow the index arithmetic.
                    let Some(end) = body_start.checked_add(len) else {
                        frames.push(Err(StompError::BadContentLength(len.to_string())));
                        self.resync(body_start);
                        continue;
                    };
                    if end >= self.buf.len() {
                        break; // incomplete body (need body + NUL)
                    }
                    if self.buf[end] != NUL {
                        frames.push(Err(StompError::MissingNul));
                        self.resync(body_start);
                        continue;
                    }
                    end
                }
                Ok(None) => {
                    match self.buf[body_start..].iter().position(|&b| b == NUL) {
                        Some(pos) => body_start + pos,
                        None => break, // incomplete body
                    }
                }
                Err(e) => {
                    frames.push(Err(e));
                    self.resync(body_start);
                    continue;
                }
            };

            let body = self.buf[body_start..body_end].to_vec();
            let frame = StompFrame::parse_head(&self.buf[..head_end], body);
            self.buf.drain(..=body_end); // frame + NUL
            frames.push(frame);
        }

        frames
    }

    /// Drop buffered data through the next NUL so parsing can recover
    /// after a malformed frame.
    fn resync(&mut self, from: usize) {
        match self.buf[from..].iter().position(|&b| b == NUL) {
            Some(pos) => {
                self.buf.drain(..=from + pos);
            }
            None => self.buf.clear(),
        }
    }
}

impl Default for StompSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the end of the header block: returns (offset of the blank line,
/// offset of the first body byte).
fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != LF {
            i += 1;
            continue;
        }
        match buf.get(i + 1) {
            Some(&LF) => return Some((i, i + 2)),
            Some(&CR) if buf.get(i + 2) == Some(&LF) => return Some((i, i + 3)),
            _ => i += 1,
        }
    }
    None
}

fn content_length(head: &[u8]) -> Result<Option<usize>, StompError> {
    for line in head.split(|&b| b == LF).skip(1).map(strip_cr) {
        if let Some(value) = line.strip_prefix(b"content-length:") {
            let text = String::from_utf8_lossy(value);
            return text
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| StompError::BadContentLength(text.into_owned()));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
