//! HTTP/1.x message delimiting
//!
//! Decode and encode are identity: the editable form of an HTTP/1 message is
//! the message itself. What this codec adds is framing (Content-Length,
//! chunked transfer, bodiless responses), content-type extraction, interim
//! response detection and body redaction.

use proxy_common::Exchange;

use super::{Boundary, Codec, FrameQueue};

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Default)]
pub struct Http1Codec {
    frames: FrameQueue,
}

impl Http1Codec {
    pub const NAME: &'static str = "HTTP";

    pub fn new() -> Self {
        Self::default()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Index just past the blank line ending the header block
fn header_end(data: &[u8]) -> Option<usize> {
    find(data, HEADER_END).map(|i| i + HEADER_END.len())
}

fn header_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|&b| b == b'\n')
        .skip(1)
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

fn header_value(head: &[u8], name: &str) -> Option<String> {
    header_lines(head).find_map(|line| {
        let colon = line.iter().position(|&b| b == b':')?;
        let key = String::from_utf8_lossy(&line[..colon]);
        if key.trim().eq_ignore_ascii_case(name) {
            Some(String::from_utf8_lossy(&line[colon + 1..]).trim().to_string())
        } else {
            None
        }
    })
}

fn status_code(head: &[u8]) -> Option<u16> {
    let line_end = find(head, b"\r\n").unwrap_or(head.len());
    let line = String::from_utf8_lossy(&head[..line_end]);
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn is_chunked(head: &[u8]) -> bool {
    header_value(head, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

/// End of a chunked body starting at `start`, `None` if more input is needed
fn chunked_end(data: &[u8], start: usize) -> Option<usize> {
    let mut pos = start;
    loop {
        let line_len = find(&data[pos..], b"\r\n")?;
        let size_line = String::from_utf8_lossy(&data[pos..pos + line_len]);
        let size_field = size_line.split(';').next().unwrap_or("").trim();
        let size = match usize::from_str_radix(size_field, 16) {
            Ok(size) => size,
            // Malformed framing: hand over what is here rather than stall
            Err(_) => return Some(data.len()),
        };
        pos += line_len + 2;
        if size == 0 {
            if data[pos..].starts_with(b"\r\n") {
                return Some(pos + 2);
            }
            return find(&data[pos..], HEADER_END).map(|i| pos + i + HEADER_END.len());
        }
        pos = match pos.checked_add(size).and_then(|end| end.checked_add(2)) {
            Some(end) => end,
            None => return Some(data.len()),
        };
        if pos > data.len() {
            return None;
        }
    }
}

fn message_length(data: &[u8], response: bool) -> Boundary {
    let Some(head_len) = header_end(data) else {
        return Boundary::Incomplete;
    };
    let head = &data[..head_len];

    if response {
        if let Some(code) = status_code(head) {
            if (100..200).contains(&code) || code == 204 || code == 304 {
                return Boundary::Complete(head_len);
            }
        }
    }

    if is_chunked(head) {
        return match chunked_end(data, head_len) {
            Some(end) => Boundary::Complete(end),
            None => Boundary::Incomplete,
        };
    }

    match header_value(head, "content-length").and_then(|v| v.parse::<usize>().ok()) {
        Some(len) => match head_len.checked_add(len) {
            Some(end) => Boundary::Complete(end),
            None => Boundary::Complete(data.len()),
        },
        // Requests without a length have no body. A response without one
        // is handed over read by read as the bytes arrive.
        None if response => Boundary::Complete(data.len()),
        None => Boundary::Complete(head_len),
    }
}

impl Codec for Http1Codec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check_delimiter(&self, data: &[u8]) -> Boundary {
        message_length(data, false)
    }

    fn frames(&self) -> &FrameQueue {
        &self.frames
    }

    fn check_response_delimiter(&self, data: &[u8]) -> Boundary {
        message_length(data, true)
    }

    fn content_type(&self, _request: Option<&Exchange>, response: &Exchange) -> String {
        let head_len = header_end(&response.decoded).unwrap_or(response.decoded.len());
        header_value(&response.decoded[..head_len], "content-type").unwrap_or_default()
    }

    fn is_interim_response(&self, response: &[u8]) -> bool {
        matches!(status_code(response), Some(code) if (100..200).contains(&code) && code != 101)
    }

    fn redact_body(&self, message: &[u8], note: &str) -> Vec<u8> {
        let Some(head_len) = header_end(message) else {
            return message.to_vec();
        };
        let head = &message[..head_len - HEADER_END.len()];
        let mut lines = head.split(|&b| b == b'\n');
        let mut out = Vec::with_capacity(head_len + note.len() + 32);
        if let Some(start) = lines.next() {
            out.extend_from_slice(start.strip_suffix(b"\r").unwrap_or(start));
            out.extend_from_slice(b"\r\n");
        }
        for line in lines {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let name = line
                .iter()
                .position(|&b| b == b':')
                .map(|colon| String::from_utf8_lossy(&line[..colon]).trim().to_ascii_lowercase());
            if matches!(name.as_deref(), Some("content-length") | Some("transfer-encoding")) {
                continue;
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", note.len()).as_bytes());
        out.extend_from_slice(note.as_bytes());
        out
    }

    fn lossless(&self) -> bool {
        true
    }
}
