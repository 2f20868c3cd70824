//! The wire-level [`Message`] value type, `Record` framing, and the
//! attribute-layered [`AttributeMessage`] view built on top of it.

use std::collections::HashMap;

use crate::error::PostalError;

/// Reserved attribute key under which [`AttributeMessage::encode`] stores the body.
pub const BODY_KEY: &str = "m_body";

/// A topic-addressed message: a topic string plus an opaque payload.
///
/// `topic` may not contain a horizontal tab (`\t`); this is enforced by
/// [`Message::new`] and by [`BufferedPostOffice::publish`](crate::engine::BufferedPostOffice::publish).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Vec<u8>,
}

impl Message {
    /// Construct a message, rejecting a topic containing a tab.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<Self, PostalError> {
        let topic = topic.into();
        if topic.contains('\t') {
            return Err(PostalError::Validation(
                "message topic contains a tab".into(),
            ));
        }
        Ok(Self {
            topic,
            payload: payload.into(),
        })
    }

    /// Construct a message without validating the topic. Used internally for
    /// messages the engine itself builds (status messages, broker replies)
    /// where the topic is a compile-time constant known to be tab-free.
    pub(crate) fn new_unchecked(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.topic, self.payload)
    }

    /// `len(topic) + len(payload)`, used by `BoundedQueue` for byte accounting.
    pub fn size(&self) -> usize {
        self.topic.len() + self.payload.len()
    }
}

// ── Record framing ───────────────────────────────────────────────────
//
// `[<decimal-length> (<type> <text>)\n]`. `<decimal-length>` is the byte
// length of `(<type> <text>)\n`, i.e. `type.len() + text.len() + 4`.
// Lengths below 5 are malformed and skipped.

/// Encode one `Record`.
pub(crate) fn encode_record(record_type: &str, text: &[u8]) -> Vec<u8> {
    let content_len = record_type.len() + text.len() + 4;
    let mut out = Vec::with_capacity(content_len + 16);
    out.push(b'[');
    out.extend(content_len.to_string().into_bytes());
    out.push(b' ');
    out.push(b'(');
    out.extend_from_slice(record_type.as_bytes());
    out.push(b' ');
    out.extend_from_slice(text);
    out.push(b')');
    out.push(b'\n');
    out.push(b']');
    out
}

/// Decode one `Record` starting at `data[0]`, returning `(type, text, consumed)`.
///
/// Mirrors `slaim::ExtractSingleMessageFromBufferItem`: a record whose
/// declared length is below 5 is discarded up to its next `]` (`consumed`
/// covers the skipped bytes and no record is returned for that span — the
/// caller should call again from `consumed` to keep scanning); a record
/// whose declared length runs past the end of `data` yields `None` entirely
/// (not even as a skip), since the caller may still be waiting on more bytes.
pub(crate) fn decode_one_record(data: &[u8]) -> Option<(Option<(String, Vec<u8>)>, usize)> {
    if data.is_empty() || data[0] != b'[' {
        return None;
    }
    let space_off = data[1..].iter().position(|&b| b == b' ')?;
    let space_idx = 1 + space_off;
    let len_str = std::str::from_utf8(&data[1..space_idx]).ok()?;
    let declared_len: usize = len_str.parse().ok()?;

    if declared_len < 5 {
        // Malformed: skip forward to the next ']' and report no record.
        let close_off = data[space_idx..].iter().position(|&b| b == b']')?;
        return Some((None, space_idx + close_off + 1));
    }

    // Content is `(<type> <text>)\n`, declared_len bytes, starting right
    // after the space. The record's closing ']' follows immediately.
    let content_start = space_idx + 1;
    let content_end = content_start + declared_len;
    if content_end > data.len() {
        // Incomplete record; caller may have more data later.
        return None;
    }
    if data[content_end] != b']'
        || data[content_end - 1] != b'\n'
        || data[content_end - 2] != b')'
        || data[content_start] != b'('
    {
        // Doesn't look like a well-formed record after all; resync past it.
        return Some((None, content_end + 1));
    }

    let inner = &data[content_start + 1..content_end - 2]; // strip '(' and ")\n"
    let record = match inner.iter().position(|&b| b == b' ') {
        Some(sep) => {
            let record_type = String::from_utf8_lossy(&inner[..sep]).into_owned();
            let text = inner[sep + 1..].to_vec();
            (record_type, text)
        }
        None => (String::from_utf8_lossy(inner).into_owned(), Vec::new()),
    };
    Some((Some(record), content_end + 1))
}

/// Decode every complete `Record` found in `data`, skipping malformed ones.
pub(crate) fn decode_records(data: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        match decode_one_record(&data[pos..]) {
            Some((record, consumed)) => {
                if let Some(record) = record {
                    out.push(record);
                }
                pos += consumed;
            }
            None => break,
        }
    }
    out
}

// ── AttributeMessage ─────────────────────────────────────────────────

/// A message decomposed into a body plus a flat string-to-string attribute map.
///
/// Encodes onto a plain [`Message`] by laying the body and each attribute out
/// as `Record`s, concatenated; the body uses the reserved key [`BODY_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributeMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

impl AttributeMessage {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            body: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Encode into a wire [`Message`]. The topic is not tab-validated here;
    /// callers publishing this message go through [`Message::new`] which does.
    pub fn encode(&self) -> Message {
        let mut payload = encode_record(BODY_KEY, &self.body);
        for (key, value) in &self.attributes {
            payload.extend(encode_record(key, value.as_bytes()));
        }
        Message::new_unchecked(self.topic.clone(), payload)
    }

    /// Decode from a wire [`Message`]. The record whose type is [`BODY_KEY`]
    /// populates `body`; all others populate `attributes` (last write wins).
    pub fn decode(msg: &Message) -> Self {
        let mut out = Self::new(msg.topic());
        for (key, value) in decode_records(msg.payload()) {
            if key == BODY_KEY {
                out.body = value;
            } else {
                out.attributes.insert(key, String::from_utf8_lossy(&value).into_owned());
            }
        }
        out
    }
}
