//! Newline-delimited JSON framing for kernel envelopes.
//!
//! The kernel writes one envelope per line. Stream reads can cut a line
//! anywhere (even inside a UTF-8 sequence) or carry several lines at once,
//! so the decoder buffers bytes and only decodes complete lines.

use thiserror::Error;

use crate::envelope::Envelope;

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8 { preview: String },

    #[error("malformed envelope: {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
        preview: String,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CodecError {
    /// Leading part of the offending line, for logging.
    pub fn preview(&self) -> &str {
        match self {
            CodecError::InvalidUtf8 { preview } | CodecError::Malformed { preview, .. } => preview,
            CodecError::Encode(_) => "",
        }
    }
}

/// Incremental decoder for the kernel's stdout stream.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buffer: Vec<u8>,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and decode every line it completes, in order.
    ///
    /// Blank lines are skipped. A line that fails to decode yields an `Err`
    /// in its position; later lines are still decoded.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Envelope, CodecError>> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(result) = decode_line(&self.buffer[start..end]) {
                decoded.push(result);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        decoded
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Consume the decoder, returning any unterminated fragment.
    pub fn finish(self) -> Option<String> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buffer).into_owned())
        }
    }
}

fn decode_line(raw: &[u8]) -> Option<Result<Envelope, CodecError>> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text.trim(),
        Err(_) => {
            return Some(Err(CodecError::InvalidUtf8 {
                preview: preview(&String::from_utf8_lossy(raw)),
            }))
        }
    };
    if text.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str(text).map_err(|source| CodecError::Malformed {
            source,
            preview: preview(text),
        }),
    )
}

/// Serialize an envelope as exactly one line, newline included.
///
/// `serde_json` escapes control characters inside strings, so the output
/// never contains a newline before the terminator.
pub fn encode_line(envelope: &Envelope) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(envelope).map_err(CodecError::Encode)?;
    line.push('\n');
    Ok(line)
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}
