//! # Netstring Framing
//!
//! Length-prefixed frames so that several messages can share one
//! datagram or byte stream without application-level delimiters. The
//! wire form is `<ascii-digits>:<payload>,` with the comma as the
//! terminating sentinel.
//!
//! The decoder is a restartable consumer: it ingests arbitrary byte
//! chunks and emits at most one message per fed chunk, so callers pump
//! it with empty chunks to drain frames that arrived back-to-back.

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FramingError {
    /// The byte at the end of a frame was not the `,` sentinel.
    #[error("framing fault: expected ',' sentinel after {0} payload bytes")]
    Fault(usize),
}

/// Frame a message for transmission.
pub fn encode(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(format!("{}:", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    frame.push(b',');
    frame
}

/// A stateful netstring decoder.
///
/// Created idle; feeding it (an empty chunk is fine) advances the scan.
/// Bytes ahead of a length prefix are discarded on the fly, so the
/// decoder can pick up mid-stream. After a framing fault it resynchronises
/// by dropping the buffered bytes up to the fault and resuming the scan.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    span: Option<usize>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a chunk, returning at most one complete message.
    ///
    /// `Ok(None)` means more bytes are needed. A [`FramingError`] is
    /// recoverable: the decoder has already resynchronised and the next
    /// feed resumes scanning.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<String>, FramingError> {
        self.buf.extend_from_slice(chunk);

        loop {
            let span = match self.span {
                Some(span) => span,
                None => match self.scan_length() {
                    Some(span) => span,
                    None => return Ok(None),
                },
            };
            self.span = Some(span);

            if self.buf.len() < span + 1 {
                return Ok(None);
            }

            if self.buf[span] != b',' {
                // Drop through the fault and resume scanning afresh.
                warn!("framing fault, resynchronising decoder");
                self.buf.drain(..=span);
                self.span = None;
                return Err(FramingError::Fault(span));
            }

            let message = String::from_utf8_lossy(&self.buf[..span]).into_owned();
            self.buf.drain(..=span);
            self.span = None;
            return Ok(Some(message));
        }
    }

    /// Locate the next `digits:` prefix, discarding leading garbage.
    fn scan_length(&mut self) -> Option<usize> {
        loop {
            let colon = self.buf.iter().position(|&b| b == b':')?;

            // Walk backwards from the colon over the run of ASCII digits.
            let mut start = colon;
            while start > 0 && self.buf[start - 1].is_ascii_digit() {
                start -= 1;
            }

            let digits = &self.buf[start..colon];
            if digits.is_empty() {
                // A bare colon is garbage; drop it and keep scanning.
                self.buf.drain(..=colon);
                continue;
            }

            let span = std::str::from_utf8(digits)
                .ok()
                .and_then(|text| text.parse::<usize>().ok());
            self.buf.drain(..=colon);
            match span {
                Some(span) => return Some(span),
                // An unrepresentable length is garbage; keep scanning.
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode(""), b"0:,");
    }

    #[test]
    fn test_encode_hello() {
        assert_eq!(encode("hello world!"), b"12:hello world!,");
    }

    #[test]
    fn test_decode_single_chunk() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.feed(&[]).unwrap(), None);
        let message = decoder.feed(b"12:hello world!,").unwrap();
        assert_eq!(message.as_deref(), Some("hello world!"));
    }

    #[test]
    fn test_decode_byte_by_byte_matches_single_chunk() {
        let frame = encode("hello world!");
        let mut decoder = Decoder::new();
        let mut messages = Vec::new();
        for byte in frame {
            if let Some(message) = decoder.feed(&[byte]).unwrap() {
                messages.push(message);
            }
        }
        assert_eq!(messages, vec!["hello world!".to_string()]);
    }

    #[test]
    fn test_decode_empty_message() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.feed(b"0:,").unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_decode_tolerates_leading_garbage() {
        let mut decoder = Decoder::new();
        let message = decoder.feed(b"\xff\xfenoise5:hello,").unwrap();
        assert_eq!(message.as_deref(), Some("hello"));
    }

    #[test]
    fn test_decode_one_message_per_feed() {
        let mut decoder = Decoder::new();
        let first = decoder.feed(b"1:a,1:b,").unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        // The second frame is buffered and drained by an empty feed.
        let second = decoder.feed(&[]).unwrap();
        assert_eq!(second.as_deref(), Some("b"));
        assert_eq!(decoder.feed(&[]).unwrap(), None);
    }

    #[test]
    fn test_decode_fault_then_resync() {
        let mut decoder = Decoder::new();
        assert!(decoder.feed(b"3:abcX").is_err());
        // The decoder has discarded the faulty frame and picks up cleanly.
        let message = decoder.feed(b"2:ok,").unwrap();
        assert_eq!(message.as_deref(), Some("ok"));
    }
}
