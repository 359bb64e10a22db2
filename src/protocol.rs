//! Incremental top-level JSON object decoder over a fixed-capacity buffer.
//!
//! One instance lives inside each client's read loop. `feed` is handed
//! newly-read bytes, and `drain` is called in a loop to pull out fully
//! decoded top-level values until it reports that more input is needed.
//! Restartable by construction: `serde_json`'s streaming deserializer
//! already tracks how many bytes a value consumed, so compaction is just
//! `Vec::drain`.

use serde_json::Value;

/// Matches the source daemon's fixed per-client buffer size.
pub const BUFFER_CAPACITY: usize = 4096;

pub struct Decoder {
    buf: Vec<u8>,
}

pub enum Decoded {
    /// A fully-parsed top-level value, and whether it was a JSON object
    /// (non-objects are valid framing but carry no meaning and are
    /// dropped by the caller).
    Value(Value),
    /// Not enough bytes buffered yet for a complete value.
    NeedMore,
    /// The buffered bytes are not a valid JSON prefix. The whole buffer
    /// has already been discarded; reading resumes from empty.
    Discarded,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            buf: Vec::with_capacity(BUFFER_CAPACITY),
        }
    }

    /// Remaining room before the buffer hits its capacity.
    pub fn spare_capacity(&self) -> usize {
        BUFFER_CAPACITY - self.buf.len()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode one top-level value from the front of the
    /// buffer. On success the consumed bytes are dropped from the front.
    /// On "need more input" nothing is consumed. If the buffer is already
    /// at capacity and still incomplete, it is discarded wholesale - no
    /// object larger than the buffer can ever be decoded.
    pub fn poll(&mut self) -> Decoded {
        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.buf.drain(..consumed);
                Decoded::Value(value)
            }
            Some(Err(err)) if err.is_eof() => {
                if self.buf.len() >= BUFFER_CAPACITY {
                    self.buf.clear();
                    Decoded::Discarded
                } else {
                    Decoded::NeedMore
                }
            }
            Some(Err(_)) => {
                self.buf.clear();
                Decoded::Discarded
            }
            None => Decoded::NeedMore,
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_one_object_and_compacts() {
        let mut d = Decoder::new();
        d.feed(br#"{"a":1}{"b":2}"#);
        match d.poll() {
            Decoded::Value(v) => assert_eq!(v["a"], 1),
            _ => panic!("expected a value"),
        }
        match d.poll() {
            Decoded::Value(v) => assert_eq!(v["b"], 2),
            _ => panic!("expected a value"),
        }
        assert!(matches!(d.poll(), Decoded::NeedMore));
    }

    #[test]
    fn reports_need_more_on_partial_object() {
        let mut d = Decoder::new();
        d.feed(br#"{"a":"#);
        assert!(matches!(d.poll(), Decoded::NeedMore));
        d.feed(br#"1}"#);
        match d.poll() {
            Decoded::Value(v) => assert_eq!(v["a"], 1),
            _ => panic!("expected a value"),
        }
    }

    #[test]
    fn discards_on_hard_parse_error() {
        let mut d = Decoder::new();
        d.feed(b"not json at all }");
        assert!(matches!(d.poll(), Decoded::Discarded));
        assert_eq!(d.spare_capacity(), BUFFER_CAPACITY);
    }

    #[test]
    fn discards_when_buffer_fills_without_completing() {
        let mut d = Decoder::new();
        // an object opener followed by capacity-worth of filler, never closed
        d.feed(b"{\"a\":\"");
        d.feed(&vec![b'x'; BUFFER_CAPACITY]);
        assert!(matches!(d.poll(), Decoded::Discarded));
        assert_eq!(d.spare_capacity(), BUFFER_CAPACITY);
    }

    #[test]
    fn ignores_top_level_non_object_values() {
        let mut d = Decoder::new();
        d.feed(b"42 {\"a\":1}");
        match d.poll() {
            Decoded::Value(v) => assert!(v.is_number()),
            _ => panic!("expected a value"),
        }
        match d.poll() {
            Decoded::Value(v) => assert!(v.is_object()),
            _ => panic!("expected a value"),
        }
    }
}
