//! Incremental UTF-8 validation for text messages (RFC 3629 / RFC 6455).
//!
//! Text payloads arrive in arbitrary fragments, so a multi-byte sequence can
//! straddle a frame boundary. The validator carries the unfinished tail
//! between [`accept`](Utf8Validator::accept) calls and reports at the end of
//! the message whether the stream terminated on a sequence boundary.
//!
//! `std::str::from_utf8` implements the RFC 3629 rules exactly (overlong
//! forms, surrogate halves and code points above U+10FFFF all rejected), so
//! validation of each chunk is delegated to it; only the boundary carry is
//! done by hand.

/// Number of bytes a UTF-8 sequence starting with `byte` occupies.
///
/// Invalid lead bytes map to their maximum plausible length; `from_utf8`
/// rejects them as soon as the bytes are inspected.
const fn sequence_len(byte: u8) -> usize {
    if byte < 0x80 {
        1
    } else if byte & 0xE0 == 0xC0 {
        2
    } else if byte & 0xF0 == 0xE0 {
        3
    } else {
        4
    }
}

/// Streaming UTF-8 validator.
#[derive(Debug, Clone, Default)]
pub struct Utf8Validator {
    /// Unfinished multi-byte sequence carried across chunks.
    incomplete: [u8; 4],
    incomplete_len: usize,
}

impl Utf8Validator {
    /// Create a validator in its initial state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of the message.
    ///
    /// Returns `false` the first time an invalid sequence is completed; the
    /// validator should then be reset before reuse. A chunk ending in the
    /// middle of a multi-byte sequence is accepted, with the tail carried
    /// into the next call.
    pub fn accept(&mut self, data: &[u8]) -> bool {
        let mut rest = data;

        if self.incomplete_len > 0 {
            let needed = sequence_len(self.incomplete[0]) - self.incomplete_len;
            let take = needed.min(rest.len());
            self.incomplete[self.incomplete_len..self.incomplete_len + take]
                .copy_from_slice(&rest[..take]);
            self.incomplete_len += take;
            rest = &rest[take..];

            match std::str::from_utf8(&self.incomplete[..self.incomplete_len]) {
                Ok(_) => self.incomplete_len = 0,
                Err(e) => {
                    if e.error_len().is_some() {
                        return false;
                    }
                    // Still incomplete; the chunk was exhausted filling it.
                    return true;
                }
            }
        }

        match std::str::from_utf8(rest) {
            Ok(_) => true,
            Err(e) => {
                if e.error_len().is_some() {
                    return false;
                }
                let tail = &rest[e.valid_up_to()..];
                self.incomplete[..tail.len()].copy_from_slice(tail);
                self.incomplete_len = tail.len();
                true
            }
        }
    }

    /// Whether the stream ended on a sequence boundary. A message whose last
    /// chunk left a multi-byte sequence unfinished is invalid.
    #[must_use]
    pub fn is_final_valid(&self) -> bool {
        self.incomplete_len == 0
    }

    /// Discard any carried state.
    pub fn reset(&mut self) {
        self.incomplete_len = 0;
    }
}

/// Validate a complete, unfragmented byte slice.
#[must_use]
pub fn validate_complete(data: &[u8]) -> bool {
    std::str::from_utf8(data).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_and_multibyte() {
        let mut v = Utf8Validator::new();
        assert!(v.accept(b"Hello, World!"));
        assert!(v.is_final_valid());

        v.reset();
        assert!(v.accept("こんにちは 🌍".as_bytes()));
        assert!(v.is_final_valid());
    }

    #[test]
    fn test_invalid_start_bytes() {
        let mut v = Utf8Validator::new();
        assert!(!v.accept(&[0x80]));

        v.reset();
        assert!(!v.accept(&[0xFF]));
    }

    #[test]
    fn test_overlong_ascii_rejected() {
        // 0xC0 0xAF is an overlong encoding of '/'.
        let mut v = Utf8Validator::new();
        assert!(!v.accept(&[0xC0, 0xAF]));
    }

    #[test]
    fn test_surrogate_half_rejected() {
        // U+D800 encoded directly: ED A0 80.
        let mut v = Utf8Validator::new();
        assert!(!v.accept(&[0xED, 0xA0, 0x80]));

        // Split across a fragment boundary.
        v.reset();
        assert!(v.accept(&[0xED]));
        assert!(!v.accept(&[0xA0, 0x80]));
    }

    #[test]
    fn test_beyond_max_code_point_rejected() {
        // F4 90 80 80 would be U+110000.
        let mut v = Utf8Validator::new();
        assert!(!v.accept(&[0xF4, 0x90, 0x80, 0x80]));
    }

    #[test]
    fn test_four_byte_char_split_two_and_two() {
        // 🎉 = F0 9F 8E 89, split 2+2.
        let mut v = Utf8Validator::new();
        assert!(v.accept(&[0xF0, 0x9F]));
        assert!(!v.is_final_valid());
        assert!(v.accept(&[0x8E, 0x89]));
        assert!(v.is_final_valid());
    }

    #[test]
    fn test_every_split_of_four_byte_char() {
        let bytes = "🎉".as_bytes();
        for split in 1..bytes.len() {
            let mut v = Utf8Validator::new();
            assert!(v.accept(&bytes[..split]), "split at {split}");
            assert!(v.accept(&bytes[split..]), "split at {split}");
            assert!(v.is_final_valid(), "split at {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut v = Utf8Validator::new();
        for byte in "Hello 世界 🎉".as_bytes() {
            assert!(v.accept(std::slice::from_ref(byte)));
        }
        assert!(v.is_final_valid());
    }

    #[test]
    fn test_incomplete_tail_then_invalid_byte() {
        // κ (CE BA) plus the lead byte E1, then FF: the carried sequence
        // completes invalid.
        let mut v = Utf8Validator::new();
        assert!(v.accept(&[0xCE, 0xBA, 0xE1]));
        assert!(!v.accept(&[0xFF]));
    }

    #[test]
    fn test_unterminated_sequence_fails_finality() {
        let mut v = Utf8Validator::new();
        assert!(v.accept(&[0xE2, 0x82])); // € missing its last byte
        assert!(!v.is_final_valid());
    }

    #[test]
    fn test_empty_chunks_preserve_state() {
        let mut v = Utf8Validator::new();
        assert!(v.accept(&[]));
        assert!(v.is_final_valid());

        assert!(v.accept(&[0xE2]));
        assert!(v.accept(&[]));
        assert!(!v.is_final_valid());
        assert!(v.accept(&[0x82, 0xAC]));
        assert!(v.is_final_valid());
    }

    #[test]
    fn test_reset_discards_tail() {
        let mut v = Utf8Validator::new();
        assert!(v.accept(&[0xF0, 0x9F]));
        v.reset();
        assert!(v.is_final_valid());
        assert!(v.accept(b"fresh"));
        assert!(v.is_final_valid());
    }

    #[test]
    fn test_invalid_in_middle_of_chunk() {
        let mut v = Utf8Validator::new();
        assert!(!v.accept(&[0x48, 0x65, 0x80, 0x6C, 0x6F]));
    }

    #[test]
    fn test_validate_complete() {
        assert!(validate_complete("The quick brown fox".as_bytes()));
        assert!(!validate_complete(&[0xC0, 0xAF]));
        assert!(!validate_complete(&[0xE1])); // dangling lead byte
    }
}
