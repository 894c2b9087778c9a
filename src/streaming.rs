//! Streaming output support
//!
//! Events posted back from the session worker, and reassembly of token byte
//! pieces into valid UTF-8 for display.

/// An event emitted while streaming a turn's response.
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// The turn completed
    Done,
    /// The turn was aborted
    Error(String),
}

impl StreamToken {
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }
}

/// Accumulates token byte pieces and yields only complete UTF-8.
///
/// Token vocabularies split multi-byte characters across tokens, so a piece
/// may end mid-character. Bytes of an incomplete trailing sequence are held
/// back until the next piece arrives; definitely invalid bytes are dropped.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    buf: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one token piece, returning any newly completed text.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.buf.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.buf) {
                Ok(s) => {
                    out.push_str(s);
                    self.buf.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // safety of unwrap: the prefix was just validated
                    out.push_str(std::str::from_utf8(&self.buf[..valid]).unwrap());
                    match e.error_len() {
                        // incomplete trailing sequence: wait for more bytes
                        None => {
                            self.buf.drain(..valid);
                            break;
                        }
                        // invalid sequence: drop it and keep scanning
                        Some(bad) => {
                            self.buf.drain(..valid + bad);
                        }
                    }
                }
            }
        }
        (!out.is_empty()).then_some(out)
    }

    /// Emits whatever is decodable at end of turn, discarding a dangling
    /// partial sequence.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let s = String::from_utf8_lossy(&rest);
        let s = s.trim_end_matches('\u{FFFD}');
        (!s.is_empty()).then(|| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_token_variants() {
        let token = StreamToken::Token("hello".to_string());
        assert!(token.is_token());
        assert_eq!(token.as_token(), Some("hello"));

        assert!(StreamToken::Done.is_done());
        assert!(StreamToken::Error("boom".to_string()).is_error());
    }

    #[test]
    fn passes_complete_utf8_through() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"hello"), Some("hello".to_string()));
        assert_eq!(assembler.flush(), None);
    }

    #[test]
    fn holds_back_split_multibyte_char() {
        // U+00E9 'é' is 0xC3 0xA9
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"caf\xC3"), Some("caf".to_string()));
        assert_eq!(assembler.push(b"\xA9!"), Some("\u{e9}!".to_string()));
    }

    #[test]
    fn holds_back_split_four_byte_char() {
        // U+1F600 split across three pieces
        let bytes = "\u{1F600}".as_bytes();
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&bytes[..1]), None);
        assert_eq!(assembler.push(&bytes[1..3]), None);
        assert_eq!(assembler.push(&bytes[3..]), Some("\u{1F600}".to_string()));
    }

    #[test]
    fn drops_invalid_bytes() {
        let mut assembler = Utf8Assembler::new();
        // 0xFF can never start a UTF-8 sequence
        assert_eq!(assembler.push(b"a\xFFb"), Some("ab".to_string()));
    }

    #[test]
    fn flush_discards_dangling_partial() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"ok\xC3"), Some("ok".to_string()));
        assert_eq!(assembler.flush(), None);
    }

    #[test]
    fn empty_piece_yields_nothing() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b""), None);
    }
}
