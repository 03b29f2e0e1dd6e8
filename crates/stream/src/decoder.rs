/// Incremental UTF-8 decoder for chunked response bodies.
///
/// A chunk boundary may split a multi-byte character; the incomplete suffix is
/// buffered until the following chunk completes it, so a boundary never
/// corrupts a character. Invalid byte sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct TextChunkDecoder {
    pending: Vec<u8>,
}

impl TextChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next chunk, joined with any buffered incomplete suffix.
    ///
    /// Returns the decoded text, which is empty when the chunk held only a
    /// partial character.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        let mut buffer = std::mem::take(&mut self.pending);
        buffer.extend_from_slice(bytes);

        let mut decoded = String::with_capacity(buffer.len());
        let mut rest = buffer.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    break;
                }
                Err(error) => {
                    let valid_up_to = error.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&rest[..valid_up_to]) {
                        decoded.push_str(valid);
                    }
                    match error.error_len() {
                        // Genuinely invalid bytes: replace and keep going.
                        Some(invalid_len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_up_to + invalid_len..];
                        }
                        // Incomplete suffix: hold it for the next chunk.
                        None => {
                            self.pending = rest[valid_up_to..].to_vec();
                            break;
                        }
                    }
                }
            }
        }

        decoded
    }

    /// Flushes the decoder at end of stream.
    ///
    /// A body ending mid-character yields one replacement character, matching
    /// the lossy decode of the invalid tail.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}
