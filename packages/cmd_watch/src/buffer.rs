/// Append-only accumulator for a child process's combined output.
///
/// Raw chunks are decoded incrementally: an incomplete UTF-8 sequence at the
/// end of a chunk is held back until the rest of the character arrives, so
/// the visible text only ever grows and is never rewritten.
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    text: String,
    partial: Vec<u8>,
}

impl OutputBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a raw output chunk.
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let mut data = std::mem::take(&mut self.partial);
        data.extend_from_slice(chunk);

        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    self.text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(skip) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[skip..];
                        }
                        // incomplete trailing sequence, wait for more bytes
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }
        self.partial = rest.to_vec();
    }

    /// All decoded output observed so far.
    pub(crate) fn as_str(&self) -> &str {
        &self.text
    }
}
