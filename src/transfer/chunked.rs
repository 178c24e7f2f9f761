//! Streaming decoder for the `chunked` transfer coding (RFC 9112 §7.1).
//!
//! ```text
//! chunk-size [; ext] CRLF
//! chunk-data CRLF
//! ...
//! 0 CRLF
//! [trailer-field CRLF]...
//! CRLF
//! ```
//!
//! The decoder never consumes input past the final CRLF, so bytes of a
//! following response on the same connection stay with the caller.

/// Longest accepted chunk-size or trailer line.
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Decoder position within the chunked framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedState {
    /// Reading a chunk-size line.
    Size,
    /// Reading chunk data.
    Data,
    /// Expecting CR after chunk data.
    DataCr,
    /// Expecting LF after chunk data.
    DataLf,
    /// Reading trailer lines after the last chunk.
    Trailer,
    /// Final CRLF seen; the body is complete.
    Done,
}

/// Malformed chunked framing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed chunked body: {0}")]
pub struct ChunkedError(pub(crate) &'static str);

/// Incremental chunked decoder.
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    line: Vec<u8>,
    remaining_in_chunk: u64,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    /// Creates a decoder positioned before the first chunk-size line.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ChunkedState::Size,
            line: Vec::new(),
            remaining_in_chunk: 0,
        }
    }

    /// Resets to the initial state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current framing state.
    #[must_use]
    pub fn state(&self) -> ChunkedState {
        self.state
    }

    /// Whether the terminating CRLF has been consumed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == ChunkedState::Done
    }

    /// Decodes `input`, appending payload bytes to `out`.
    ///
    /// Returns the number of input bytes consumed; it is less than
    /// `input.len()` only once the body is complete.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkedError`] on invalid framing.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ChunkedError> {
        let mut pos = 0;
        while pos < input.len() && self.state != ChunkedState::Done {
            match self.state {
                ChunkedState::Size | ChunkedState::Trailer => {
                    let byte = input[pos];
                    pos += 1;
                    if byte != b'\n' {
                        if self.line.len() >= MAX_LINE_LENGTH {
                            return Err(ChunkedError("line too long"));
                        }
                        self.line.push(byte);
                        continue;
                    }
                    if self.line.pop() != Some(b'\r') {
                        return Err(ChunkedError("bare LF"));
                    }
                    if self.state == ChunkedState::Size {
                        self.finish_size_line()?;
                    } else if self.line.is_empty() {
                        self.state = ChunkedState::Done;
                    }
                    self.line.clear();
                }
                ChunkedState::Data => {
                    let available = input.len() - pos;
                    let take = usize::try_from(self.remaining_in_chunk)
                        .map_or(available, |remaining| remaining.min(available));
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.remaining_in_chunk -= take as u64;
                    if self.remaining_in_chunk == 0 {
                        self.state = ChunkedState::DataCr;
                    }
                }
                ChunkedState::DataCr => {
                    if input[pos] != b'\r' {
                        return Err(ChunkedError("missing CR after chunk data"));
                    }
                    pos += 1;
                    self.state = ChunkedState::DataLf;
                }
                ChunkedState::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(ChunkedError("missing LF after chunk data"));
                    }
                    pos += 1;
                    self.state = ChunkedState::Size;
                }
                ChunkedState::Done => break,
            }
        }
        Ok(pos)
    }

    fn finish_size_line(&mut self) -> Result<(), ChunkedError> {
        let line =
            std::str::from_utf8(&self.line).map_err(|_| ChunkedError("non-ASCII chunk size"))?;
        let size = line.split(';').next().unwrap_or("").trim();
        if size.is_empty() {
            return Err(ChunkedError("empty chunk size"));
        }
        let size = u64::from_str_radix(size, 16).map_err(|_| ChunkedError("bad chunk size"))?;
        self.remaining_in_chunk = size;
        self.state = if size == 0 {
            ChunkedState::Trailer
        } else {
            ChunkedState::Data
        };
        Ok(())
    }
}
