//! Transfer-decoder resolution.

use tracing::debug;

use super::chunked::{ChunkedDecoder, ChunkedError};
use crate::error::DispatchError;
use crate::http::DownloadResponse;

/// A stateful body decoder for a declared transfer-encoding.
#[derive(Debug, Clone)]
pub enum TransferDecoder {
    /// `Transfer-Encoding: chunked`.
    Chunked(ChunkedDecoder),
}

impl TransferDecoder {
    /// Puts the decoder into its start state before the first body byte.
    pub fn init(&mut self) {
        match self {
            Self::Chunked(decoder) => decoder.reset(),
        }
    }

    /// Decodes `input` into `out`, returning the number of input bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkedError`] on invalid framing.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ChunkedError> {
        match self {
            Self::Chunked(decoder) => decoder.feed(input, out),
        }
    }

    /// Whether the encoded body has been fully consumed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        match self {
            Self::Chunked(decoder) => decoder.is_done(),
        }
    }

    /// Name of the coding this decoder handles.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chunked(_) => "chunked",
        }
    }
}

/// Selects the decoder for a response's declared transfer-encoding.
///
/// Returns `Ok(None)` when no transfer-encoding is declared (identity body).
///
/// # Errors
///
/// Returns [`DispatchError::UnsupportedEncoding`] when a transfer-encoding is
/// declared that no decoder handles, including coding lists such as
/// `gzip, chunked`.
pub fn resolve_decoder(response: &DownloadResponse) -> Result<Option<TransferDecoder>, DispatchError> {
    let Some(encoding) = response.transfer_encoding() else {
        return Ok(None);
    };

    let mut decoder = match encoding.to_ascii_lowercase().as_str() {
        "chunked" => TransferDecoder::Chunked(ChunkedDecoder::new()),
        _ => {
            return Err(DispatchError::unsupported_encoding(
                response.url().as_str(),
                encoding,
            ));
        }
    };
    decoder.init();
    debug!(encoding = decoder.name(), "resolved transfer decoder");
    Ok(Some(decoder))
}
