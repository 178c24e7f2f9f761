//! Body transfer: transfer-encoding decoders and the streaming command.

mod chunked;
mod command;
mod decoder;

pub use chunked::{ChunkedDecoder, ChunkedError, ChunkedState};
pub use command::{TransferCommand, TransferMode};
pub use decoder::{TransferDecoder, resolve_decoder};
