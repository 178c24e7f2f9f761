//! HTTP request and response metadata as seen by the dispatch stage.
//!
//! Wire parsing belongs to the transport; this module only models the
//! already-parsed status line and headers and derives the facts the
//! dispatcher branches on (entity length, transfer-encoding, redirect
//! target, filename).

pub(crate) mod filename;
mod request;
mod response;

pub use request::DownloadRequest;
pub use response::DownloadResponse;
