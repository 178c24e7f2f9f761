//! Segfetch Core Library
//!
//! This library provides the response-handling stage of a segmented,
//! resumable HTTP download client driven by a cooperative, single-threaded
//! command scheduler.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`dispatch`] - Response classification and strategy dispatch
//! - [`engine`] - Command queue, scheduler loop and fresh-attempt command
//! - [`http`] - Request/response metadata and filename derivation
//! - [`transfer`] - Transfer decoders and the body-transfer command
//! - [`storage`] - Piece storage, segment assignment and progress snapshots
//! - [`group`] - Per-download request group and download context
//! - [`registry`] - Process-wide duplicate-download registry
//! - [`net`] - Connection contracts, socket pool and a scripted connection
//! - [`config`] - Download options

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod group;
pub mod http;
pub mod net;
pub mod registry;
pub mod storage;
#[cfg(test)]
pub(crate) mod test_support;
pub mod transfer;

// Re-export commonly used types
pub use config::{ConfigError, DownloadOptions};
pub use dispatch::{DispatchPlan, EncodingPath, RedirectPlan, ResponseCommand, classify};
pub use engine::{Attempt, Command, Cuid, Engine, RunReport};
pub use error::{DispatchError, FailureType, classify_error};
pub use group::{DownloadContext, GroupId, GroupStatus, RequestGroup};
pub use http::{DownloadRequest, DownloadResponse};
pub use net::{Connection, Connector, PeerAddr, ScriptedConnection, ScriptedConnector, SocketPool};
pub use registry::DownloadRegistry;
pub use storage::{PieceStorage, ProgressSnapshot, Segment, SegmentManager};
pub use transfer::{TransferCommand, TransferDecoder, TransferMode, resolve_decoder};
