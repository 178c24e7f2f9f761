//! Response classification and strategy dispatch.
//!
//! [`classify`] decides, from request and response metadata alone, which
//! strategy a response calls for. [`ResponseCommand`] acts on that decision:
//! it drives the redirect, context-initialization and resume helpers and
//! enqueues the follow-on command.

mod command;
pub mod init;
mod plan;
pub mod redirect;
pub mod resume;

pub use command::ResponseCommand;
pub use plan::{DispatchPlan, EncodingPath, RedirectPlan, classify};
