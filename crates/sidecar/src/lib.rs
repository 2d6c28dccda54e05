//! Subprocess channel to native runner scripts.
//!
//! A [`SidecarChannel`] spawns one process per call, frames its stdout into
//! newline-delimited JSON messages and resolves to a single terminal outcome.
//! The [`ChannelSupervisor`] runs every call on its own isolated task so one
//! misbehaving runner never affects another caller.

pub mod channel;
pub mod error;
pub mod framing;
pub mod locator;
pub mod message;
pub mod supervisor;

pub use channel::{SidecarChannel, SidecarRequest};
pub use error::SidecarError;
pub use framing::{LineFramer, split_lines};
pub use locator::ScriptLocator;
pub use message::{ProgressUpdate, ScriptMessage, parse_line};
pub use supervisor::{ChannelSupervisor, SupervisorStats};

pub type Result<T> = std::result::Result<T, SidecarError>;
