#![forbid(unsafe_code)]

//! Hyper-V synthetic video ("synthvid") wire protocol.
//!
//! This crate only knows about bytes: protocol versions and their display limits, the pipe/gfx
//! message envelope, and the payload layouts of every message the guest sends or receives. The
//! state machine that drives the protocol lives in `synthvid-gfx`.

mod message;
mod version;

pub use message::*;
pub use version::*;
