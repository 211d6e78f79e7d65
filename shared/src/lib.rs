//! Portgate shared library
//!
//! Wire protocol types used by both the agent and the relay:
//! the tunnel frame codec and the JSON payload descriptors.

pub mod descriptor;
pub mod error;
pub mod frame;

pub use error::{Error, Result};
pub use frame::{Frame, FrameKind, RequestId};
