//! Everything a fix implementation usually needs.
//!
//! ```ignore
//! use gamefix::prelude::*;
//! ```

pub use crate::config::FixConfig;
pub use crate::error::{Error, Result};
pub use crate::fix::{Fix, FixRegistry};
pub use crate::session::FixSession;
pub use crate::shared::SharedF32;

pub use gamefix_core::{HookOptions, PointerEncoding, RegisterContext, Xmm};
