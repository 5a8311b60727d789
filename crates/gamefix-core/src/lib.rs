//! # gamefix-core
//!
//! In-process binary instrumentation engine used by game fixes.
//!
//! This crate provides:
//! - Loaded module lookup by file name
//! - Wildcard byte-pattern (AOB) scanning over a module image
//! - Decoding of absolute and relative pointers embedded in instructions
//! - Protected writes to executable memory
//! - Mid-function hooks exposing the full register context to a callback
//!
//! Supported hosts are Windows and Linux on `x86` and `x86_64`. All access is
//! to the current process's own address space.

pub mod error;
pub mod hook;
pub mod image;
pub mod memory;
pub mod module;
pub mod patch;
pub mod pattern;
pub mod pointer;
pub mod scan;
pub mod signature;

mod platform;

pub use error::{Error, Result};
pub use hook::{Hook, HookId, HookManager, HookOptions, HookState, RegisterContext, Xmm};
pub use image::ModuleImage;
pub use memory::ExecutableBuffer;
pub use module::{Module, loaded_modules, main_module, resolve};
pub use patch::{CodeWriter, NOP, PatchRecord, PatchValue};
pub use pattern::{Pattern, format_pattern, parse_pattern};
pub use pointer::PointerEncoding;
pub use scan::{Match, all_found, scan, scan_first, scan_many};
pub use signature::{CodeSignature, SignatureSet, load_signatures, save_signatures};
