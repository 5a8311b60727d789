//! Decoding of addresses embedded in instructions.
//!
//! ```text
//! Absolute             D9 05 [imm32/imm64]          target = imm
//! Relative             E8 [rel32]                   target = end_of_field + rel32
//! InstructionRelative  F3 0F 10 05 [disp32]         target = instr + instr_len + disp32
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::image::ModuleImage;

const REL32_LEN: usize = 4;

/// How a pointer is stored at `instruction_address + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PointerEncoding {
    /// Pointer-width little-endian absolute address.
    Absolute { offset: usize },
    /// Signed 32-bit displacement relative to the end of the field itself.
    Relative { offset: usize },
    /// Signed 32-bit displacement relative to the end of the instruction
    /// (x86_64 RIP-relative addressing).
    InstructionRelative { disp_offset: usize, instr_len: usize },
}

impl PointerEncoding {
    /// Offset of the encoded field from the instruction start.
    pub fn field_offset(&self) -> usize {
        match *self {
            PointerEncoding::Absolute { offset } | PointerEncoding::Relative { offset } => offset,
            PointerEncoding::InstructionRelative { disp_offset, .. } => disp_offset,
        }
    }

    /// Decode against `image`. Reads that fall outside the image fail with
    /// `OutOfBounds`; the decoded target itself is not range checked.
    pub fn resolve(&self, image: &ModuleImage<'_>, instruction_address: usize) -> Result<usize> {
        match *self {
            PointerEncoding::Absolute { offset } => {
                image.read_usize(instruction_address.wrapping_add(offset))
            }
            PointerEncoding::Relative { offset } => {
                let field = instruction_address.wrapping_add(offset);
                let disp = image.read_i32(field)?;
                Ok(field
                    .wrapping_add(REL32_LEN)
                    .wrapping_add_signed(disp as isize))
            }
            PointerEncoding::InstructionRelative {
                disp_offset,
                instr_len,
            } => {
                let disp = image.read_i32(instruction_address.wrapping_add(disp_offset))?;
                let next_ip = instruction_address.wrapping_add(instr_len);
                Ok(next_ip.wrapping_add_signed(disp as isize))
            }
        }
    }
}

impl ModuleImage<'_> {
    /// Shorthand for [`PointerEncoding::resolve`].
    pub fn resolve_pointer(&self, instruction_address: usize, encoding: PointerEncoding) -> Result<usize> {
        encoding.resolve(self, instruction_address)
    }
}
