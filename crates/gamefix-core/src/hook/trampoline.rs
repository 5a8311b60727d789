//! Trampoline layout shared by both architectures.

#[cfg(target_arch = "x86")]
use super::x86 as arch;
#[cfg(target_arch = "x86_64")]
use super::x64 as arch;

use crate::error::{Error, Result};
use crate::patch::NOP;

/// Length of a `jmp rel32`, the shortest redirect the hook site accepts.
pub(crate) const NEAR_JUMP_LEN: usize = 5;

/// Trampolines get one page; the stub plus the longest replay block fit easily.
pub(crate) const TRAMPOLINE_SIZE: usize = 0x1000;

#[derive(Debug, Default)]
pub(crate) struct Assembler {
    code: Vec<u8>,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub(crate) fn emit_u32(&mut self, value: u32) {
        self.emit(&value.to_le_bytes());
    }

    #[cfg_attr(target_arch = "x86", allow(dead_code))]
    pub(crate) fn emit_u64(&mut self, value: u64) {
        self.emit(&value.to_le_bytes());
    }

    pub(crate) fn len(&self) -> usize {
        self.code.len()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.code
    }
}

/// Unconditional jump placed at `from`, near if it reaches.
pub(crate) fn jump(from: usize, to: usize) -> Vec<u8> {
    match arch::near_jump(from, to) {
        Some(code) => code.to_vec(),
        None => arch::far_jump(to),
    }
}

/// The redirect written over the hook site, NOP-padded to `byte_count`.
pub(crate) fn site_jump(site: usize, destination: usize, byte_count: usize) -> Result<Vec<u8>> {
    let mut code = match arch::near_jump(site, destination) {
        Some(code) if byte_count >= NEAR_JUMP_LEN => code.to_vec(),
        None if byte_count >= arch::FAR_JUMP_LEN => arch::far_jump(destination),
        Some(_) => {
            return Err(Error::HookTooShort {
                address: site,
                byte_count,
                required: NEAR_JUMP_LEN,
            });
        }
        None => {
            return Err(Error::HookTooShort {
                address: site,
                byte_count,
                required: arch::FAR_JUMP_LEN,
            });
        }
    };
    code.resize(byte_count, NOP);
    Ok(code)
}

/// Trampoline code plus the address execution resumes at when the callback
/// leaves the instruction pointer alone.
#[derive(Debug)]
pub(crate) struct TrampolineCode {
    pub bytes: Vec<u8>,
    pub resume: usize,
}

/// Lay out a trampoline that will live at `base`.
///
/// With `replay`, the displaced instructions are copied after the stub and
/// followed by a jump back past the hook site; execution resumes there.
pub(crate) fn build(
    base: usize,
    target: usize,
    original: &[u8],
    shared: usize,
    dispatch: usize,
    replay: bool,
) -> TrampolineCode {
    let mut asm = Assembler::new();
    arch::emit_context_stub(&mut asm, target, shared, dispatch);
    let after_site = target + original.len();

    let resume = if replay {
        let replay_at = base + asm.len();
        asm.emit(original);
        let jump_at = base + asm.len();
        asm.emit(&jump(jump_at, after_site));
        replay_at
    } else {
        after_site
    };

    TrampolineCode {
        bytes: asm.into_bytes(),
        resume,
    }
}
