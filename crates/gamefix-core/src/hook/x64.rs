//! x86_64 stub encoding.
//!
//! Frame built on entry, from the hook site's `rsp` downwards:
//!
//! ```text
//! rsp-0x80           red zone, skipped
//! rsp-0x88           rip slot   (hook address, later the resume address)
//! rsp-0x90           rsp slot   (rsp at the hook site)
//! rsp-0x98 ..        rax rcx rdx rbx rbp rsi rdi r8..r15 rflags
//! .. -0x100          xmm0..xmm15
//! ```
//!
//! The exit path reloads everything, drops to the rip slot and returns
//! with `ret 0x80` so `rsp` ends up where it was at the hook site.

use super::trampoline::Assembler;

pub(crate) const FAR_JUMP_LEN: usize = 14;

const RED_ZONE: u32 = 0x80;
const XMM_COUNT: u8 = 16;
const XMM_AREA: u32 = XMM_COUNT as u32 * 16;

/// `jmp rel32`, if `to` is reachable from `from`.
pub(crate) fn near_jump(from: usize, to: usize) -> Option<[u8; 5]> {
    let rel = (to as i64).wrapping_sub(from as i64 + 5);
    let rel = i32::try_from(rel).ok()?;
    let mut code = [0xE9, 0, 0, 0, 0];
    code[1..].copy_from_slice(&rel.to_le_bytes());
    Some(code)
}

/// `jmp [rip+0]` followed by the absolute target.
pub(crate) fn far_jump(to: usize) -> Vec<u8> {
    let mut code = vec![0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];
    code.extend_from_slice(&(to as u64).to_le_bytes());
    code
}

/// movdqu [rsp+disp32], xmmN (store) or movdqu xmmN, [rsp+disp32] (load)
fn movdqu_rsp(asm: &mut Assembler, reg: u8, store: bool) {
    asm.emit(&[0xF3]);
    if reg >= 8 {
        asm.emit(&[0x44]);
    }
    let opcode = if store { 0x7F } else { 0x6F };
    asm.emit(&[0x0F, opcode, 0x84 | ((reg & 7) << 3), 0x24]);
    asm.emit_u32(reg as u32 * 16);
}

/// Save state, call `dispatch(shared, &mut context)`, restore, return to
/// the context's rip.
pub(crate) fn emit_context_stub(asm: &mut Assembler, target: usize, shared: usize, dispatch: usize) {
    asm.emit(&[0x48, 0x8D, 0x64, 0x24, 0x80]); // lea rsp, [rsp-0x80]
    asm.emit(&[0x48, 0x8D, 0x64, 0x24, 0xF0]); // lea rsp, [rsp-0x10]
    asm.emit(&[0x50]); // push rax
    asm.emit(&[0x48, 0xB8]); // mov rax, target
    asm.emit_u64(target as u64);
    asm.emit(&[0x48, 0x89, 0x44, 0x24, 0x10]); // mov [rsp+0x10], rax
    asm.emit(&[0x48, 0x8D, 0x84, 0x24]); // lea rax, [rsp+0x98]
    asm.emit_u32(RED_ZONE + 0x18);
    asm.emit(&[0x48, 0x89, 0x44, 0x24, 0x08]); // mov [rsp+0x08], rax

    asm.emit(&[0x51, 0x52, 0x53, 0x55, 0x56, 0x57]); // push rcx rdx rbx rbp rsi rdi
    for reg in 0..8u8 {
        asm.emit(&[0x41, 0x50 + reg]); // push r8..r15
    }
    asm.emit(&[0x9C, 0xFC]); // pushfq; cld

    asm.emit(&[0x48, 0x8D, 0xA4, 0x24]); // lea rsp, [rsp-XMM_AREA]
    asm.emit_u32(XMM_AREA.wrapping_neg());
    for reg in 0..XMM_COUNT {
        movdqu_rsp(asm, reg, true);
    }

    asm.emit(&[0x48, 0x89, 0xE3]); // mov rbx, rsp
    asm.emit(&[0x48, 0x83, 0xE4, 0xF0]); // and rsp, -16
    asm.emit(&[0x48, 0x83, 0xEC, 0x20]); // sub rsp, 0x20
    #[cfg(target_os = "windows")]
    {
        asm.emit(&[0x48, 0xB9]); // mov rcx, shared
        asm.emit_u64(shared as u64);
        asm.emit(&[0x48, 0x89, 0xDA]); // mov rdx, rbx
    }
    #[cfg(not(target_os = "windows"))]
    {
        asm.emit(&[0x48, 0xBF]); // mov rdi, shared
        asm.emit_u64(shared as u64);
        asm.emit(&[0x48, 0x89, 0xDE]); // mov rsi, rbx
    }
    asm.emit(&[0x48, 0xB8]); // mov rax, dispatch
    asm.emit_u64(dispatch as u64);
    asm.emit(&[0xFF, 0xD0]); // call rax
    asm.emit(&[0x48, 0x89, 0xDC]); // mov rsp, rbx

    for reg in 0..XMM_COUNT {
        movdqu_rsp(asm, reg, false);
    }
    asm.emit(&[0x48, 0x8D, 0xA4, 0x24]); // lea rsp, [rsp+XMM_AREA]
    asm.emit_u32(XMM_AREA);
    asm.emit(&[0x9D]); // popfq
    for reg in (0..8u8).rev() {
        asm.emit(&[0x41, 0x58 + reg]); // pop r15..r8
    }
    asm.emit(&[0x5F, 0x5E, 0x5D, 0x5B, 0x5A, 0x59, 0x58]); // pop rdi rsi rbp rbx rdx rcx rax
    asm.emit(&[0x48, 0x8D, 0x64, 0x24, 0x08]); // lea rsp, [rsp+8]
    asm.emit(&[0xC2]); // ret RED_ZONE
    asm.emit(&(RED_ZONE as u16).to_le_bytes());
}
