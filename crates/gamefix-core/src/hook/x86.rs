//! 32-bit x86 stub encoding.
//!
//! Frame built on entry, from the hook site's `esp` downwards:
//!
//! ```text
//! esp-0x04           eip slot   (hook address, later the resume address)
//! esp-0x08           esp slot   (esp at the hook site)
//! esp-0x0C ..        eax ecx edx ebx ebp esi edi eflags
//! .. -0x80           xmm0..xmm7
//! ```

use super::trampoline::Assembler;

pub(crate) const FAR_JUMP_LEN: usize = 6;

const XMM_COUNT: u8 = 8;
const XMM_AREA: u32 = XMM_COUNT as u32 * 16;

/// `jmp rel32`; every 32-bit address is reachable.
pub(crate) fn near_jump(from: usize, to: usize) -> Option<[u8; 5]> {
    let rel = to.wrapping_sub(from.wrapping_add(5)) as u32;
    let mut code = [0xE9, 0, 0, 0, 0];
    code[1..].copy_from_slice(&rel.to_le_bytes());
    Some(code)
}

/// `push imm32; ret`
pub(crate) fn far_jump(to: usize) -> Vec<u8> {
    let mut code = vec![0x68];
    code.extend_from_slice(&(to as u32).to_le_bytes());
    code.push(0xC3);
    code
}

fn movdqu_esp(asm: &mut Assembler, reg: u8, store: bool) {
    let opcode = if store { 0x7F } else { 0x6F };
    asm.emit(&[0xF3, 0x0F, opcode, 0x84 | (reg << 3), 0x24]);
    asm.emit_u32(reg as u32 * 16);
}

/// Save state, call `dispatch(shared, &mut context)`, restore, return to
/// the context's eip.
pub(crate) fn emit_context_stub(asm: &mut Assembler, target: usize, shared: usize, dispatch: usize) {
    asm.emit(&[0x68]); // push target
    asm.emit_u32(target as u32);
    asm.emit(&[0x8D, 0x64, 0x24, 0xFC]); // lea esp, [esp-4]
    asm.emit(&[0x50]); // push eax
    asm.emit(&[0x8D, 0x44, 0x24, 0x0C]); // lea eax, [esp+0x0C]
    asm.emit(&[0x89, 0x44, 0x24, 0x04]); // mov [esp+4], eax
    asm.emit(&[0x51, 0x52, 0x53, 0x55, 0x56, 0x57]); // push ecx edx ebx ebp esi edi
    asm.emit(&[0x9C, 0xFC]); // pushfd; cld

    asm.emit(&[0x8D, 0xA4, 0x24]); // lea esp, [esp-XMM_AREA]
    asm.emit_u32(XMM_AREA.wrapping_neg());
    for reg in 0..XMM_COUNT {
        movdqu_esp(asm, reg, true);
    }

    asm.emit(&[0x89, 0xE3]); // mov ebx, esp
    asm.emit(&[0x83, 0xE4, 0xF0]); // and esp, -16
    asm.emit(&[0x83, 0xEC, 0x08]); // sub esp, 8
    asm.emit(&[0x53]); // push ebx
    asm.emit(&[0x68]); // push shared
    asm.emit_u32(shared as u32);
    asm.emit(&[0xB8]); // mov eax, dispatch
    asm.emit_u32(dispatch as u32);
    asm.emit(&[0xFF, 0xD0]); // call eax
    asm.emit(&[0x89, 0xDC]); // mov esp, ebx

    for reg in 0..XMM_COUNT {
        movdqu_esp(asm, reg, false);
    }
    asm.emit(&[0x8D, 0xA4, 0x24]); // lea esp, [esp+XMM_AREA]
    asm.emit_u32(XMM_AREA);
    asm.emit(&[0x9D]); // popfd
    asm.emit(&[0x5F, 0x5E, 0x5D, 0x5B, 0x5A, 0x59, 0x58]); // pop edi esi ebp ebx edx ecx eax
    asm.emit(&[0x8D, 0x64, 0x24, 0x04]); // lea esp, [esp+4]
    asm.emit(&[0xC3]); // ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_near_jump_wraps() {
        assert_eq!(near_jump(0x1000, 0x1005), Some([0xE9, 0, 0, 0, 0]));
        assert_eq!(near_jump(0x1000, 0x1000), Some([0xE9, 0xFB, 0xFF, 0xFF, 0xFF]));
    }

    #[test]
    fn test_far_jump_encoding() {
        assert_eq!(far_jump(0x1122_3344), vec![0x68, 0x44, 0x33, 0x22, 0x11, 0xC3]);
    }

    #[test]
    fn test_stub_ends_with_ret() {
        let mut asm = Assembler::new();
        emit_context_stub(&mut asm, 0x1000, 0x2000, 0x3000);
        let code = asm.into_bytes();
        assert_eq!(&code[..5], &[0x68, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(code.last(), Some(&0xC3));
    }
}
