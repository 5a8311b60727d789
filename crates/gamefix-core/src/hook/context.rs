//! Register snapshot handed to hook callbacks.
//!
//! Field order mirrors the frame the trampoline builds on the stack, lowest
//! address first. Changing it means changing the stub encoder too.

use std::fmt;

/// One 128-bit SSE register, viewed as lanes.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Xmm([u32; 4]);

impl Xmm {
    pub fn from_f32(values: [f32; 4]) -> Self {
        Self(values.map(f32::to_bits))
    }

    pub fn u32(&self, lane: usize) -> u32 {
        self.0[lane]
    }

    pub fn set_u32(&mut self, lane: usize, value: u32) {
        self.0[lane] = value;
    }

    /// Scalar single-precision value lives in lane 0.
    pub fn f32(&self, lane: usize) -> f32 {
        f32::from_bits(self.0[lane])
    }

    pub fn set_f32(&mut self, lane: usize, value: f32) {
        self.0[lane] = value.to_bits();
    }

    pub fn f64(&self, lane: usize) -> f64 {
        let low = self.0[lane * 2] as u64;
        let high = self.0[lane * 2 + 1] as u64;
        f64::from_bits(low | (high << 32))
    }

    pub fn set_f64(&mut self, lane: usize, value: f64) {
        let bits = value.to_bits();
        self.0[lane * 2] = bits as u32;
        self.0[lane * 2 + 1] = (bits >> 32) as u32;
    }

    pub fn to_f32_array(&self) -> [f32; 4] {
        self.0.map(f32::from_bits)
    }
}

impl fmt::Debug for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Xmm({:08x} {:08x} {:08x} {:08x})",
            self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

/// General purpose, flags, and SSE registers at the hook site.
///
/// Writes to any field except `rsp` are applied when the callback returns.
/// Setting `rip` to something other than the hook address redirects
/// execution there instead of resuming after the hook.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct RegisterContext {
    pub xmm: [Xmm; 16],
    pub rflags: usize,
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub r11: usize,
    pub r10: usize,
    pub r9: usize,
    pub r8: usize,
    pub rdi: usize,
    pub rsi: usize,
    pub rbp: usize,
    pub rbx: usize,
    pub rdx: usize,
    pub rcx: usize,
    pub rax: usize,
    /// Stack pointer at the hook site. Read-only in effect.
    pub rsp: usize,
    pub rip: usize,
}

#[cfg(target_arch = "x86_64")]
const _: () = assert!(std::mem::size_of::<RegisterContext>() == 400);

#[cfg(target_arch = "x86_64")]
impl RegisterContext {
    pub fn ip(&self) -> usize {
        self.rip
    }

    pub fn set_ip(&mut self, address: usize) {
        self.rip = address;
    }

    pub fn sp(&self) -> usize {
        self.rsp
    }

    pub fn flags(&self) -> usize {
        self.rflags
    }
}

/// General purpose, flags, and SSE registers at the hook site.
///
/// Writes to any field except `esp` are applied when the callback returns.
/// Setting `eip` to something other than the hook address redirects
/// execution there instead of resuming after the hook.
#[cfg(target_arch = "x86")]
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct RegisterContext {
    pub xmm: [Xmm; 8],
    pub eflags: usize,
    pub edi: usize,
    pub esi: usize,
    pub ebp: usize,
    pub ebx: usize,
    pub edx: usize,
    pub ecx: usize,
    pub eax: usize,
    /// Stack pointer at the hook site. Read-only in effect.
    pub esp: usize,
    pub eip: usize,
}

#[cfg(target_arch = "x86")]
const _: () = assert!(std::mem::size_of::<RegisterContext>() == 168);

#[cfg(target_arch = "x86")]
impl RegisterContext {
    pub fn ip(&self) -> usize {
        self.eip
    }

    pub fn set_ip(&mut self, address: usize) {
        self.eip = address;
    }

    pub fn sp(&self) -> usize {
        self.esp
    }

    pub fn flags(&self) -> usize {
        self.eflags
    }
}
