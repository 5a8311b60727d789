//! Mid-function hooks.
//!
//! A hook overwrites `byte_count` bytes at an instruction boundary with a
//! jump into a trampoline. The trampoline saves every register into a
//! [`RegisterContext`], calls the user callback with it, writes the
//! (possibly modified) registers back and continues at the context's
//! instruction pointer. If the callback leaves that pointer alone, execution
//! resumes right after the overwritten bytes, or at a copy of them when
//! [`HookOptions::replay_original`] is set. A panicking callback is caught
//! and its register writes are discarded.
//!
//! ```no_run
//! use gamefix_core::{HookManager, HookOptions};
//!
//! # fn demo(fov_site: usize) -> gamefix_core::Result<()> {
//! let mut hooks = HookManager::new();
//! // SAFETY: fov_site starts `mulss xmm0, xmm1; movss [rbx+0x1C], xmm0`,
//! // 9 bytes with no relative operands.
//! unsafe {
//!     hooks.install_with(fov_site, 9, HookOptions { replay_original: true }, |ctx| {
//!         let fov = ctx.xmm[0].f32(0);
//!         ctx.xmm[0].set_f32(0, fov * 1.25);
//!     })?;
//! }
//! # Ok(())
//! # }
//! ```

mod context;
mod registry;
mod trampoline;
#[cfg(target_arch = "x86")]
mod x86;
#[cfg(target_arch = "x86_64")]
mod x64;

pub use context::{RegisterContext, Xmm};

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::memory::ExecutableBuffer;
use crate::patch::write_code;
use crate::platform::WritableRange;
use trampoline::{NEAR_JUMP_LEN, TRAMPOLINE_SIZE};

/// Callback run on every pass through a hook site.
pub type HookCallback = dyn Fn(&mut RegisterContext) + Send + Sync + 'static;

/// Lifecycle of a [`Hook`].
///
/// There is no "not yet installed" value: a failed [`Hook::install`] returns
/// an error and yields no `Hook`, leaving the site untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HookState {
    Installed,
    Removed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookOptions {
    /// Run the overwritten instructions from a copy after the callback.
    ///
    /// Only valid when those instructions are position independent (no
    /// relative branches or RIP-relative operands).
    pub replay_original: bool,
}

/// State the trampoline passes back into [`dispatch`].
struct HookShared {
    target: usize,
    resume: usize,
    callback: Box<HookCallback>,
}

/// Entered from trampoline code with the hook's shared state and the frame
/// it just saved on the stack.
unsafe extern "C" fn dispatch(shared: *const HookShared, context: *mut RegisterContext) {
    // SAFETY: the trampoline passes the pointer baked in at install time,
    // which outlives the trampoline, and a frame on the current stack.
    let (shared, context) = unsafe { (&*shared, &mut *context) };

    let saved = context.clone();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (shared.callback)(context)));
    if outcome.is_err() {
        error!(
            "Hook callback at {:#x} panicked, registers restored, resuming at {:#x}",
            shared.target, shared.resume
        );
        *context = saved;
        context.set_ip(shared.target);
    }

    if context.ip() == shared.target {
        context.set_ip(shared.resume);
    }
}

/// One installed (or once installed) mid-function hook. Uninstalls on drop.
pub struct Hook {
    target: usize,
    original: Vec<u8>,
    state: HookState,
    trampoline: Option<ExecutableBuffer>,
    shared: Option<Box<HookShared>>,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("target", &format_args!("{:#x}", self.target))
            .field("byte_count", &self.original.len())
            .field("state", &self.state)
            .field(
                "trampoline",
                &self.trampoline.as_ref().map(|t| format!("{:#x}", t.address())),
            )
            .finish()
    }
}

impl Hook {
    /// Redirect `target..target+byte_count` through `callback`.
    ///
    /// Fails with `HookTooShort` when `byte_count` cannot hold the redirect,
    /// `HookInstallConflict` when the range overlaps another live hook, and
    /// `ProtectionChangeFailed` when the site cannot be made writable. On
    /// failure nothing at the site has been changed.
    ///
    /// # Safety
    ///
    /// `target` must start an instruction and `byte_count` must cover whole
    /// instructions, none of which may be a jump target from elsewhere. No
    /// thread may be executing inside the range while it is rewritten.
    pub unsafe fn install<F>(
        target: usize,
        byte_count: usize,
        options: HookOptions,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(&mut RegisterContext) + Send + Sync + 'static,
    {
        if byte_count < NEAR_JUMP_LEN {
            return Err(Error::HookTooShort {
                address: target,
                byte_count,
                required: NEAR_JUMP_LEN,
            });
        }

        registry::claim(target, byte_count)?;
        // SAFETY: forwarded from the caller.
        let installed = unsafe { Self::install_claimed(target, byte_count, options, Box::new(callback)) };
        if installed.is_err() {
            registry::release(target);
        }
        installed
    }

    unsafe fn install_claimed(
        target: usize,
        byte_count: usize,
        options: HookOptions,
        callback: Box<HookCallback>,
    ) -> Result<Self> {
        let mut original = vec![0u8; byte_count];
        {
            // Fails on unmapped pages instead of faulting on the read.
            // SAFETY: nothing is written while the guard lives.
            let _guard = unsafe { WritableRange::acquire(target, byte_count)? };
            // SAFETY: the range is mapped and readable while the guard lives.
            unsafe {
                std::ptr::copy_nonoverlapping(target as *const u8, original.as_mut_ptr(), byte_count);
            }
        }

        let mut buffer = match ExecutableBuffer::allocate_near(target, TRAMPOLINE_SIZE) {
            Ok(buffer) => buffer,
            Err(e) => {
                debug!("No trampoline memory near {:#x} ({}), using any address", target, e);
                ExecutableBuffer::allocate(TRAMPOLINE_SIZE)?
            }
        };
        let redirect = trampoline::site_jump(target, buffer.address(), byte_count)?;

        let mut shared = Box::new(HookShared {
            target,
            resume: target + byte_count,
            callback,
        });
        let dispatch_fn: unsafe extern "C" fn(*const HookShared, *mut RegisterContext) = dispatch;
        let code = trampoline::build(
            buffer.address(),
            target,
            &original,
            &*shared as *const HookShared as usize,
            dispatch_fn as usize,
            options.replay_original,
        );
        shared.resume = code.resume;
        buffer.write(0, &code.bytes)?;
        buffer.seal()?;

        // SAFETY: forwarded from the caller.
        unsafe { write_code(target, &redirect)? };

        info!(
            "Installed hook at {:#x} ({} bytes) via trampoline {:#x}",
            target,
            byte_count,
            buffer.address()
        );
        Ok(Self {
            target,
            original,
            state: HookState::Installed,
            trampoline: Some(buffer),
            shared: Some(shared),
        })
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn byte_count(&self) -> usize {
        self.original.len()
    }

    /// Bytes the redirect replaced.
    pub fn original_bytes(&self) -> &[u8] {
        &self.original
    }

    pub fn state(&self) -> HookState {
        self.state
    }

    pub fn is_installed(&self) -> bool {
        self.state == HookState::Installed
    }

    /// Put the original bytes back and free the trampoline. A no-op unless
    /// the hook is installed. On failure the hook stays installed.
    ///
    /// No thread may be executing inside the trampoline or the callback.
    pub fn uninstall(&mut self) -> Result<()> {
        if self.state != HookState::Installed {
            return Ok(());
        }
        // SAFETY: restores the bytes read from this site at install time.
        unsafe { write_code(self.target, &self.original)? };
        self.trampoline = None;
        self.shared = None;
        registry::release(self.target);
        self.state = HookState::Removed;
        info!("Removed hook at {:#x}", self.target);
        Ok(())
    }

    /// Keep the hook installed for the rest of the process lifetime.
    pub fn leak(self) {
        debug!("Hook at {:#x} leaked", self.target);
        std::mem::forget(self);
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        if let Err(e) = self.uninstall() {
            warn!("Failed to remove hook at {:#x}: {}", self.target, e);
            // The site still jumps into the trampoline; keep it alive.
            if let Some(trampoline) = self.trampoline.take() {
                std::mem::forget(trampoline);
            }
            if let Some(shared) = self.shared.take() {
                std::mem::forget(shared);
            }
        }
    }
}

/// Handle to a hook owned by a [`HookManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(usize);

/// Owns hooks and removes them, newest first, when dropped.
#[derive(Debug, Default)]
pub struct HookManager {
    hooks: Vec<Hook>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install with default [`HookOptions`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Hook::install`].
    pub unsafe fn install<F>(&mut self, target: usize, byte_count: usize, callback: F) -> Result<HookId>
    where
        F: Fn(&mut RegisterContext) + Send + Sync + 'static,
    {
        // SAFETY: forwarded from the caller.
        unsafe { self.install_with(target, byte_count, HookOptions::default(), callback) }
    }

    /// # Safety
    ///
    /// Same contract as [`Hook::install`].
    pub unsafe fn install_with<F>(
        &mut self,
        target: usize,
        byte_count: usize,
        options: HookOptions,
        callback: F,
    ) -> Result<HookId>
    where
        F: Fn(&mut RegisterContext) + Send + Sync + 'static,
    {
        // SAFETY: forwarded from the caller.
        let hook = unsafe { Hook::install(target, byte_count, options, callback)? };
        self.hooks.push(hook);
        Ok(HookId(self.hooks.len() - 1))
    }

    pub fn get(&self, id: HookId) -> Option<&Hook> {
        self.hooks.get(id.0)
    }

    pub fn uninstall(&mut self, id: HookId) -> Result<()> {
        match self.hooks.get_mut(id.0) {
            Some(hook) => hook.uninstall(),
            None => Ok(()),
        }
    }

    /// Uninstall every hook, newest first. Keeps going past failures and
    /// returns the first one.
    pub fn uninstall_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for hook in self.hooks.iter_mut().rev() {
            if let Err(e) = hook.uninstall() {
                warn!("Failed to remove hook at {:#x}: {}", hook.target(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove and uninstall every hook added after the first `len`, newest
    /// first. Returns the first uninstall failure; hooks that could not be
    /// removed keep their trampolines alive.
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        let mut first_error = None;
        while self.hooks.len() > len {
            let Some(mut hook) = self.hooks.pop() else {
                break;
            };
            if let Err(e) = hook.uninstall() {
                warn!("Failed to remove hook at {:#x}: {}", hook.target(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn installed_count(&self) -> usize {
        self.hooks.iter().filter(|hook| hook.is_installed()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hook> {
        self.hooks.iter()
    }

    /// Keep every hook installed for the rest of the process lifetime.
    pub fn leak_all(&mut self) {
        for hook in self.hooks.drain(..) {
            hook.leak();
        }
    }
}

impl Drop for HookManager {
    fn drop(&mut self) {
        while let Some(hook) = self.hooks.pop() {
            drop(hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// `(alignment, remainder)` of the stack pointer at function entry.
    #[cfg(target_arch = "x86_64")]
    const ENTRY_SP: (usize, usize) = (16, 8);
    #[cfg(target_arch = "x86")]
    const ENTRY_SP: (usize, usize) = (4, 0);

    #[cfg(target_arch = "x86_64")]
    fn set_return(ctx: &mut RegisterContext, value: usize) {
        ctx.rax = value;
    }

    #[cfg(target_arch = "x86")]
    fn set_return(ctx: &mut RegisterContext, value: usize) {
        ctx.eax = value;
    }

    #[cfg(target_arch = "x86_64")]
    fn return_value(ctx: &RegisterContext) -> usize {
        ctx.rax
    }

    #[cfg(target_arch = "x86")]
    fn return_value(ctx: &RegisterContext) -> usize {
        ctx.eax
    }

    // mov eax, 1; nop; ret; mov eax, 2; ret
    const CODE: [u8; 13] = [
        0xB8, 0x01, 0x00, 0x00, 0x00, 0x90, 0xC3, 0xB8, 0x02, 0x00, 0x00, 0x00, 0xC3,
    ];
    const ALT_OFFSET: usize = 7;
    const SITE_LEN: usize = 6;

    struct TestFunction {
        buffer: ExecutableBuffer,
    }

    impl TestFunction {
        fn new() -> Self {
            let mut buffer = ExecutableBuffer::allocate(CODE.len()).unwrap();
            buffer.write(0, &CODE).unwrap();
            buffer.seal().unwrap();
            Self { buffer }
        }

        fn address(&self) -> usize {
            self.buffer.address()
        }

        fn call(&self) -> u32 {
            // SAFETY: the buffer holds a complete function.
            let func: extern "C" fn() -> u32 = unsafe { std::mem::transmute(self.address()) };
            func()
        }

        fn bytes(&self) -> Vec<u8> {
            // SAFETY: the buffer stays mapped and readable.
            unsafe { std::slice::from_raw_parts(self.address() as *const u8, CODE.len()).to_vec() }
        }
    }

    #[test]
    fn test_callback_redirects_execution() {
        let function = TestFunction::new();
        assert_eq!(function.call(), 1);

        let alt = function.address() + ALT_OFFSET;
        // SAFETY: the site covers `mov eax, 1; nop`.
        let mut hook = unsafe {
            Hook::install(function.address(), SITE_LEN, HookOptions::default(), move |ctx| {
                ctx.set_ip(alt);
            })
        }
        .unwrap();
        assert!(hook.is_installed());
        assert_eq!(function.call(), 2);

        hook.uninstall().unwrap();
        assert_eq!(hook.state(), HookState::Removed);
        assert_eq!(function.bytes(), CODE.to_vec());
        assert_eq!(function.call(), 1);
    }

    #[test]
    fn test_register_writes_reach_the_function() {
        let function = TestFunction::new();
        // SAFETY: as above.
        let _hook = unsafe {
            Hook::install(function.address(), SITE_LEN, HookOptions::default(), |ctx| {
                set_return(ctx, 42);
            })
        }
        .unwrap();
        // Overwritten `mov eax, 1` is skipped; execution falls through to `ret`.
        assert_eq!(function.call(), 42);
    }

    #[test]
    fn test_replay_original_runs_displaced_code() {
        let function = TestFunction::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        // SAFETY: `mov eax, imm32; nop` is position independent.
        let _hook = unsafe {
            Hook::install(
                function.address(),
                SITE_LEN,
                HookOptions {
                    replay_original: true,
                },
                move |ctx| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    set_return(ctx, 42);
                },
            )
        }
        .unwrap();
        assert_eq!(function.call(), 1);
        assert_eq!(function.call(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_context_reports_hook_address() {
        let function = TestFunction::new();
        let seen_ip = Arc::new(AtomicUsize::new(0));
        let seen_sp = Arc::new(AtomicUsize::new(0));
        let (ip, sp) = (seen_ip.clone(), seen_sp.clone());
        // SAFETY: as above.
        let _hook = unsafe {
            Hook::install(function.address(), SITE_LEN, HookOptions { replay_original: true }, move |ctx| {
                ip.store(ctx.ip(), Ordering::SeqCst);
                sp.store(ctx.sp(), Ordering::SeqCst);
            })
        }
        .unwrap();
        assert_eq!(function.call(), 1);
        assert_eq!(seen_ip.load(Ordering::SeqCst), function.address());
        let (align, remainder) = ENTRY_SP;
        assert_eq!(seen_sp.load(Ordering::SeqCst) % align, remainder);
    }

    #[test]
    fn test_panicking_callback_falls_through() {
        let function = TestFunction::new();
        // SAFETY: as above.
        let _hook = unsafe {
            Hook::install(function.address(), SITE_LEN, HookOptions { replay_original: true }, |_ctx| {
                panic!("callback failure");
            })
        }
        .unwrap();
        assert_eq!(function.call(), 1);
    }

    #[test]
    fn test_overlapping_install_rejected() {
        let function = TestFunction::new();
        // SAFETY: as above.
        let mut first = unsafe {
            Hook::install(function.address(), SITE_LEN, HookOptions::default(), |_| {})
        }
        .unwrap();
        let bytes_with_hook = function.bytes();

        // SAFETY: rejected before anything is written.
        let second = unsafe {
            Hook::install(function.address() + 1, SITE_LEN, HookOptions::default(), |_| {})
        };
        assert!(matches!(second, Err(Error::HookInstallConflict { .. })));
        assert_eq!(function.bytes(), bytes_with_hook);

        first.uninstall().unwrap();
        // SAFETY: the range is free again; the site covers `mov eax, 1; nop`.
        let again = unsafe {
            Hook::install(function.address(), SITE_LEN, HookOptions::default(), |_| {})
        };
        assert!(again.is_ok());
    }

    #[test]
    fn test_too_short_site_rejected() {
        let function = TestFunction::new();
        // SAFETY: rejected before anything is written.
        let result = unsafe { Hook::install(function.address(), 4, HookOptions::default(), |_| {}) };
        assert!(matches!(
            result,
            Err(Error::HookTooShort {
                byte_count: 4,
                required: 5,
                ..
            })
        ));
        assert_eq!(function.bytes(), CODE.to_vec());
    }

    #[test]
    fn test_drop_restores_site() {
        let function = TestFunction::new();
        {
            // SAFETY: as above.
            let _hook = unsafe {
                Hook::install(function.address(), SITE_LEN, HookOptions::default(), |ctx| set_return(ctx, 7))
            }
            .unwrap();
            assert_eq!(function.call(), 7);
        }
        assert_eq!(function.bytes(), CODE.to_vec());
        assert_eq!(function.call(), 1);
    }

    #[test]
    fn test_manager_uninstall_all() {
        let first = TestFunction::new();
        let second = TestFunction::new();
        let mut hooks = HookManager::new();
        // SAFETY: as above.
        let id = unsafe {
            hooks.install(first.address(), SITE_LEN, |ctx| set_return(ctx, 10))
        }
        .unwrap();
        // SAFETY: as above.
        unsafe {
            hooks.install_with(second.address(), SITE_LEN, HookOptions::default(), |ctx| set_return(ctx, 20))
        }
        .unwrap();
        assert_eq!(hooks.installed_count(), 2);
        assert_eq!((first.call(), second.call()), (10, 20));

        hooks.uninstall(id).unwrap();
        hooks.uninstall(id).unwrap();
        assert_eq!(hooks.get(id).map(Hook::state), Some(HookState::Removed));
        assert_eq!(first.call(), 1);

        hooks.uninstall_all().unwrap();
        assert_eq!(hooks.installed_count(), 0);
        assert_eq!(hooks.len(), 2);
        assert_eq!(second.call(), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(HookState::Installed.to_string(), "installed");
    }

    #[test]
    fn test_manager_truncate_removes_newest() {
        let first = TestFunction::new();
        let second = TestFunction::new();
        let mut hooks = HookManager::new();
        // SAFETY: as above.
        unsafe { hooks.install(first.address(), SITE_LEN, |ctx| set_return(ctx, 10)) }.unwrap();
        // SAFETY: as above.
        unsafe { hooks.install(second.address(), SITE_LEN, |ctx| set_return(ctx, 20)) }.unwrap();

        hooks.truncate(1).unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(second.bytes(), CODE.to_vec());
        assert_eq!((first.call(), second.call()), (10, 1));
    }

    #[test]
    fn test_unmapped_target_is_an_error() {
        // SAFETY: the page at 0x1000 is never mapped; the install is rejected
        // before anything is read or written.
        let result = unsafe { Hook::install(0x1000, SITE_LEN, HookOptions::default(), |_| {}) };
        assert!(matches!(result, Err(Error::ProtectionChangeFailed { .. })));
        // The range was released again.
        assert!(registry::claim(0x1000, SITE_LEN).is_ok());
        registry::release(0x1000);
    }

    #[test]
    fn test_dispatch_panic_restores_registers() {
        let shared = HookShared {
            target: 0x40_0000,
            resume: 0x40_0006,
            callback: Box::new(|ctx: &mut RegisterContext| {
                set_return(ctx, 99);
                ctx.xmm[0].set_f32(0, 2.0);
                panic!("callback failure");
            }),
        };
        let mut context = RegisterContext::default();
        set_return(&mut context, 5);
        context.set_ip(shared.target);

        // SAFETY: both pointers are valid for the call.
        unsafe { dispatch(&shared, &mut context) };

        assert_eq!(return_value(&context), 5);
        assert_eq!(context.xmm[0].f32(0), 0.0);
        assert_eq!(context.ip(), shared.resume);
    }

    #[test]
    fn test_dispatch_keeps_redirect() {
        let shared = HookShared {
            target: 0x40_0000,
            resume: 0x40_0006,
            callback: Box::new(|ctx: &mut RegisterContext| ctx.set_ip(0x50_0000)),
        };
        let mut context = RegisterContext::default();
        context.set_ip(shared.target);
        // SAFETY: both pointers are valid for the call.
        unsafe { dispatch(&shared, &mut context) };
        assert_eq!(context.ip(), 0x50_0000);
    }
}
