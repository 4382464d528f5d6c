//! # Native Plugin ABI
//!
//! Binds relocated descriptor entry points to callable functions. The
//! image receives two things on every call: a pointer to its own
//! [`PluginContext`] (opaque on the image side), and on `load` a pointer to
//! the host operation table.
//!
//! ```c
//! typedef struct {
//!     void* (*sbrk)(PluginContext* ctx, ptrdiff_t incr);
//!     void  (*print)(PluginContext* ctx, const char* message);
//! } PluginOps;
//! ```
//!
//! Images are 32-bit ARM code, so binding is only possible when the host
//! itself runs on 32-bit ARM.

use alloc::boxed::Box;
use core::ffi::{c_char, c_void, CStr};

use crate::lifecycle::{EntryBinder, PluginContext, PluginEntry};
use crate::loader::{LoadError, LoadedImage};
use crate::Architecture;

/// Value returned by `sbrk` when the adjustment is refused.
pub const SBRK_FAILED: usize = usize::MAX;

/// Host operation table as laid out for images.
#[repr(C)]
pub struct NativeOps {
    pub sbrk: unsafe extern "C" fn(ctx: *mut c_void, incr: isize) -> *mut c_void,
    pub print: unsafe extern "C" fn(ctx: *mut c_void, message: *const c_char),
}

/// The one operation table every image receives.
pub static NATIVE_OPS: NativeOps = NativeOps {
    sbrk: native_sbrk,
    print: native_print,
};

/// `sbrk` as seen by images.
///
/// # Safety
///
/// `ctx` must be null or the context pointer the host passed to the image.
pub unsafe extern "C" fn native_sbrk(ctx: *mut c_void, incr: isize) -> *mut c_void {
    let ctx = match (ctx as *const PluginContext).as_ref() {
        Some(ctx) => ctx,
        None => return SBRK_FAILED as *mut c_void,
    };
    match ctx.adjust_break(incr) {
        Ok(brk) => brk as *mut c_void,
        Err(e) => {
            log::warn!("{}: {}", ctx.image().name(), e);
            SBRK_FAILED as *mut c_void
        }
    }
}

/// `print` as seen by images.
///
/// # Safety
///
/// `ctx` must be null or the context pointer the host passed to the image;
/// `message` must be null or a NUL-terminated string.
pub unsafe extern "C" fn native_print(ctx: *mut c_void, message: *const c_char) {
    let ctx = match (ctx as *const PluginContext).as_ref() {
        Some(ctx) => ctx,
        None => return,
    };
    if message.is_null() {
        return;
    }
    let message = CStr::from_ptr(message).to_string_lossy();
    ctx.print(&message);
}

type LoadFn = unsafe extern "C" fn(ctx: *mut c_void, ops: *const NativeOps);
type ContextFn = unsafe extern "C" fn(ctx: *mut c_void);

/// Entry points backed by code inside a loaded image.
pub struct NativeEntry {
    load: Option<LoadFn>,
    unload: Option<ContextFn>,
    tick: Option<ContextFn>,
}

impl NativeEntry {
    fn context_ptr(ctx: &PluginContext) -> *mut c_void {
        ctx as *const PluginContext as *mut c_void
    }
}

impl PluginEntry for NativeEntry {
    fn load(&mut self, ctx: &PluginContext) {
        if let Some(load) = self.load {
            // SAFETY: the address came from the validated, relocated
            // descriptor and its segment is mapped executable.
            unsafe { load(Self::context_ptr(ctx), &NATIVE_OPS) };
        }
    }

    fn unload(&mut self, ctx: &PluginContext) {
        if let Some(unload) = self.unload {
            // SAFETY: as for `load`.
            unsafe { unload(Self::context_ptr(ctx)) };
        }
    }

    fn tick(&mut self, ctx: &PluginContext) {
        if let Some(tick) = self.tick {
            // SAFETY: as for `load`.
            unsafe { tick(Self::context_ptr(ctx)) };
        }
    }
}

/// Binder that calls straight into image code.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBinder;

impl NativeBinder {
    /// Whether images can execute on this host.
    pub fn supported() -> bool {
        Architecture::current() == Architecture::Arm
    }
}

impl EntryBinder for NativeBinder {
    fn bind(&self, image: &LoadedImage) -> Result<Box<dyn PluginEntry>, LoadError> {
        if !Self::supported() {
            return Err(LoadError::ArchitectureMismatch);
        }

        let desc = image.descriptor();
        // SAFETY: on 32-bit ARM a relocated u32 address is a full code
        // pointer, and the descriptor was validated by the loader.
        let entry = unsafe {
            NativeEntry {
                load: entry_fn::<LoadFn>(desc.load),
                unload: entry_fn::<ContextFn>(desc.unload),
                tick: entry_fn::<ContextFn>(desc.tick),
            }
        };
        Ok(Box::new(entry))
    }
}

/// Turns a relocated entry address into a function pointer; 0 is absent.
///
/// # Safety
///
/// `F` must be a function pointer type and `addr` must point at code with
/// that signature.
unsafe fn entry_fn<F: Copy>(addr: u32) -> Option<F> {
    if addr == 0 {
        return None;
    }
    let addr = addr as usize;
    Some(core::mem::transmute_copy::<usize, F>(&addr))
}
