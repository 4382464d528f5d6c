//! # plghost-native: Relocating Plugin Loader
//!
//! Loads position-independent 3DSX plugin images into memory, relocates
//! them against the segment buffers actually allocated, applies per-segment
//! memory protection across the whole batch in one pass, and drives the
//! plugin lifecycle (load, tick, unload) for every image.
//!
//! ## Pipeline
//!
//! ```text
//!  source ─▶ ImageLoader ─▶ EntryBinder ─▶ Registry ─▶ finalize ─▶ Dispatcher
//!            (segments,      (load/unload/   (newest    (protect    (load once,
//!             relocation,     tick)           first)     all)        tick/frame)
//!             descriptor)
//! ```
//!
//! ## Failure Containment
//!
//! A stream, format, or allocation failure while loading an image discards
//! that image and frees its segments. Images already registered are never
//! affected, and a batch carries on with the next candidate. Protection
//! failures are logged per segment and never abort the pass.
//!
//! ## Address Model
//!
//! Images are 32-bit. Relocated words hold the low 32 bits of host
//! addresses, which is exact on the 32-bit hosts that can execute them.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod abi;
pub mod builder;
pub mod format;
pub mod heap;
pub mod lifecycle;
pub mod loader;
pub mod reader;
pub mod registry;
pub mod reloc;
pub mod segment;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub use abi::NativeBinder;
pub use format::{ExecutableHeader, FormatError, PluginDescriptor, PLUGIN_MAGIC, PLUGIN_VERSION};
pub use heap::{HeapError, ProgramBreak};
pub use lifecycle::{
    Console, Dispatcher, EntryBinder, LifecycleError, LifecycleState, LogConsole, PluginContext,
    PluginEntry, RegisteredPlugin,
};
pub use loader::{ImageLoader, LoadError, LoadedImage};
pub use reader::{ImageReader, ImageSource, StreamError};
pub use registry::{ImageHandle, ProtectionSummary, Registry};
pub use segment::{
    GlobalPages, MemPerm, MemoryProtector, PageAllocator, ProtectError, Segment, SegmentKind,
    UnsupportedProtector,
};

/// Host architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// 32-bit ARM; the architecture images are built for.
    Arm,
    X86_64,
    Aarch64,
    Other,
}

impl Architecture {
    /// Gets the current architecture.
    pub fn current() -> Self {
        #[cfg(target_arch = "arm")]
        return Self::Arm;
        #[cfg(target_arch = "x86_64")]
        return Self::X86_64;
        #[cfg(target_arch = "aarch64")]
        return Self::Aarch64;
        #[cfg(not(any(target_arch = "arm", target_arch = "x86_64", target_arch = "aarch64")))]
        return Self::Other;
    }
}

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Bytes reserved after the data segment for the image heap.
    pub heap_reserve: usize,
    /// Relocation entries read per batch.
    pub reloc_batch: usize,
    /// Descriptor magic an image must carry.
    pub plugin_magic: u32,
    /// Descriptor version an image must carry.
    pub plugin_version: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            heap_reserve: 0x8000,
            reloc_batch: 512,
            plugin_magic: PLUGIN_MAGIC,
            plugin_version: PLUGIN_VERSION,
        }
    }
}

/// Summary of one registered image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub handle: ImageHandle,
    /// File the image came from.
    pub file: String,
    /// Name from the descriptor.
    pub name: String,
    pub state: LifecycleState,
    /// Bytes held by the image's segments.
    pub memory_used: usize,
}

/// Loader, registry and lifecycle dispatch behind one interface.
pub struct PluginHost {
    loader: ImageLoader,
    binder: Box<dyn EntryBinder>,
    console: Arc<dyn Console>,
    registry: Registry,
}

impl PluginHost {
    /// Creates a host that allocates segments from the global allocator.
    pub fn new(config: LoaderConfig, binder: Box<dyn EntryBinder>, console: Arc<dyn Console>) -> Self {
        Self::with_pages(config, Arc::new(GlobalPages), binder, console)
    }

    /// Creates a host that allocates segments from `pages`.
    pub fn with_pages(
        config: LoaderConfig,
        pages: Arc<dyn PageAllocator>,
        binder: Box<dyn EntryBinder>,
        console: Arc<dyn Console>,
    ) -> Self {
        Self {
            loader: ImageLoader::new(config, pages),
            binder,
            console,
            registry: Registry::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Loads, binds and registers one image.
    pub fn load_image<S: ImageSource>(&mut self, file: &str, source: S) -> Result<ImageHandle, LoadError> {
        let image = self.loader.load(file, source)?;
        let entry = self.binder.bind(&image)?;
        let context = PluginContext::new(image, Arc::clone(&self.console));
        Ok(self.registry.insert(RegisteredPlugin::new(context, entry)))
    }

    /// Loads every candidate, skipping the ones that fail.
    ///
    /// Returns the number of images registered.
    pub fn load_batch<I, N, S>(&mut self, candidates: I) -> usize
    where
        I: IntoIterator<Item = (N, S)>,
        N: AsRef<str>,
        S: ImageSource,
    {
        let mut registered = 0;
        for (file, source) in candidates {
            let file = file.as_ref();
            match self.load_image(file, source) {
                Ok(_) => registered += 1,
                Err(e) => log::warn!("{}: not loaded: {}", file, e),
            }
        }
        registered
    }

    /// Applies final segment protections for every registered image.
    pub fn finalize_permissions(&mut self, protector: &mut dyn MemoryProtector) -> ProtectionSummary {
        self.registry.finalize_permissions(protector)
    }

    /// Runs `load` for every image not yet loaded.
    pub fn start(&mut self) -> Result<usize, LifecycleError> {
        Dispatcher::load_all(&mut self.registry)
    }

    /// Runs one frame of `tick` calls.
    pub fn tick(&mut self) {
        Dispatcher::tick_all(&mut self.registry);
    }

    /// Unloads and releases one image.
    pub fn unload(&mut self, handle: ImageHandle) -> bool {
        self.registry.remove(handle)
    }

    /// Unloads every image and releases all segments.
    pub fn shutdown(&mut self) {
        Dispatcher::unload_all(&mut self.registry);
        self.registry.clear();
    }

    /// Registered images in registry order.
    pub fn active_images(&self) -> Vec<ImageInfo> {
        self.registry
            .iter()
            .map(|(handle, plugin)| ImageInfo {
                handle,
                file: String::from(plugin.image().file()),
                name: String::from(plugin.image().name()),
                state: plugin.state(),
                memory_used: plugin.image().segments().total_size(),
            })
            .collect()
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}
