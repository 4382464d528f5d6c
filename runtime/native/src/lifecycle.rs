//! # Plugin Lifecycle
//!
//! Every registered image moves through
//!
//! ```text
//! Unloaded ──load──▶ Loaded ──tick──▶ Ticking ──tick──▶ Ticking ...
//!     ▲                 │                 │
//!     └─────unload──────┴─────────────────┘
//! ```
//!
//! `load` runs once per image, and only after the whole batch has had its
//! permissions finalized. `tick` runs once per host frame in registry
//! order. `unload` runs when the host shuts down or removes the image,
//! before its segments are released.
//!
//! Entry points never see a global operation table: each call receives the
//! image's own [`PluginContext`], which carries the host services bound to
//! that image.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;

use crate::heap::HeapError;
use crate::loader::{LoadError, LoadedImage};
use crate::registry::Registry;

// =============================================================================
// Host Services
// =============================================================================

/// Where image `print` output goes.
pub trait Console: Send + Sync {
    /// Writes a message on behalf of the plugin called `plugin`.
    fn print(&self, plugin: &str, message: &str);
}

/// Console that forwards image output to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogConsole;

impl Console for LogConsole {
    fn print(&self, plugin: &str, message: &str) {
        log::info!("[{}] {}", plugin, message.trim_end());
    }
}

/// Per-image context handed to every entry point.
///
/// The context lives at a stable address for as long as the image is
/// registered, so an image may keep a reference to it (for example from a
/// background thread it started in `load`).
pub struct PluginContext {
    image: LoadedImage,
    console: Arc<dyn Console>,
}

impl PluginContext {
    pub fn new(image: LoadedImage, console: Arc<dyn Console>) -> Self {
        Self { image, console }
    }

    pub fn image(&self) -> &LoadedImage {
        &self.image
    }

    /// Host `print` operation.
    pub fn print(&self, message: &str) {
        self.console.print(self.image.name(), message);
    }

    /// Host `adjust_break` operation; returns the new break address.
    pub fn adjust_break(&self, delta: isize) -> Result<usize, HeapError> {
        log::trace!("{}: sbrk (incr={})", self.image.name(), delta);
        self.image.program_break().adjust(delta)
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Entry Points
// =============================================================================

/// The three entry points a plugin exposes.
pub trait PluginEntry: Send {
    /// Called once after permissions are finalized.
    fn load(&mut self, ctx: &PluginContext);

    /// Called before the image's segments are released.
    fn unload(&mut self, ctx: &PluginContext);

    /// Called once per host frame. Must return promptly.
    fn tick(&mut self, ctx: &PluginContext);
}

/// Produces the entry points for a freshly loaded image.
pub trait EntryBinder {
    fn bind(&self, image: &LoadedImage) -> Result<Box<dyn PluginEntry>, LoadError>;
}

// =============================================================================
// Registered Plugin
// =============================================================================

/// Lifecycle state of a registered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Registered, `load` not yet called (or `unload` already called).
    Unloaded,
    /// `load` has run.
    Loaded,
    /// At least one `tick` has run since `load`.
    Ticking,
}

impl LifecycleState {
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Loaded | LifecycleState::Ticking)
    }
}

/// An image owned by the registry together with its entry points.
pub struct RegisteredPlugin {
    context: Box<PluginContext>,
    entry: Box<dyn PluginEntry>,
    state: LifecycleState,
}

impl RegisteredPlugin {
    pub fn new(context: PluginContext, entry: Box<dyn PluginEntry>) -> Self {
        Self {
            context: Box::new(context),
            entry,
            state: LifecycleState::Unloaded,
        }
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub fn image(&self) -> &LoadedImage {
        self.context.image()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn start(&mut self) -> bool {
        if self.state != LifecycleState::Unloaded {
            return false;
        }
        log::info!("loading plugin '{}'", self.context.image().name());
        self.entry.load(&self.context);
        self.state = LifecycleState::Loaded;
        true
    }

    fn tick(&mut self) {
        if self.state.is_active() {
            self.entry.tick(&self.context);
            self.state = LifecycleState::Ticking;
        }
    }

    pub(crate) fn stop(&mut self) {
        if self.state.is_active() {
            log::info!("unloading plugin '{}'", self.context.image().name());
            self.entry.unload(&self.context);
            self.state = LifecycleState::Unloaded;
        }
    }
}

impl fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("file", &self.context.image().file())
            .field("name", &self.context.image().name())
            .field("state", &self.state)
            .finish()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Lifecycle call refused by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    /// Some registered images have not been through permission finalization.
    PermissionsPending,
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::PermissionsPending => {
                write!(f, "permissions have not been finalized for every image")
            }
        }
    }
}

/// Drives lifecycle transitions across a whole registry.
pub struct Dispatcher;

impl Dispatcher {
    /// Calls `load` on every image that has not been loaded yet.
    ///
    /// Returns how many images were loaded.
    pub fn load_all(registry: &mut Registry) -> Result<usize, LifecycleError> {
        if !registry.is_finalized() {
            return Err(LifecycleError::PermissionsPending);
        }

        let mut loaded = 0;
        for plugin in registry.iter_mut() {
            if plugin.start() {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Calls `tick` once on every loaded image, in registry order.
    pub fn tick_all(registry: &mut Registry) {
        for plugin in registry.iter_mut() {
            plugin.tick();
        }
    }

    /// Calls `unload` on every loaded image, in registry order.
    pub fn unload_all(registry: &mut Registry) {
        for plugin in registry.iter_mut() {
            plugin.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::vec::Vec;
    use std::sync::Mutex;

    use crate::builder::ImageBuilder;
    use crate::loader::ImageLoader;
    use crate::segment::{GlobalPages, UnsupportedProtector};
    use crate::LoaderConfig;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recording {
        journal: Journal,
    }

    impl PluginEntry for Recording {
        fn load(&mut self, ctx: &PluginContext) {
            self.journal.lock().unwrap().push(format!("load {}", ctx.image().name()));
        }

        fn unload(&mut self, ctx: &PluginContext) {
            self.journal.lock().unwrap().push(format!("unload {}", ctx.image().name()));
        }

        fn tick(&mut self, ctx: &PluginContext) {
            self.journal.lock().unwrap().push(format!("tick {}", ctx.image().name()));
        }
    }

    fn register(registry: &mut Registry, journal: &Journal, name: &str) {
        let image = ImageBuilder::plugin(name).code(&[0u8; 4]).build();
        let loaded = ImageLoader::new(LoaderConfig::default(), Arc::new(GlobalPages))
            .load(name, image.as_slice())
            .unwrap();
        let entry = Recording { journal: Arc::clone(journal) };
        registry.insert(RegisteredPlugin::new(
            PluginContext::new(loaded, Arc::new(LogConsole)),
            Box::new(entry),
        ));
    }

    fn drain(journal: &Journal) -> Vec<String> {
        core::mem::take(&mut *journal.lock().unwrap())
    }

    #[test]
    fn test_load_waits_for_finalization() {
        let journal = Journal::default();
        let mut registry = Registry::new();
        register(&mut registry, &journal, "early");

        assert_eq!(Dispatcher::load_all(&mut registry), Err(LifecycleError::PermissionsPending));
        assert!(drain(&journal).is_empty());

        registry.finalize_permissions(&mut UnsupportedProtector);
        assert_eq!(Dispatcher::load_all(&mut registry), Ok(1));
        assert_eq!(drain(&journal), ["load early"]);
    }

    #[test]
    fn test_load_runs_once() {
        let journal = Journal::default();
        let mut registry = Registry::new();
        register(&mut registry, &journal, "once");
        registry.finalize_permissions(&mut UnsupportedProtector);

        assert_eq!(Dispatcher::load_all(&mut registry), Ok(1));
        assert_eq!(Dispatcher::load_all(&mut registry), Ok(0));
        assert_eq!(drain(&journal), ["load once"]);
    }

    #[test]
    fn test_tick_in_registry_order() {
        let journal = Journal::default();
        let mut registry = Registry::new();
        register(&mut registry, &journal, "a");
        register(&mut registry, &journal, "b");

        // Not loaded yet: ticks are ignored.
        Dispatcher::tick_all(&mut registry);
        assert!(drain(&journal).is_empty());

        registry.finalize_permissions(&mut UnsupportedProtector);
        Dispatcher::load_all(&mut registry).unwrap();
        Dispatcher::tick_all(&mut registry);
        Dispatcher::tick_all(&mut registry);
        assert_eq!(drain(&journal), ["load b", "load a", "tick b", "tick a", "tick b", "tick a"]);

        let states: Vec<_> = registry.iter().map(|(_, p)| p.state()).collect();
        assert_eq!(states, [LifecycleState::Ticking, LifecycleState::Ticking]);
    }

    #[test]
    fn test_unload_only_active_images() {
        let journal = Journal::default();
        let mut registry = Registry::new();
        register(&mut registry, &journal, "x");

        Dispatcher::unload_all(&mut registry);
        assert!(drain(&journal).is_empty());

        registry.finalize_permissions(&mut UnsupportedProtector);
        Dispatcher::load_all(&mut registry).unwrap();
        Dispatcher::unload_all(&mut registry);
        Dispatcher::unload_all(&mut registry);
        assert_eq!(drain(&journal), ["load x", "unload x"]);
    }

    #[test]
    fn test_context_services() {
        let image = ImageBuilder::plugin("ctx").data(&[0u8; 16]).build();
        let loaded = ImageLoader::new(LoaderConfig::default(), Arc::new(GlobalPages))
            .load("ctx.3dsx", image.as_slice())
            .unwrap();
        let ctx = PluginContext::new(loaded, Arc::new(LogConsole));

        let start = ctx.adjust_break(0).unwrap();
        assert_eq!(ctx.adjust_break(32).unwrap(), start + 32);
        assert_eq!(ctx.adjust_break(-32).unwrap(), start);
        assert!(ctx.adjust_break(-(start as isize) - 1).is_err());
        ctx.print("hello\n");
    }
}
