//! # Plugin Registry
//!
//! Owns every successfully loaded image. Images are kept in an arena keyed
//! by [`ImageHandle`]; handles are issued in increasing order, so walking
//! the arena backwards yields the newest image first.

use alloc::collections::BTreeMap;

use crate::lifecycle::RegisteredPlugin;
use crate::segment::MemoryProtector;

/// Stable handle to a registered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageHandle(u64);

impl ImageHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Outcome of a permission finalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtectionSummary {
    /// Segments whose protection was changed.
    pub applied: usize,
    /// Segments left with their allocation-time permissions.
    pub failed: usize,
}

/// Collection of loaded images, newest first.
#[derive(Debug)]
pub struct Registry {
    plugins: BTreeMap<ImageHandle, RegisteredPlugin>,
    next_handle: u64,
    /// Whether every registered image has been through finalization.
    finalized: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            plugins: BTreeMap::new(),
            next_handle: 1,
            finalized: true,
        }
    }

    /// Registers an image ahead of every image already present.
    pub fn insert(&mut self, plugin: RegisteredPlugin) -> ImageHandle {
        let handle = ImageHandle(self.next_handle);
        self.next_handle += 1;

        log::info!(
            "registered '{}' from {} as #{}",
            plugin.image().name(),
            plugin.image().file(),
            handle.0
        );
        self.plugins.insert(handle, plugin);
        self.finalized = false;
        handle
    }

    pub fn get(&self, handle: ImageHandle) -> Option<&RegisteredPlugin> {
        self.plugins.get(&handle)
    }

    /// Unloads (if needed) and removes one image, releasing its segments.
    pub fn remove(&mut self, handle: ImageHandle) -> bool {
        match self.plugins.remove(&handle) {
            Some(mut plugin) => {
                plugin.stop();
                true
            }
            None => false,
        }
    }

    /// Drops every image. Images are not unloaded first; see
    /// [`crate::lifecycle::Dispatcher::unload_all`].
    pub fn clear(&mut self) {
        self.plugins.clear();
        self.finalized = true;
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Handles in registry order.
    pub fn handles(&self) -> impl Iterator<Item = ImageHandle> + '_ {
        self.plugins.keys().rev().copied()
    }

    /// Images in registry order.
    pub fn iter(&self) -> impl Iterator<Item = (ImageHandle, &RegisteredPlugin)> {
        self.plugins.iter().rev().map(|(h, p)| (*h, p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegisteredPlugin> {
        self.plugins.values_mut().rev()
    }

    /// Applies target permissions to every segment of every image in one
    /// pass.
    ///
    /// Segments already protected by an earlier pass are left alone, so a
    /// later batch can be finalized while earlier images are running. The
    /// pass only reads the images; nothing a running image may be using is
    /// borrowed mutably.
    ///
    /// A segment whose protection cannot be changed is logged and keeps its
    /// allocation-time permissions; the pass carries on with the rest.
    pub fn finalize_permissions(&mut self, protector: &mut dyn MemoryProtector) -> ProtectionSummary {
        let mut summary = ProtectionSummary::default();
        let pending = self
            .plugins
            .values()
            .rev()
            .flat_map(|p| p.image().segments().iter())
            .filter(|segment| segment.protection().is_none());

        if let Err(e) = protector.begin() {
            log::error!("cannot change segment protections: {}", e);
            summary.failed = pending.count();
            self.finalized = true;
            return summary;
        }

        for segment in pending {
            let perm = segment.target_permissions();
            log::debug!(
                "changing permissions addr={:#x}, size={:#x} to {:?}",
                segment.addr(),
                segment.len(),
                perm
            );
            match protector.protect(segment.addr(), segment.len(), perm) {
                Ok(()) => {
                    segment.set_protection(perm);
                    summary.applied += 1;
                }
                Err(e) => {
                    log::error!(
                        "protecting {:?} segment at {:#x} failed: {}",
                        segment.kind(),
                        segment.addr(),
                        e
                    );
                    summary.failed += 1;
                }
            }
        }

        protector.end();
        self.finalized = true;
        summary
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use crate::builder::ImageBuilder;
    use crate::lifecycle::{Dispatcher, LifecycleState, LogConsole, PluginContext, PluginEntry};
    use crate::loader::ImageLoader;
    use crate::segment::{GlobalPages, MemPerm, ProtectError, SegmentKind, UnsupportedProtector};
    use crate::LoaderConfig;

    struct Inert;

    impl PluginEntry for Inert {
        fn load(&mut self, _ctx: &PluginContext) {}
        fn unload(&mut self, _ctx: &PluginContext) {}
        fn tick(&mut self, _ctx: &PluginContext) {}
    }

    fn plugin(name: &str) -> RegisteredPlugin {
        let image = ImageBuilder::plugin(name).code(&[0u8; 8]).data(&[1u8; 8]).build();
        let loaded = ImageLoader::new(LoaderConfig::default(), Arc::new(GlobalPages))
            .load(name, image.as_slice())
            .unwrap();
        RegisteredPlugin::new(PluginContext::new(loaded, Arc::new(LogConsole)), Box::new(Inert))
    }

    /// Records every request and fails those aimed at one address.
    #[derive(Default)]
    struct RecordingProtector {
        calls: Vec<(usize, usize, MemPerm)>,
        fail_at: Option<usize>,
        refuse: bool,
    }

    impl MemoryProtector for RecordingProtector {
        fn begin(&mut self) -> Result<(), ProtectError> {
            if self.refuse {
                Err(ProtectError::Unsupported)
            } else {
                Ok(())
            }
        }

        fn protect(&mut self, addr: usize, size: usize, perm: MemPerm) -> Result<(), ProtectError> {
            self.calls.push((addr, size, perm));
            if self.fail_at == Some(addr) {
                return Err(ProtectError::Rejected(-1));
            }
            Ok(())
        }
    }

    #[test]
    fn test_newest_first_order() {
        let mut registry = Registry::new();
        let a = registry.insert(plugin("a"));
        let b = registry.insert(plugin("b"));

        let names: Vec<_> = registry.iter().map(|(_, p)| p.image().name()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(registry.handles().collect::<Vec<_>>(), [b, a]);
    }

    #[test]
    fn test_duplicate_names_allowed() {
        let mut registry = Registry::new();
        registry.insert(plugin("same"));
        registry.insert(plugin("same"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_finalize_applies_target_permissions() {
        let mut registry = Registry::new();
        let handle = registry.insert(plugin("perm"));
        assert!(!registry.is_finalized());

        let mut protector = RecordingProtector::default();
        let summary = registry.finalize_permissions(&mut protector);

        // code, rodata, data
        assert_eq!(summary, ProtectionSummary { applied: 3, failed: 0 });
        assert!(registry.is_finalized());

        let image = registry.get(handle).unwrap().image();
        for kind in SegmentKind::ALL {
            let seg = image.segment(kind).unwrap();
            assert_eq!(seg.protection(), Some(kind.target_permissions()));
        }
        assert_eq!(protector.calls[0].2, MemPerm::READ | MemPerm::EXECUTE);
    }

    #[test]
    fn test_finalize_continues_after_failure() {
        let mut registry = Registry::new();
        let first = registry.insert(plugin("first"));
        registry.insert(plugin("second"));

        let rodata_addr = registry
            .get(first)
            .unwrap()
            .image()
            .segment(SegmentKind::ReadOnlyData)
            .unwrap()
            .addr();
        let mut protector = RecordingProtector {
            fail_at: Some(rodata_addr),
            ..Default::default()
        };

        let summary = registry.finalize_permissions(&mut protector);
        assert_eq!(summary, ProtectionSummary { applied: 5, failed: 1 });
        assert_eq!(protector.calls.len(), 6);

        let image = registry.get(first).unwrap().image();
        assert_eq!(image.segment(SegmentKind::ReadOnlyData).unwrap().protection(), None);
        assert!(image.segment(SegmentKind::Data).unwrap().protection().is_some());
    }

    #[test]
    fn test_finalize_without_protector_access() {
        let mut registry = Registry::new();
        registry.insert(plugin("x"));
        let mut protector = RecordingProtector { refuse: true, ..Default::default() };

        let summary = registry.finalize_permissions(&mut protector);
        assert_eq!(summary, ProtectionSummary { applied: 0, failed: 3 });
        assert!(protector.calls.is_empty());
        assert!(registry.is_finalized());
    }

    #[test]
    fn test_second_batch_touches_only_new_segments() {
        let mut registry = Registry::new();
        let first = registry.insert(plugin("first"));
        registry.finalize_permissions(&mut RecordingProtector::default());
        assert_eq!(Dispatcher::load_all(&mut registry), Ok(1));

        let second = registry.insert(plugin("second"));
        let mut protector = RecordingProtector::default();
        let summary = registry.finalize_permissions(&mut protector);

        assert_eq!(summary, ProtectionSummary { applied: 3, failed: 0 });
        let second_addrs: Vec<_> = registry
            .get(second)
            .unwrap()
            .image()
            .segments()
            .iter()
            .map(|s| s.addr())
            .collect();
        let touched: Vec<_> = protector.calls.iter().map(|c| c.0).collect();
        assert_eq!(touched, second_addrs);
        assert_eq!(registry.get(first).unwrap().state(), LifecycleState::Loaded);
    }

    #[test]
    fn test_unsupported_protector_leaves_segments_unprotected() {
        let mut registry = Registry::new();
        let handle = registry.insert(plugin("bare"));

        let summary = registry.finalize_permissions(&mut UnsupportedProtector);
        assert_eq!(summary, ProtectionSummary { applied: 0, failed: 3 });
        let image = registry.get(handle).unwrap().image();
        assert!(image.segments().iter().all(|s| s.protection().is_none()));
        assert!(registry.is_finalized());
    }

    #[test]
    fn test_remove() {
        let mut registry = Registry::new();
        let handle = registry.insert(plugin("gone"));
        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));
        assert!(registry.is_empty());
    }
}
