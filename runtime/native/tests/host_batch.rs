//! Whole-batch loading through `PluginHost`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use plghost_native::builder::ImageBuilder;
use plghost_native::reloc::RelocEntry;
use plghost_native::{
    EntryBinder, GlobalPages, LifecycleState, LoadError, LoadedImage, LoaderConfig, LogConsole,
    PageAllocator, PluginContext, PluginEntry, PluginHost, SegmentKind, UnsupportedProtector,
};

/// Page allocator that counts live buffers.
#[derive(Default)]
struct CountingPages {
    live: AtomicUsize,
    bytes: AtomicUsize,
}

impl PageAllocator for CountingPages {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = GlobalPages.allocate(size)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(size, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.bytes.fetch_sub(size, Ordering::SeqCst);
        GlobalPages.release(ptr, size);
    }
}

type Journal = Arc<Mutex<Vec<String>>>;

struct Scripted {
    journal: Journal,
}

impl PluginEntry for Scripted {
    fn load(&mut self, ctx: &PluginContext) {
        self.journal.lock().unwrap().push(format!("load {}", ctx.image().name()));
        ctx.print("hello from load\n");
    }

    fn unload(&mut self, ctx: &PluginContext) {
        self.journal.lock().unwrap().push(format!("unload {}", ctx.image().name()));
    }

    fn tick(&mut self, ctx: &PluginContext) {
        self.journal.lock().unwrap().push(format!("tick {}", ctx.image().name()));
    }
}

struct ScriptedBinder {
    journal: Journal,
}

impl EntryBinder for ScriptedBinder {
    fn bind(&self, _image: &LoadedImage) -> Result<Box<dyn PluginEntry>, LoadError> {
        Ok(Box::new(Scripted { journal: Arc::clone(&self.journal) }))
    }
}

fn host(pages: &Arc<CountingPages>, journal: &Journal) -> PluginHost {
    PluginHost::with_pages(
        LoaderConfig::default(),
        pages.clone(),
        Box::new(ScriptedBinder { journal: Arc::clone(journal) }),
        Arc::new(LogConsole),
    )
}

fn read_word(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[test]
fn test_failed_image_releases_everything() {
    let pages = Arc::new(CountingPages::default());
    let journal = Journal::default();
    let mut host = host(&pages, &journal);

    let good = ImageBuilder::plugin("b").code(&[0u8; 16]).data(&[7u8; 16]).build();
    // Truncated inside the data payload: all three segments are allocated
    // before the read fails.
    let bad_full = ImageBuilder::plugin("a").code(&[0u8; 16]).data(&[7u8; 64]).build();
    let bad = &bad_full[..bad_full.len() - 8];

    let loaded = host.load_batch([("a.3dsx", bad), ("b.3dsx", good.as_slice())]);
    assert_eq!(loaded, 1);

    let images = host.active_images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "b");
    assert_eq!(pages.live.load(Ordering::SeqCst), 3);
    assert_eq!(pages.bytes.load(Ordering::SeqCst), images[0].memory_used);

    host.shutdown();
    assert_eq!(pages.live.load(Ordering::SeqCst), 0);
    assert_eq!(pages.bytes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failed_validation_releases_everything() {
    let pages = Arc::new(CountingPages::default());
    let journal = Journal::default();
    let mut host = host(&pages, &journal);

    let a = ImageBuilder::plugin("a").code(&[0u8; 16]).data(&[1u8; 16]).version(9).build();
    let b = ImageBuilder::plugin("b").code(&[0u8; 16]).data(&[2u8; 16]).build();

    let loaded = host.load_batch([("a.3dsx", a.as_slice()), ("b.3dsx", b.as_slice())]);
    assert_eq!(loaded, 1);

    let images = host.active_images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "b");
    // code, rodata and data of b only
    assert_eq!(pages.live.load(Ordering::SeqCst), 3);
    assert_eq!(pages.bytes.load(Ordering::SeqCst), images[0].memory_used);
}

#[test]
fn test_corrupt_magic_leaves_registry_unchanged() {
    let pages = Arc::new(CountingPages::default());
    let journal = Journal::default();
    let mut host = host(&pages, &journal);

    let first = ImageBuilder::plugin("first").build();
    host.load_image("first.3dsx", first.as_slice()).unwrap();
    let before = host.active_images();

    let mut corrupt = ImageBuilder::plugin("second").build();
    corrupt[..4].copy_from_slice(b"3DSY");
    assert!(matches!(
        host.load_image("second.3dsx", corrupt.as_slice()),
        Err(LoadError::Format(_))
    ));
    assert_eq!(host.active_images(), before);
    assert_eq!(pages.live.load(Ordering::SeqCst), 2);
}

#[test]
fn test_absolute_relocation_end_to_end() {
    let pages = Arc::new(CountingPages::default());
    let journal = Journal::default();
    let mut host = host(&pages, &journal);

    // Code word 0 links to data offset 4; data word 0 links to code offset 8.
    let mut code = vec![0u8; 16];
    let builder = ImageBuilder::plugin("reloc").code(&code);
    code[..4].copy_from_slice(&(builder.data_offset() + 4).to_le_bytes());
    let mut data = vec![0u8; 8];
    data[..4].copy_from_slice(&8u32.to_le_bytes());

    let image = builder
        .code(&code)
        .data(&data)
        .absolute(SegmentKind::Code, &[RelocEntry { skip: 0, patch: 1 }])
        .absolute(SegmentKind::Data, &[RelocEntry { skip: 0, patch: 1 }])
        .build();
    let handle = host.load_image("reloc.3dsx", image.as_slice()).unwrap();

    let loaded = host.registry().get(handle).unwrap().image();
    let code_seg = loaded.segment(SegmentKind::Code).unwrap();
    let data_seg = loaded.segment(SegmentKind::Data).unwrap();
    assert_eq!(read_word(code_seg.as_slice(), 0), data_seg.image_addr() + 4);
    assert_eq!(read_word(data_seg.as_slice(), 0), code_seg.image_addr() + 8);
    // Unpatched words are untouched.
    assert_eq!(read_word(code_seg.as_slice(), 4), 0);
    assert_eq!(read_word(data_seg.as_slice(), 4), 0);
}

#[test]
fn test_image_without_relocations_is_copied_verbatim() {
    let pages = Arc::new(CountingPages::default());
    let journal = Journal::default();
    let mut host = host(&pages, &journal);

    let code: Vec<u8> = (0u8..32).collect();
    let image = ImageBuilder::plugin("plain").code(&code).data(&[0xAA; 8]).bss(8).build();
    let handle = host.load_image("plain.3dsx", image.as_slice()).unwrap();

    let loaded = host.registry().get(handle).unwrap().image();
    assert_eq!(&loaded.segment(SegmentKind::Code).unwrap().as_slice()[..32], code.as_slice());
    let data = loaded.segment(SegmentKind::Data).unwrap().as_slice();
    assert_eq!(&data[..8], &[0xAA; 8]);
    assert_eq!(&data[8..16], &[0u8; 8]);
}

#[test]
fn test_lifecycle_across_batch() {
    let pages = Arc::new(CountingPages::default());
    let journal = Journal::default();
    let mut host = host(&pages, &journal);

    let a = ImageBuilder::plugin("a").build();
    let b = ImageBuilder::plugin("b").build();
    assert_eq!(host.load_batch([("a.3dsx", a.as_slice()), ("b.3dsx", b.as_slice())]), 2);

    assert!(host.start().is_err());
    host.finalize_permissions(&mut UnsupportedProtector);
    assert_eq!(host.start(), Ok(2));
    host.tick();

    let states: Vec<_> = host.active_images().into_iter().map(|i| i.state).collect();
    assert_eq!(states, [LifecycleState::Ticking, LifecycleState::Ticking]);

    host.shutdown();
    assert_eq!(
        *journal.lock().unwrap(),
        ["load b", "load a", "tick b", "tick a", "unload b", "unload a"]
    );
    assert_eq!(pages.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_minimal_image_single_absolute_word() {
    let pages = Arc::new(CountingPages::default());
    let journal = Journal::default();
    let mut host = host(&pages, &journal);

    // Offset 0, subtype 0: the word becomes the live code base.
    let image = ImageBuilder::plugin("min")
        .code(&[0u8; 16])
        .absolute(SegmentKind::Code, &[RelocEntry { skip: 0, patch: 1 }])
        .build();
    let handle = host.load_image("min.3dsx", image.as_slice()).unwrap();

    let code = host.registry().get(handle).unwrap().image().segment(SegmentKind::Code).unwrap();
    assert_eq!(read_word(code.as_slice(), 0), code.image_addr());
}
