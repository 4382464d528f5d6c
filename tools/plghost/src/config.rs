//! Command-line configuration.

use std::path::PathBuf;
use std::time::Duration;

use argh::FromArgs;
use log::LevelFilter;

/// Default directory scanned for plugin images.
pub const DEFAULT_PLUGIN_DIR: &str = "/plghost/plugins";

/// Load every plugin image in a directory and tick it once per frame.
#[derive(FromArgs, Debug)]
pub struct HostConfig {
    /// directory to scan for plugin images
    #[argh(option, short = 'd', default = "PathBuf::from(DEFAULT_PLUGIN_DIR)")]
    pub plugin_dir: PathBuf,

    /// file extension of plugin images, matched case-insensitively
    #[argh(option, short = 'e', default = "String::from(\"3dsx\")")]
    pub extension: String,

    /// milliseconds between frames
    #[argh(option, short = 'i', default = "1000")]
    pub frame_interval: u64,

    /// stop after this many frames (runs until killed otherwise)
    #[argh(option, short = 'n')]
    pub frames: Option<u64>,

    /// log level: off, error, warn, info, debug or trace
    #[argh(option, short = 'l', default = "LevelFilter::Info")]
    pub log_level: LevelFilter,

    /// reserved heap bytes per image
    #[argh(option, default = "0x8000")]
    pub heap_reserve: usize,
}

impl HostConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval)
    }

    /// Extension without a leading dot.
    pub fn extension(&self) -> &str {
        self.extension.trim_start_matches('.')
    }
}
