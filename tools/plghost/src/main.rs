//! # plghost: Plugin Host
//!
//! Loads every plugin image found in one directory, finalizes segment
//! protections for the whole batch, calls each plugin's `load`, then ticks
//! every plugin once per frame until the frame limit is reached, Ctrl-C
//! is pressed, or `q` is entered. Plugins are unloaded and released before
//! the host exits.
//!
//! ## Usage
//!
//! ```text
//! plghost [-d <plugin-dir>] [-e <extension>] [-i <ms>] [-n <frames>] [-l <level>]
//! ```

mod config;
mod exit;
mod logger;
mod protect;
mod scan;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use plghost_native::{Console, LoaderConfig, NativeBinder, PluginHost};

use crate::config::HostConfig;
use crate::exit::ExitSignal;
use crate::logger::StderrLogger;

/// Console that writes plugin output to stdout unchanged.
struct StdoutConsole;

impl Console for StdoutConsole {
    fn print(&self, _plugin: &str, message: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(message.as_bytes());
        let _ = out.flush();
    }
}

fn main() -> ExitCode {
    let config: HostConfig = argh::from_env();
    if let Err(e) = StderrLogger::install(config.log_level) {
        eprintln!("plghost: cannot install logger: {}", e);
        return ExitCode::FAILURE;
    }

    if !NativeBinder::supported() {
        log::warn!("this host cannot execute 32-bit ARM images; every image will be rejected");
    }

    let loader = LoaderConfig {
        heap_reserve: config.heap_reserve,
        ..LoaderConfig::default()
    };
    let (pages, mut protector) = protect::host_protection();
    let mut host = PluginHost::with_pages(loader, pages, Box::new(NativeBinder), Arc::new(StdoutConsole));

    log::info!("loading plugins from {}", config.plugin_dir.display());
    let candidates = match scan::scan(&config.plugin_dir, config.extension()) {
        Ok(candidates) => candidates,
        Err(e) => {
            log::error!("{}: {}", config.plugin_dir.display(), e);
            Vec::new()
        }
    };
    let loaded = host.load_batch(candidates.into_iter().map(|c| (c.name, c.file)));

    let summary = host.finalize_permissions(protector.as_mut());
    if summary.failed > 0 {
        log::warn!("{} segment(s) kept their initial permissions", summary.failed);
    }

    println!("Loaded {} plugin(s):", loaded);
    for image in host.active_images() {
        println!("\t{} ({})", image.name, image.file);
    }

    if let Err(e) = host.start() {
        log::error!("{}", e);
        return ExitCode::FAILURE;
    }

    let exit = ExitSignal::new();
    exit.install();
    println!("Press Ctrl-C or enter q to exit.");

    let frames = run_frames(&mut host, config.frame_interval(), config.frames, &exit);

    log::info!("shutting down after {} frame(s)", frames);
    host.shutdown();
    ExitCode::SUCCESS
}

/// Ticks every plugin once per frame until `limit` frames have run or an
/// exit is requested. Returns the number of frames run.
fn run_frames(host: &mut PluginHost, interval: Duration, limit: Option<u64>, exit: &ExitSignal) -> u64 {
    let mut frame = 0u64;
    while limit.map_or(true, |limit| frame < limit) && !exit.requested() {
        host.tick();
        frame += 1;
        thread::sleep(interval);
    }
    frame
}
