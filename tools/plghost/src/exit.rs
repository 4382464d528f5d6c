//! Exit requests for the frame loop.
//!
//! The loop stops on Ctrl-C or when `q` (or `quit`) is entered on stdin.
//! End of input is not an exit request, so the host keeps running with
//! stdin closed.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Shared flag polled once per frame.
#[derive(Debug, Clone, Default)]
pub struct ExitSignal {
    requested: Arc<AtomicBool>,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Hooks Ctrl-C and stdin up to this signal.
    ///
    /// Failing to hook either source is logged; the other still works.
    pub fn install(&self) {
        let on_interrupt = self.clone();
        if let Err(e) = ctrlc::set_handler(move || on_interrupt.request()) {
            log::warn!("cannot handle Ctrl-C: {}", e);
        }

        let on_input = self.clone();
        let spawned = thread::Builder::new()
            .name("stdin-exit".into())
            .spawn(move || watch_input(std::io::stdin().lock(), &on_input));
        if let Err(e) = spawned {
            log::warn!("cannot watch stdin: {}", e);
        }
    }
}

/// Whether an input line asks the host to stop.
pub fn is_quit_command(line: &str) -> bool {
    let line = line.trim();
    line.eq_ignore_ascii_case("q") || line.eq_ignore_ascii_case("quit")
}

/// Reads lines until one is a quit command or input ends.
fn watch_input<R: BufRead>(input: R, signal: &ExitSignal) {
    for line in input.lines() {
        match line {
            Ok(line) if is_quit_command(&line) => {
                log::info!("exit requested");
                signal.request();
                return;
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
}
