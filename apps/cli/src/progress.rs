//! Percentage progress on stderr.

use std::io::Write;

use rkflash_core::{FlashEvent, FlashObserver, TracingObserver};

/// Rewrites one stderr line per long operation; everything else goes to
/// the tracing log.
pub struct StderrProgress;

impl FlashObserver for StderrProgress {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::Progress {
                operation,
                position,
                ..
            } => {
                let mut stderr = std::io::stderr().lock();
                let _ = write!(
                    stderr,
                    "\r{} at offset 0x{:08x} ({:>3}%)",
                    operation,
                    position,
                    event.percent().unwrap_or(0)
                );
                let _ = stderr.flush();
            }
            FlashEvent::Complete { .. } => {
                eprintln!("... Done!");
            }
            FlashEvent::Truncated { .. } => {
                eprintln!();
                TracingObserver.on_event(event);
            }
            _ => TracingObserver.on_event(event),
        }
    }
}
