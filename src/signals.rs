//! Installs handlers for the interrupt-style signals so a long search can wind down after
//! its current step instead of leaving a container running, rather than reacting inside
//! the search loop itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

/// Watches SIGINT/SIGTERM/SIGHUP/SIGQUIT in a background thread and flips a shared flag
/// the driver polls between steps.
pub struct SignalHandler {
    cancelled: Arc<AtomicBool>,
}

impl SignalHandler {
    pub fn install() -> Result<Self, anyhow::Error> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGQUIT])?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        std::thread::spawn(move || {
            for signal in signals.forever() {
                tracing::warn!(
                    "caught {}; finishing the current step and stopping",
                    signal_name(signal)
                );
                flag.store(true, Ordering::SeqCst);
            }
        });
        Ok(Self { cancelled })
    }

    /// True once any of the handled signals has been received.
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A clone of the underlying flag, for handing to code that shouldn't otherwise
    /// depend on this type (e.g. the progress-tick closure passed into the search).
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGHUP => "SIGHUP",
        SIGQUIT => "SIGQUIT",
        _ => "signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_name_covers_the_handled_set() {
        assert_eq!(signal_name(SIGINT), "SIGINT");
        assert_eq!(signal_name(SIGTERM), "SIGTERM");
        assert_eq!(signal_name(999), "signal");
    }
}
