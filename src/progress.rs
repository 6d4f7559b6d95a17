//! A thin progress surface over `indicatif`, so the search driver can show which step and
//! candidate package it's currently on without the search logic itself knowing about
//! rendering.

use indicatif::{ProgressBar, ProgressStyle};

/// Tracks the current step depth and candidate package, refreshed on each poll tick of a
/// running [`Execution`](crate::containers::Execution) and on each new candidate tried.
pub struct SearchProgress {
    bar: ProgressBar,
    quiet: bool,
}

impl SearchProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(std::time::Duration::from_millis(120));
            bar
        };
        Self { bar, quiet }
    }

    pub fn set_command(&self, level: u32, argv: &[String]) {
        self.bar
            .set_message(format!("[{level}] running `{}`", argv.join(" ")));
    }

    pub fn set_candidate(&self, level: u32, package: &str) {
        self.bar
            .set_message(format!("[{level}] trying `{package}`"));
    }

    pub fn tick(&self) {
        if !self.quiet {
            self.bar.tick();
        }
    }

    pub fn finish(&self, message: impl Into<String>) {
        if self.quiet {
            return;
        }
        self.bar.finish_with_message(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_progress_does_not_panic_on_use() {
        let progress = SearchProgress::new(true);
        progress.set_command(0, &["ls".to_string()]);
        progress.set_candidate(1, "coreutils");
        progress.tick();
        progress.finish("done");
    }
}
