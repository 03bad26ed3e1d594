//! Progress reporting for boot and readiness waits.

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Shared drawing surface so parallel node boots render one line each.
pub fn run_progress() -> MultiProgress {
    MultiProgress::new()
}

/// Spinner shown while one guest boots and answers its first probe.
pub fn readiness_bar(multi: &MultiProgress, host: &str) -> ProgressBar {
    let bar = multi.add(ProgressBar::new_spinner());
    let style = ProgressStyle::with_template("{spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    bar.set_style(style);
    bar.set_message(format!("waiting for {host}"));
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Mark a bar finished with a short outcome note and remove the spinner.
pub fn finish(bar: &ProgressBar, outcome: impl Into<String>) {
    bar.finish_with_message(outcome.into());
}
