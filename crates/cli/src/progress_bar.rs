//! `indicatif`-backed implementation of `dzip_core::io::ProgressObserver`.

use dzip_core::io::ProgressObserver;
use indicatif::{ProgressBar, ProgressStyle};

pub struct IndicatifObserver {
    bar: ProgressBar,
}

impl IndicatifObserver {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { bar }
    }
}

impl Default for IndicatifObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for IndicatifObserver {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
    }

    fn advance(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn info(&self, message: &str) {
        self.bar.suspend(|| log::info!("{message}"));
    }

    fn warn(&self, message: &str) {
        self.bar.suspend(|| log::warn!("{message}"));
    }

    fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}
