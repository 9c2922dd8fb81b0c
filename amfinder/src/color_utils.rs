//! Conditional colouring of terminal output.
//!
//! Colours and emoji symbols are turned off by any of:
//! - the `--no-color` flag
//! - `NO_COLOR` (https://no-color.org/) or `AMFINDER_NO_COLOR`
//! - `TERM=dumb`
//! - stderr not being a terminal

use colored::ColoredString;
use std::io::{stderr, IsTerminal};
use std::sync::OnceLock;

static COLOR_CONFIG: OnceLock<ColorConfig> = OnceLock::new();

fn should_disable_colors_from_env() -> bool {
    !std::env::var("NO_COLOR").unwrap_or_default().is_empty()
        || !std::env::var("AMFINDER_NO_COLOR")
            .unwrap_or_default()
            .is_empty()
        || std::env::var("TERM").unwrap_or_default() == "dumb"
        || !stderr().is_terminal()
}

#[derive(Debug, Clone)]
struct ColorConfig {
    colors_enabled: bool,
}

impl ColorConfig {
    fn new(no_color_flag: bool) -> Self {
        Self {
            colors_enabled: !no_color_flag && !should_disable_colors_from_env(),
        }
    }
}

/// Record the `--no-color` flag. Call once, right after argument parsing.
pub fn init_color_config(no_color_flag: bool) {
    if COLOR_CONFIG.set(ColorConfig::new(no_color_flag)).is_err() {
        eprintln!("Warning: Color configuration already initialized");
    }
}

fn colors_enabled() -> bool {
    COLOR_CONFIG
        .get()
        .map(|config| config.colors_enabled)
        .unwrap_or_else(|| !should_disable_colors_from_env())
}

/// Apply `color_fn` only when colours are enabled.
pub fn maybe_color_stderr<F>(text: &str, color_fn: F) -> String
where
    F: FnOnce(&str) -> ColoredString,
{
    if colors_enabled() {
        color_fn(text).to_string()
    } else {
        text.to_string()
    }
}

/// Log level tags.
pub mod colors {
    use super::maybe_color_stderr;
    use colored::Colorize;

    pub fn error_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.red().bold())
    }

    pub fn warning_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.yellow())
    }

    pub fn info_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.green())
    }

    pub fn debug_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.blue())
    }

    pub fn trace_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.magenta())
    }
}

/// Message prefixes; plain-text fallbacks when colours are off.
pub mod symbols {
    use super::colors_enabled;

    fn pick(emoji: &'static str, plain: &'static str) -> &'static str {
        if colors_enabled() {
            emoji
        } else {
            plain
        }
    }

    pub fn model_loaded() -> &'static str {
        pick("✅", "  ")
    }

    /// Start of tiled prediction for one image.
    pub fn prediction_start() -> &'static str {
        pick("🔬", "")
    }

    pub fn archive_saved() -> &'static str {
        pick("📦", "[SAVED]")
    }

    pub fn operation_failed() -> &'static str {
        pick("❌", "[FAILED]")
    }

    pub fn completed_successfully() -> &'static str {
        pick("✅", "[SUCCESS]")
    }

    /// Some images failed or were skipped.
    pub fn completed_partially_successfully() -> &'static str {
        pick("⚠️ ", "[PARTIAL-SUCCESS]")
    }

    pub fn warning() -> &'static str {
        pick("⚠️ ", "")
    }
}

/// Progress bars that respect the terminal state.
pub mod progress {
    use crate::progress::add_progress_bar;

    use super::colors_enabled;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::io::{stderr, IsTerminal};

    /// Row progress for one image; `None` unless stderr is interactive.
    pub fn create_row_progress_bar(name: &str, nrows: u32) -> Option<ProgressBar> {
        if nrows == 0 || !stderr().is_terminal() {
            return None;
        }
        let pb = ProgressBar::new(nrows as u64);
        add_progress_bar(pb.clone());
        let style = if colors_enabled() {
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:30.green/black}] row {pos}/{len} {msg}")
                .map(|s| s.progress_chars("█▓▒░"))
        } else {
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:30}] row {pos}/{len} {msg}")
                .map(|s| s.progress_chars("#> "))
        };
        pb.set_style(style.unwrap_or_else(|_| ProgressStyle::default_bar()));
        pb.set_message(name.to_string());
        Some(pb)
    }
}
