//! Process-wide `MultiProgress` so nested code can add bars without
//! threading a handle through every call.

use indicatif::{MultiProgress, ProgressBar};
use once_cell::sync::Lazy;
use std::sync::Arc;

static MULTI: Lazy<Arc<MultiProgress>> = Lazy::new(|| Arc::new(MultiProgress::new()));

pub fn global_mp() -> Arc<MultiProgress> {
    MULTI.clone()
}

pub fn add_progress_bar(pb: ProgressBar) {
    global_mp().add(pb);
}

pub fn remove_progress_bar(pb: &ProgressBar) {
    global_mp().remove(pb);
}
