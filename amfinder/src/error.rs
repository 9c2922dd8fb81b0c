//! Error types surfaced by the prediction library.
//!
//! Application plumbing uses `anyhow::Result`; the variants here are the ones
//! the CLI needs to tell apart, mostly to pick a process exit code.

use thiserror::Error;

/// Exit code for models that cannot produce activation maps.
pub const EXIT_INVALID_MODEL: i32 = 4;

/// Exit code for unreadable or inconsistent model files.
pub const EXIT_MODEL_FORMAT: i32 = 3;

#[derive(Debug, Error)]
pub enum AmfError {
    #[error("model '{model}' has no Conv2D layer, cannot compute class activation maps")]
    InvalidModel { model: String },

    #[error("invalid model file: {0}")]
    ModelFormat(String),

    #[error("layer {index} ({kind}): {reason}")]
    LayerShape {
        index: usize,
        kind: &'static str,
        reason: String,
    },

    #[error("model predicts {model} classes but the header lists {header} labels")]
    HeaderMismatch { model: usize, header: usize },

    #[error("tile edge {tile_edge} does not match the model input size {height}x{width}")]
    TileSizeMismatch {
        tile_edge: u32,
        height: usize,
        width: usize,
    },

    #[error("prediction fragment {fragment} has shape {rows}x{cols}, expected {expected_rows}x{expected_cols}")]
    FragmentShape {
        fragment: usize,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
}

impl AmfError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AmfError::InvalidModel { .. } => EXIT_INVALID_MODEL,
            AmfError::ModelFormat(_)
            | AmfError::LayerShape { .. }
            | AmfError::HeaderMismatch { .. }
            | AmfError::TileSizeMismatch { .. } => EXIT_MODEL_FORMAT,
            AmfError::FragmentShape { .. } => 1,
        }
    }

    /// Whether no image in a batch could succeed after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmfError::InvalidModel { .. }
                | AmfError::HeaderMismatch { .. }
                | AmfError::TileSizeMismatch { .. }
        )
    }
}

/// Exit code for an arbitrary application error.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<AmfError>())
        .map(AmfError::exit_code)
        .unwrap_or(1)
}

/// Whether an application error must stop the run even in permissive mode.
pub fn is_fatal_error(err: &anyhow::Error) -> bool {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<AmfError>())
        .is_some_and(AmfError::is_fatal)
}
