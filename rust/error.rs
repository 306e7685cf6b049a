use thiserror::Error;

/// Errors raised by the stain analysis pipeline.
///
/// Input validation problems surface here. Numerical degeneracy (singular
/// stain matrices, zero-norm vectors) is handled by substitution instead and
/// never produces an error.
#[derive(Debug, Error)]
pub enum StainError {
    #[error("level {level} out of range (image has {available} levels)")]
    InvalidLevel { level: usize, available: usize },

    #[error("focus plane {plane} out of range (image has {available} focus planes)")]
    InvalidFocusPlane { plane: usize, available: usize },

    #[error("band {band} out of range (image has {available} bands)")]
    InvalidBand { band: usize, available: usize },

    #[error("tile {index} out of range on level {level} ({available} tiles)")]
    InvalidTileIndex {
        level: usize,
        index: usize,
        available: usize,
    },

    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("insufficient samples: need more than {required}, got {actual}")]
    InsufficientSamples { required: usize, actual: usize },

    #[error("basis is empty or all zero")]
    DegenerateBasis,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, StainError>;
