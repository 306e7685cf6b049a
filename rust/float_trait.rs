use num_traits::Float;

/// Supertrait combining the bounds needed by the array-level conversion and
/// deconvolution routines.
///
/// Implemented for `f32` and `f64`. The per-pixel core (sampler, basis
/// transform, histograms, estimators) always works in `f64`; this trait only
/// lets whole-image buffers stay in single precision when memory matters.
pub trait StainFloat: Float + Send + Sync + std::fmt::Debug + 'static {
    fn cast(value: f64) -> Self;
    fn as_f64(self) -> f64;
}

impl StainFloat for f32 {
    #[inline]
    fn cast(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl StainFloat for f64 {
    #[inline]
    fn cast(value: f64) -> Self {
        value
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}
