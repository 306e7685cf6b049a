//! Stain vector estimation: shared configuration and algorithm dispatch.
//!
//! Every algorithm turns a tiled image into a [`StainMatrix`]. The algorithm
//! and its parameters are picked by the [`EstimatorConfig`] variant; the
//! [`Estimator`] owns the random generator that sampling draws from.

use crate::error::{Result, StainError};
use crate::ica::{self, IcaConfig};
use crate::macenko::{self, MacenkoConfig};
use crate::niethammer::{self, NiethammerConfig};
use crate::nmf::{self, NmfConfig};
use crate::pixel_roi::{self, PixelRoiConfig};
use crate::sampler::{RandomPixelSampler, SampleRequest};
use crate::stain_math::{
    complement_stain_matrix, normalize_vector, stain_matrix_from_vectors, StainMatrix,
    StainVector,
};
use crate::svd::{self, SvdConfig};
use crate::tiled_image::TiledImageSource;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Ordering applied to estimated stain vectors, keyed on the red OD
/// component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StainSortOrder {
    #[default]
    Unsorted,
    RedAscending,
    RedDescending,
}

/// Where and how many pixels to sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub sample_size: usize,
    /// Pixels whose OD sum is not above this are discarded as background.
    pub od_threshold: f64,
    pub level: usize,
    pub focus_plane: Option<usize>,
    pub band: Option<usize>,
    /// Fixed seed for reproducible sampling; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_size: 10_000,
            od_threshold: 0.15,
            level: 0,
            focus_plane: None,
            band: None,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn request(&self) -> SampleRequest {
        SampleRequest {
            level: self.level,
            focus_plane: self.focus_plane,
            band: self.band,
        }
    }
}

/// Algorithm selection plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum EstimatorConfig {
    Macenko(MacenkoConfig),
    Svd(SvdConfig),
    Niethammer(NiethammerConfig),
    Nmf(NmfConfig),
    Ica(IcaConfig),
    PixelRoi(PixelRoiConfig),
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self::Macenko(MacenkoConfig::default())
    }
}

impl EstimatorConfig {
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Self::Macenko(_) => "Macenko",
            Self::Svd(_) => "SVD",
            Self::Niethammer(_) => "Niethammer",
            Self::Nmf(_) => "NMF",
            Self::Ica(_) => "ICA",
            Self::PixelRoi(_) => "Pixel ROI",
        }
    }

    /// Seed for the sampler, if the configuration fixes one.
    pub fn seed(&self) -> Option<u64> {
        match self {
            Self::Macenko(c) | Self::Svd(c) => c.sampling.seed,
            Self::Niethammer(c) => c.sampling.seed,
            Self::Nmf(c) => c.sampling.seed,
            Self::Ica(c) => c.sampling.seed,
            Self::PixelRoi(_) => None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Anything that can produce a stain matrix from a tiled image.
pub trait StainVectorEstimator {
    fn compute_stain_vectors(&mut self, source: &dyn TiledImageSource) -> Result<StainMatrix>;
}

/// Configured estimator with its own random generator.
#[derive(Debug, Clone)]
pub struct Estimator {
    config: EstimatorConfig,
    sampler: RandomPixelSampler,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let sampler = RandomPixelSampler::from_seed_option(config.seed());
        Self { config, sampler }
    }

    pub fn with_sampler(config: EstimatorConfig, sampler: RandomPixelSampler) -> Self {
        Self { config, sampler }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }
}

impl StainVectorEstimator for Estimator {
    fn compute_stain_vectors(&mut self, source: &dyn TiledImageSource) -> Result<StainMatrix> {
        let name = self.config.algorithm_name();
        tracing::info!(algorithm = name, "estimating stain vectors");
        let stains = match &self.config {
            EstimatorConfig::Macenko(c) => macenko::estimate(&mut self.sampler, source, c),
            EstimatorConfig::Svd(c) => svd::estimate(&mut self.sampler, source, c),
            EstimatorConfig::Niethammer(c) => niethammer::estimate(&mut self.sampler, source, c),
            EstimatorConfig::Nmf(c) => nmf::estimate(&mut self.sampler, source, c),
            EstimatorConfig::Ica(c) => ica::estimate(&mut self.sampler, source, c),
            EstimatorConfig::PixelRoi(c) => pixel_roi::estimate(&self.sampler, source, c),
        }?;
        tracing::info!(algorithm = name, ?stains, "stain vectors estimated");
        Ok(stains)
    }
}

/// Convenience: build an [`Estimator`] and run it once.
pub fn compute_stain_vectors(
    config: EstimatorConfig,
    source: &dyn TiledImageSource,
) -> Result<StainMatrix> {
    Estimator::new(config).compute_stain_vectors(source)
}

/// Sample OD pixels, failing if too few survive the threshold to fit a basis.
pub(crate) fn draw_samples<S>(
    sampler: &mut RandomPixelSampler,
    source: &S,
    config: &SamplingConfig,
) -> Result<Array2<f64>>
where
    S: TiledImageSource + ?Sized,
{
    let samples = sampler.sample(
        source,
        config.sample_size,
        config.od_threshold,
        config.request(),
    )?;
    if samples.nrows() <= samples.ncols() {
        return Err(StainError::InsufficientSamples {
            required: samples.ncols(),
            actual: samples.nrows(),
        });
    }
    Ok(samples)
}

/// Flip `v` so that its components sum to a non-negative value.
pub(crate) fn orient_positive(v: StainVector) -> StainVector {
    if v.iter().sum::<f64>() < 0.0 {
        v.map(|x| -x)
    } else {
        v
    }
}

/// Normalize, orient, sort and zero-fill estimated vectors into a matrix.
pub(crate) fn finalize_stain_vectors(
    vectors: &[StainVector],
    sort_order: StainSortOrder,
    complement_third: bool,
) -> StainMatrix {
    let mut vectors: Vec<StainVector> = vectors
        .iter()
        .take(3)
        .map(|v| orient_positive(normalize_vector(v)))
        .collect();
    match sort_order {
        StainSortOrder::Unsorted => {}
        StainSortOrder::RedAscending => vectors.sort_by(|a, b| a[0].total_cmp(&b[0])),
        StainSortOrder::RedDescending => vectors.sort_by(|a, b| b[0].total_cmp(&a[0])),
    }
    let m = stain_matrix_from_vectors(&vectors);
    if complement_third {
        complement_stain_matrix(&m)
    } else {
        m
    }
}
