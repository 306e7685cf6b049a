//! Stain vector estimation and color deconvolution for tiled histology
//! images.
//!
//! Pixels are sampled from a [`TiledImageSource`], converted to optical
//! density and reduced to up to three stain vectors by one of the estimators
//! selected through [`EstimatorConfig`]. [`ColorDeconvolution`] then splits
//! RGB images into per-stain images with the resulting [`StainMatrix`].

pub mod angle_histogram;
pub mod basis_transform;
pub mod color_deconvolution;
pub mod error;
pub mod estimator;
pub mod float_trait;
pub mod ica;
pub mod macenko;
pub mod macenko_histogram;
pub mod niethammer;
pub mod niethammer_histogram;
pub mod nmf;
pub mod optical_density;
pub mod pixel_fraction;
pub mod pixel_roi;
pub mod sampler;
pub mod stain_math;
pub mod stain_profile;
pub mod svd;
pub mod tiled_image;

#[cfg(feature = "python")]
mod python;

pub use basis_transform::{BasisTransform, VectorDirection};
pub use color_deconvolution::{
    concentrations, reconstruct_rgb, rgb_concentrations, ColorDeconvolution, DeconvolutionConfig,
};
pub use error::{Result, StainError};
pub use estimator::{
    compute_stain_vectors, Estimator, EstimatorConfig, SamplingConfig, StainSortOrder,
    StainVectorEstimator,
};
pub use float_trait::StainFloat;
pub use ica::IcaConfig;
pub use macenko::MacenkoConfig;
pub use niethammer::NiethammerConfig;
pub use nmf::NmfConfig;
pub use optical_density::{od_image, od_to_rgb, rgb_to_od, OdLookupTable, OD_MIN};
pub use pixel_fraction::{pixel_fractions, PixelFractions};
pub use pixel_roi::PixelRoiConfig;
pub use sampler::{PixelRegion, RandomPixelSampler, SampleRequest};
pub use stain_math::{StainMatrix, StainVector};
pub use stain_profile::{Stain, StainProfile};
pub use svd::SvdConfig;
pub use tiled_image::{InMemoryTiledImage, PixelLayout, Tile, TileRequest, TiledImageSource};
