use crate::color_deconvolution::{concentrations, reconstruct_rgb, ColorDeconvolution, DeconvolutionConfig};
use crate::error::StainError;
use crate::estimator::{compute_stain_vectors, EstimatorConfig};
use crate::optical_density::od_image;
use crate::stain_math::StainMatrix;
use crate::tiled_image::{InMemoryTiledImage, PixelLayout};
use image::RgbImage;
use numpy::{IntoPyArray, PyArray2, PyArray3, PyArrayDyn, PyReadonlyArray2, PyReadonlyArray3, PyReadonlyArrayDyn};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

impl From<StainError> for PyErr {
    fn from(err: StainError) -> Self {
        PyValueError::new_err(err.to_string())
    }
}

fn stain_matrix(array: &PyReadonlyArray2<'_, f64>) -> PyResult<StainMatrix> {
    let view = array.as_array();
    if view.shape() != [3, 3] {
        return Err(PyValueError::new_err(format!(
            "stain matrix must be 3x3, got {:?}",
            view.shape()
        )));
    }
    let mut m = [[0.0; 3]; 3];
    for (i, row) in m.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = view[[i, j]];
        }
    }
    Ok(m)
}

fn matrix_to_py<'py>(py: Python<'py>, m: &StainMatrix) -> Bound<'py, PyArray2<f64>> {
    let flat: Vec<f64> = m.iter().flatten().copied().collect();
    ndarray::Array2::from_shape_vec((3, 3), flat)
        .unwrap_or_else(|_| ndarray::Array2::zeros((3, 3)))
        .into_pyarray_bound(py)
}

fn rgb_image(array: &PyReadonlyArray3<'_, u8>) -> PyResult<RgbImage> {
    let view = array.as_array();
    let (h, w, c) = view.dim();
    if c != 3 {
        return Err(PyValueError::new_err(format!("image must have 3 channels, got {c}")));
    }
    let raw: Vec<u8> = view.iter().copied().collect();
    RgbImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| PyValueError::new_err("image buffer does not match its shape"))
}

#[pyfunction]
fn py_rgb_to_od<'py>(py: Python<'py>, im_rgb: PyReadonlyArrayDyn<'py, f64>) -> Bound<'py, PyArrayDyn<f64>> {
    od_image(im_rgb.as_array()).into_pyarray_bound(py)
}

/// Estimate stain vectors from an `(H, W, 3)` uint8 image.
///
/// `config_json` is an estimator configuration with an `"algorithm"` key;
/// Macenko defaults are used when it is omitted.
#[pyfunction]
#[pyo3(signature = (im_rgb, config_json=None, tile_size=512))]
fn py_estimate_stain_vectors<'py>(
    py: Python<'py>,
    im_rgb: PyReadonlyArray3<'py, u8>,
    config_json: Option<&str>,
    tile_size: u32,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let image = rgb_image(&im_rgb)?;
    let config = match config_json {
        Some(json) => EstimatorConfig::from_json_str(json)?,
        None => EstimatorConfig::default(),
    };
    let source = InMemoryTiledImage::from_rgb_image(&image, tile_size, 1, PixelLayout::Interleaved)?;
    let stains = py.allow_threads(|| compute_stain_vectors(config, &source))?;
    Ok(matrix_to_py(py, &stains))
}

/// Separate an `(H, W, 3)` uint8 image into `(S, H, W, 4)` RGBA stain images.
#[pyfunction]
#[pyo3(signature = (im_rgb, stain_matrix, num_stains, threshold=None))]
fn py_separate_stains<'py>(
    py: Python<'py>,
    im_rgb: PyReadonlyArray3<'py, u8>,
    stain_matrix: PyReadonlyArray2<'py, f64>,
    num_stains: usize,
    threshold: Option<f64>,
) -> PyResult<Vec<Bound<'py, PyArray3<u8>>>> {
    let image = rgb_image(&im_rgb)?;
    let stains = self::stain_matrix(&stain_matrix)?;
    let deconvolution = ColorDeconvolution::new(
        stains,
        num_stains,
        DeconvolutionConfig {
            threshold,
            display_stain: 0,
        },
    )?;
    let channels = py.allow_threads(|| deconvolution.separate(&image))?;
    channels
        .into_iter()
        .map(|c| -> PyResult<_> {
            let (w, h) = c.dimensions();
            let array = ndarray::Array3::from_shape_vec((h as usize, w as usize, 4), c.into_raw())
                .map_err(StainError::from)?;
            Ok(array.into_pyarray_bound(py))
        })
        .collect()
}

#[pyfunction]
fn py_concentrations<'py>(
    py: Python<'py>,
    im_od: PyReadonlyArray3<'py, f64>,
    stain_matrix: PyReadonlyArray2<'py, f64>,
) -> PyResult<Bound<'py, PyArray3<f64>>> {
    let stains = self::stain_matrix(&stain_matrix)?;
    let result = concentrations(im_od.as_array(), &stains)?;
    Ok(result.into_pyarray_bound(py))
}

#[pyfunction]
fn py_reconstruct_rgb<'py>(
    py: Python<'py>,
    concentrations: PyReadonlyArray3<'py, f64>,
    stain_matrix: PyReadonlyArray2<'py, f64>,
) -> PyResult<Bound<'py, PyArray3<f64>>> {
    let stains = self::stain_matrix(&stain_matrix)?;
    let result = reconstruct_rgb(concentrations.as_array(), &stains)?;
    Ok(result.into_pyarray_bound(py))
}

#[pymodule]
fn _rust(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(py_rgb_to_od, m)?)?;
    m.add_function(wrap_pyfunction!(py_estimate_stain_vectors, m)?)?;
    m.add_function(wrap_pyfunction!(py_separate_stains, m)?)?;
    m.add_function(wrap_pyfunction!(py_concentrations, m)?)?;
    m.add_function(wrap_pyfunction!(py_reconstruct_rgb, m)?)?;
    Ok(())
}
