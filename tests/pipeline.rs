use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stain_analysis::stain_math::{dot, normalize_vector};
use stain_analysis::stain_profile::{EOSIN, HEMATOXYLIN};
use stain_analysis::{
    compute_stain_vectors, od_to_rgb, pixel_fractions, ColorDeconvolution, DeconvolutionConfig,
    EstimatorConfig, InMemoryTiledImage, MacenkoConfig, PixelLayout, SamplingConfig, StainProfile,
    StainSortOrder,
};

/// Left half hematoxylin-dominant, right half eosin-dominant, with a white
/// margin; concentrations vary per pixel.
fn synthetic_slide(seed: u64) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    RgbImage::from_fn(128, 96, |x, y| {
        if y >= 80 {
            return Rgb([255, 255, 255]);
        }
        let (ch, ce): (f64, f64) = if x < 64 {
            (rng.gen_range(0.3..1.0), rng.gen_range(0.0..0.2))
        } else {
            (rng.gen_range(0.0..0.2), rng.gen_range(0.3..1.0))
        };
        Rgb([0, 1, 2].map(|k| od_to_rgb(ch * HEMATOXYLIN[k] + ce * EOSIN[k])))
    })
}

#[test]
fn estimate_then_separate() {
    let slide = synthetic_slide(21);
    let source = InMemoryTiledImage::from_rgb_image(&slide, 32, 2, PixelLayout::Planar)
        .expect("pyramid");

    let config = EstimatorConfig::Macenko(MacenkoConfig {
        sampling: SamplingConfig {
            sample_size: 5000,
            seed: Some(99),
            ..SamplingConfig::default()
        },
        sort_order: StainSortOrder::RedDescending,
        ..MacenkoConfig::default()
    });
    let stains = compute_stain_vectors(config, &source).expect("stain vectors");
    assert!(dot(&stains[0], &normalize_vector(&HEMATOXYLIN)) > 0.98, "{:?}", stains[0]);
    assert!(dot(&stains[1], &normalize_vector(&EOSIN)) > 0.98, "{:?}", stains[1]);

    let profile = StainProfile::from_matrix("synthetic", &stains, "Macenko");
    assert_eq!(profile.num_stains(), 2);
    let json = profile.to_json_string().expect("json");
    let profile = StainProfile::from_json_str(&json).expect("reload");

    let deconvolution = ColorDeconvolution::from_profile(
        &profile,
        DeconvolutionConfig {
            threshold: Some(0.15),
            display_stain: 1,
        },
    )
    .expect("deconvolution");
    let channels = deconvolution.separate(&slide).expect("separate");
    assert_eq!(channels.len(), 3);
    assert!(channels
        .iter()
        .all(|c| c.dimensions() == slide.dimensions()));
    // The white margin is background in every stain channel.
    assert_eq!(channels[0].get_pixel(10, 90).0, [0, 0, 0, 255]);
    assert_eq!(channels[1].get_pixel(100, 90).0, [0, 0, 0, 255]);

    let shown = deconvolution.display(&slide).expect("display");
    assert_eq!(shown, channels[1]);

    let coverage = pixel_fractions(&deconvolution, &slide, 0.3).expect("coverage");
    assert_eq!(coverage.total, 128 * 96);
    let h = coverage.fraction(0);
    let e = coverage.fraction(1);
    assert!(h > 0.3 && h < 0.5, "hematoxylin coverage {h}");
    assert!(e > 0.3 && e < 0.5, "eosin coverage {e}");
}

#[test]
fn seeded_estimation_is_reproducible() {
    let slide = synthetic_slide(5);
    let source = InMemoryTiledImage::from_rgb_image(&slide, 40, 1, PixelLayout::Interleaved)
        .expect("pyramid");
    let config = EstimatorConfig::from_json_str(
        r#"{"algorithm": "svd", "sampling": {"sample_size": 2000, "seed": 11}}"#,
    )
    .expect("config");
    let a = compute_stain_vectors(config.clone(), &source).expect("first");
    let b = compute_stain_vectors(config, &source).expect("second");
    assert_eq!(a, b);
}

#[test]
fn presets_separate_white_to_white() {
    let white = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
    for profile in StainProfile::presets() {
        let dec = ColorDeconvolution::from_profile(&profile, DeconvolutionConfig::default())
            .expect("deconvolution");
        let channels = dec.separate(&white).expect("separate");
        for channel in channels.iter().take(profile.num_stains()) {
            assert!(channel.pixels().all(|p| p.0 == [255, 255, 255, 255]));
        }
    }
}
