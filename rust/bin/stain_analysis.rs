//! stain-analysis CLI: estimate stain vectors and separate stained images.

use clap::{Args, Parser, Subcommand, ValueEnum};
use stain_analysis::{
    pixel_fractions, ColorDeconvolution, DeconvolutionConfig, Estimator, EstimatorConfig,
    IcaConfig, InMemoryTiledImage, MacenkoConfig, NiethammerConfig, NmfConfig, PixelLayout,
    StainProfile, StainSortOrder, StainVectorEstimator, SvdConfig,
};
use std::path::{Path, PathBuf};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "stain-analysis")]
#[command(about = "Estimate histology stain vectors and separate images by stain")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate stain vectors from an image and write a stain profile.
    Estimate(EstimateArgs),

    /// Separate an image into one PNG per stain.
    Separate(SeparateArgs),

    /// Print the built-in stain profiles as JSON.
    Presets,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    Macenko,
    Svd,
    Niethammer,
    Nmf,
    Ica,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresetArg {
    He,
    Hdab,
    Hedab,
}

impl PresetArg {
    fn profile(self) -> StainProfile {
        match self {
            Self::He => StainProfile::hematoxylin_eosin(),
            Self::Hdab => StainProfile::hematoxylin_dab(),
            Self::Hedab => StainProfile::hematoxylin_eosin_dab(),
        }
    }
}

#[derive(Debug, Clone, Args)]
struct EstimateArgs {
    /// Path to the input RGB image.
    #[arg(long)]
    image: PathBuf,

    /// Estimator configuration (JSON with an "algorithm" key). Overrides
    /// --algorithm and --seed.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = AlgorithmArg::Macenko)]
    algorithm: AlgorithmArg,

    /// Fixed sampling seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Tile edge length used to split the image.
    #[arg(long, default_value = "512")]
    tile_size: u32,

    /// Number of pyramid levels to build.
    #[arg(long, default_value = "1")]
    levels: usize,

    /// Name stored in the written profile.
    #[arg(long, default_value = "estimated")]
    name: String,

    /// Where to write the profile (JSON); printed to stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct SeparateArgs {
    /// Path to the input RGB image.
    #[arg(long)]
    image: PathBuf,

    /// Stain profile (JSON). Takes precedence over --preset.
    #[arg(long)]
    profile: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = PresetArg::He)]
    preset: PresetArg,

    /// Directory for the per-stain PNGs.
    #[arg(long)]
    out_dir: PathBuf,

    /// Black out pixels whose stain OD sum is not above this.
    #[arg(long)]
    threshold: Option<f64>,

    /// OD threshold for the coverage report.
    #[arg(long, default_value = "0.15")]
    coverage_threshold: f64,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Estimate(args) => run_estimate(&args),
        Commands::Separate(args) => run_separate(&args),
        Commands::Presets => run_presets(),
    }
}

fn load_rgb(path: &Path) -> CliResult<image::RgbImage> {
    tracing::info!("Loading image: {}", path.display());
    let img = image::open(path).map_err(|e| -> CliError {
        format!("Failed to open image {}: {}", path.display(), e).into()
    })?;
    let rgb = img.to_rgb8();
    tracing::info!("Image size: {}x{}", rgb.width(), rgb.height());
    Ok(rgb)
}

fn estimator_config(args: &EstimateArgs) -> CliResult<EstimatorConfig> {
    if let Some(path) = &args.config {
        return Ok(EstimatorConfig::load(path)?);
    }
    let mut config = match args.algorithm {
        AlgorithmArg::Macenko => EstimatorConfig::Macenko(MacenkoConfig::default()),
        AlgorithmArg::Svd => EstimatorConfig::Svd(SvdConfig::default()),
        AlgorithmArg::Niethammer => EstimatorConfig::Niethammer(NiethammerConfig::default()),
        AlgorithmArg::Nmf => EstimatorConfig::Nmf(NmfConfig::default()),
        AlgorithmArg::Ica => EstimatorConfig::Ica(IcaConfig::default()),
    };
    match &mut config {
        EstimatorConfig::Macenko(c) | EstimatorConfig::Svd(c) => {
            c.sort_order = StainSortOrder::RedDescending;
            c.sampling.seed = args.seed;
        }
        EstimatorConfig::Niethammer(c) => c.sampling.seed = args.seed,
        EstimatorConfig::Nmf(c) => c.sampling.seed = args.seed,
        EstimatorConfig::Ica(c) => {
            c.sort_order = StainSortOrder::RedDescending;
            c.sampling.seed = args.seed;
        }
        EstimatorConfig::PixelRoi(_) => {}
    }
    Ok(config)
}

// ── estimate ───────────────────────────────────────────────────────────

fn run_estimate(args: &EstimateArgs) -> CliResult<()> {
    let rgb = load_rgb(&args.image)?;
    let source =
        InMemoryTiledImage::from_rgb_image(&rgb, args.tile_size, args.levels, PixelLayout::Interleaved)?;
    let config = estimator_config(args)?;
    let algorithm = config.algorithm_name();
    let parameters = serde_json::to_value(&config)?;

    let mut estimator = Estimator::new(config);
    let stains = estimator.compute_stain_vectors(&source)?;

    let mut profile = StainProfile::from_matrix(args.name.as_str(), &stains, algorithm);
    profile.analysis_model = "Color Deconvolution".to_string();
    if let serde_json::Value::Object(map) = parameters {
        for (key, value) in map {
            profile.parameters.insert(key, value.to_string());
        }
    }
    for stain in &profile.stains {
        tracing::info!(
            "{}: ({:.4}, {:.4}, {:.4})",
            stain.name,
            stain.od[0],
            stain.od[1],
            stain.od[2]
        );
    }

    let json = profile.to_json_string()?;
    match &args.out {
        Some(path) => {
            std::fs::write(path, &json)?;
            tracing::info!("Profile written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

// ── separate ───────────────────────────────────────────────────────────

fn run_separate(args: &SeparateArgs) -> CliResult<()> {
    let rgb = load_rgb(&args.image)?;
    let profile = match &args.profile {
        Some(path) => StainProfile::load(path)?,
        None => args.preset.profile(),
    };
    let deconvolution = ColorDeconvolution::from_profile(
        &profile,
        DeconvolutionConfig {
            threshold: args.threshold,
            display_stain: 0,
        },
    )?;

    std::fs::create_dir_all(&args.out_dir)?;
    let channels = deconvolution.separate(&rgb)?;
    for (channel, stain) in channels.iter().zip(&profile.stains) {
        let file = format!("{}.png", file_stem(&stain.name));
        let path = args.out_dir.join(file);
        channel.save(&path)?;
        tracing::info!("{} written to {}", stain.name, path.display());
    }

    let coverage = pixel_fractions(&deconvolution, &rgb, args.coverage_threshold)?;
    for (i, stain) in profile.stains.iter().enumerate() {
        println!("{:<16} {:>6.2}%", stain.name, 100.0 * coverage.fraction(i));
    }
    Ok(())
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

// ── presets ────────────────────────────────────────────────────────────

fn run_presets() -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(&StainProfile::presets())?);
    Ok(())
}
