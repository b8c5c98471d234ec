use std::path::PathBuf;

use clap::Parser;
use latent_directions::artifacts::DirArtifacts;
use latent_directions::config::{FindDirsConfig, SearchParams};
use latent_directions::model::clip::ClipEncoder;
use latent_directions::model::stylegan2::{self, StyleGan2};
use latent_directions::search::find_directions;
use latent_directions::{parse_device, set_seed};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Search StyleGAN2 latent directions that move a batch of images toward a
/// CLIP target while keeping the edit consistent across images
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Weight of the cross-image consistency loss
    #[arg(long, default_value_t = 0.6)]
    lambda_consistency: f64,

    /// Weight of the semantic transfer loss
    #[arg(long, default_value_t = 1.0)]
    lambda_transfer: f64,

    /// Name of directory to store results
    #[arg(long, default_value = "results_transfer")]
    dir_name: PathBuf,

    /// Pretrained StyleGAN2 weights (g_ema, safetensors)
    #[arg(long)]
    ckpt: PathBuf,

    /// Pretrained CLIP ViT-B/32 weights (safetensors)
    #[arg(long)]
    clip_ckpt: PathBuf,

    /// StyleGAN resolution
    #[arg(long, default_value_t = 1024)]
    stylegan_size: usize,

    /// StyleGAN channel multiplier
    #[arg(long, default_value_t = 2)]
    channel_multiplier: usize,

    /// Learning rate
    #[arg(long, default_value_t = 0.2)]
    lr: f64,

    /// Weight decay of the direction optimizer
    #[arg(long, default_value_t = 3e-3)]
    weight_decay: f64,

    /// Number of optimization steps per direction
    #[arg(long, default_value_t = 1000)]
    step: usize,

    /// Fraction of the run spent ramping the learning rate up
    #[arg(long, default_value_t = 0.005)]
    rampup: f64,

    /// Fraction of the run spent ramping the learning rate down
    #[arg(long, default_value_t = 0.75)]
    rampdown: f64,

    /// Target image. Without one, every direction is pulled toward its own rendering
    #[arg(long)]
    target_path: Option<PathBuf>,

    /// Truncation toward the mean latent for sampled latents
    #[arg(long, default_value_t = 0.7)]
    truncation: f64,

    /// Number of training images
    #[arg(long, default_value_t = 8)]
    num_images: usize,

    /// Number of directions to try
    #[arg(long, default_value_t = 10)]
    num_directions: usize,

    /// Sample the training latents instead of reading them from --data-path
    #[arg(long)]
    generated_images: bool,

    /// Training latents (.npy, [N, L, 512] or [N, 512])
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Index of the first training latent in --data-path
    #[arg(long, default_value_t = 3)]
    data_offset: usize,

    /// Start every direction from this stored direction (.npy)
    #[arg(long)]
    dir_initialization: Option<PathBuf>,

    /// Seed
    #[arg(short, long, default_value_t = 12345)]
    seed: u64,

    /// Device (cpu, cuda, 0, 1, ...)
    #[arg(short, long)]
    device: Option<String>,
}

impl From<Args> for FindDirsConfig {
    fn from(args: Args) -> Self {
        FindDirsConfig {
            dir_name: args.dir_name,
            ckpt: args.ckpt,
            clip_ckpt: args.clip_ckpt,
            stylegan_size: args.stylegan_size,
            channel_multiplier: args.channel_multiplier,
            truncation: args.truncation,
            num_images: args.num_images,
            num_directions: args.num_directions,
            generated_images: args.generated_images,
            data_path: args.data_path,
            data_offset: args.data_offset,
            dir_initialization: args.dir_initialization,
            target_path: args.target_path,
            seed: args.seed,
            search: SearchParams {
                lr: args.lr,
                weight_decay: args.weight_decay,
                step: args.step,
                lambda_transfer: args.lambda_transfer,
                lambda_consistency: args.lambda_consistency,
                rampup: args.rampup,
                rampdown: args.rampdown,
                ..Default::default()
            },
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let device = parse_device(args.device.clone())?;
    let cfg = FindDirsConfig::from(args);
    cfg.validate()?;

    set_seed(cfg.seed, &device)?;
    let dtype = candle_core::DType::F32;

    info!("Loading generator {}", cfg.ckpt.display());
    let generator = StyleGan2::load_file(
        &cfg.ckpt,
        &stylegan2::Config::new(cfg.stylegan_size, cfg.channel_multiplier),
        &device,
        dtype,
    )?;

    info!("Loading CLIP {}", cfg.clip_ckpt.display());
    let encoder = ClipEncoder::load_file(&cfg.clip_ckpt, &device, dtype)?;

    let mut sink = DirArtifacts::create(&cfg.dir_name, &cfg)?;
    let reports = find_directions(&cfg, &generator, &encoder, &mut sink, &device)?;

    for report in reports {
        info!(
            "direction{0}.npy, coefficients{0}.npy: loss {1:.4}, coefficients {2:?}",
            report.trial, report.best.loss, report.best_coefficients
        );
    }
    info!("Results in {}", sink.dir().display());

    Ok(())
}
