use std::path::PathBuf;

use candle_core::{Device, Tensor};
use clap::Parser;
use latent_directions::artifacts::{DirArtifacts, StoredEdit};
use latent_directions::latent::image::save_image;
use latent_directions::latent::sampler::{load_direction, select_latents, LatentSampler};
use latent_directions::model::stylegan2::{self, StyleGan2};
use latent_directions::model::Generator;
use latent_directions::{parse_device, set_seed, FindDirsError};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Render a stored direction applied to a batch of latents. With --run-dir the
/// training latents and coefficients of a find-dirs run are reused, which
/// reproduces its img_gen / img_gen_amp renders
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pretrained StyleGAN2 weights (g_ema, safetensors)
    #[arg(long)]
    ckpt: PathBuf,

    /// StyleGAN resolution
    #[arg(long, default_value_t = 1024)]
    stylegan_size: usize,

    /// StyleGAN channel multiplier
    #[arg(long, default_value_t = 2)]
    channel_multiplier: usize,

    /// Output directory of a find-dirs run (latents.npy, direction{k}.npy, coefficients{k}.npy)
    #[arg(long, conflicts_with_all = ["direction", "latents"])]
    run_dir: Option<PathBuf>,

    /// Which direction of --run-dir to render
    #[arg(long, default_value_t = 0)]
    trial: usize,

    /// Direction to apply (.npy). Required without --run-dir
    #[arg(long)]
    direction: Option<PathBuf>,

    /// Latent dataset to edit (.npy). Fresh samples when missing
    #[arg(long)]
    latents: Option<PathBuf>,

    /// Index of the first latent in --latents
    #[arg(long, default_value_t = 3)]
    data_offset: usize,

    /// Number of images to render without --run-dir
    #[arg(long, default_value_t = 8)]
    num_images: usize,

    /// Edit strength per image, comma separated. One value applies to all.
    /// Defaults to the stored coefficients with --run-dir, 1 otherwise
    #[arg(long, value_delimiter = ',')]
    coefficients: Option<Vec<f32>>,

    /// Truncation for sampled latents
    #[arg(long, default_value_t = 0.7)]
    truncation: f64,

    /// Output directory
    #[arg(short, long, default_value = "results_apply")]
    out: PathBuf,

    /// Seed
    #[arg(short, long, default_value_t = 12345)]
    seed: u64,

    /// Device (cpu, cuda, 0, 1, ...)
    #[arg(short, long)]
    device: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let device = parse_device(args.device)?;
    set_seed(args.seed, &device)?;
    let dtype = candle_core::DType::F32;

    let generator = StyleGan2::load_file(
        &args.ckpt,
        &stylegan2::Config::new(args.stylegan_size, args.channel_multiplier),
        &device,
        dtype,
    )?;
    let edit = match &args.run_dir {
        Some(dir) => {
            info!("Reading trial {} of {}", args.trial, dir.display());
            let mut edit = DirArtifacts::open(dir)?.load_edit(args.trial, &generator, &device)?;
            if let Some(cs) = &args.coefficients {
                edit.coefficients = expand_coefficients(cs, edit.latents.dim(0)?, &device)?;
            }
            edit
        }
        None => {
            let path = args.direction.as_ref().ok_or_else(|| {
                FindDirsError::Config("--direction is required without --run-dir".to_string())
            })?;
            let direction = load_direction(path, &generator, &device)?;
            let latents = match &args.latents {
                Some(path) => {
                    let data = Tensor::read_npy(path)?.to_dtype(dtype)?;
                    select_latents(&data, args.data_offset, args.num_images, &generator)?.to_device(&device)?
                }
                None => {
                    let mut sampler = LatentSampler::new(&generator, args.seed, args.truncation, &device)?;
                    let latents = (0..args.num_images)
                        .map(|_| sampler.sample_w_plus(&generator))
                        .collect::<latent_directions::Result<Vec<_>>>()?;
                    Tensor::cat(&latents, 0)?
                }
            };
            let coefficients = expand_coefficients(
                args.coefficients.as_deref().unwrap_or(&[1.0]),
                args.num_images,
                &device,
            )?;
            StoredEdit {
                latents,
                direction,
                coefficients,
            }
        }
    };
    let num_images = edit.latents.dim(0)?;

    std::fs::create_dir_all(&args.out)?;
    let baseline = generator.synthesize(&edit.latents)?;
    let edited = generator.synthesize(&edit.edited_latents()?)?;
    for j in 0..num_images {
        save_image(&baseline.get(j)?, args.out.join(format!("img_gen_{j}.png")))?;
        save_image(&edited.get(j)?, args.out.join(format!("img_gen_amp_{j}.png")))?;
    }
    info!("Rendered {} images into {}", num_images, args.out.display());

    Ok(())
}

/// One value per image, or a single value for all of them.
fn expand_coefficients(values: &[f32], num_images: usize, device: &Device) -> anyhow::Result<Tensor> {
    let values = match values {
        [c] => vec![*c; num_images],
        cs if cs.len() == num_images => cs.to_vec(),
        cs => {
            return Err(FindDirsError::Config(format!(
                "{} coefficients for {} images",
                cs.len(),
                num_images
            ))
            .into())
        }
    };
    Ok(Tensor::from_vec(values, num_images, device)?)
}
