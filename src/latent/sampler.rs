use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use tracing::{debug, info};

use crate::config::FindDirsConfig;
use crate::model::Generator;
use crate::{FindDirsError, Result};

/// Number of z codes averaged for the truncation center.
pub const MEAN_LATENT_SAMPLES: usize = 4096;

/// Draws truncated W+ latents from a generator with a seeded RNG, so runs
/// reproduce on any device.
pub struct LatentSampler {
    rng: StdRng,
    truncation: f64,
    mean_latent: Tensor,
    device: Device,
}

impl LatentSampler {
    pub fn new<G: Generator>(
        generator: &G,
        seed: u64,
        truncation: f64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let z = randn(&mut rng, (MEAN_LATENT_SAMPLES, generator.style_dim()), device)?;
        let mean_latent = generator.mean_latent(&z)?;
        debug!("mean latent computed from {MEAN_LATENT_SAMPLES} samples");

        Ok(Self {
            rng,
            truncation,
            mean_latent,
            device: device.clone(),
        })
    }

    pub fn mean_latent(&self) -> &Tensor {
        &self.mean_latent
    }

    /// One `[1, L, D]` latent: `mean + truncation * (map(z) - mean)`,
    /// repeated over every layer.
    pub fn sample_w_plus<G: Generator>(&mut self, generator: &G) -> Result<Tensor> {
        let z = randn(&mut self.rng, (1, generator.style_dim()), &self.device)?;
        let w = generator.map(&z)?;
        let w = (self
            .mean_latent
            .broadcast_add(&(w.broadcast_sub(&self.mean_latent)? * self.truncation)?))?;
        let w = w
            .unsqueeze(1)?
            .broadcast_as((1, generator.n_latent(), generator.style_dim()))?
            .contiguous()?;
        Ok(w.detach())
    }
}

fn randn<S: Into<candle_core::Shape>>(rng: &mut StdRng, shape: S, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| StandardNormal.sample(rng))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Starting points of every trial: fresh samples, or one stored direction
/// replicated for each trial.
pub fn initial_directions<G: Generator>(
    cfg: &FindDirsConfig,
    generator: &G,
    sampler: &mut LatentSampler,
    device: &Device,
) -> Result<Vec<Tensor>> {
    match &cfg.dir_initialization {
        None => (0..cfg.num_directions)
            .map(|_| sampler.sample_w_plus(generator))
            .collect(),
        Some(path) => {
            info!("initializing every direction from {}", path.display());
            let direction = load_direction(path, generator, device)?;
            Ok(vec![direction; cfg.num_directions])
        }
    }
}

/// Reads a direction stored as `.npy` and reshapes it to `[1, L, D]`.
pub fn load_direction<G: Generator, P: AsRef<std::path::Path>>(
    path: P,
    generator: &G,
    device: &Device,
) -> Result<Tensor> {
    let direction = Tensor::read_npy(path)?
        .to_dtype(DType::F32)?
        .to_device(device)?;
    let style_dim = generator.style_dim();
    let n_latent = direction.elem_count() / style_dim;
    if n_latent != generator.n_latent() || direction.elem_count() % style_dim != 0 {
        return Err(FindDirsError::Msg(format!(
            "direction with shape {:?} does not fit a [{}, {}] latent",
            direction.dims(),
            generator.n_latent(),
            style_dim
        )));
    }
    Ok(direction.reshape((1, n_latent, style_dim))?)
}

/// The batch of latents every trial edits, `[N, L, D]`.
pub fn training_latents<G: Generator>(
    cfg: &FindDirsConfig,
    generator: &G,
    sampler: &mut LatentSampler,
    device: &Device,
) -> Result<Tensor> {
    if cfg.generated_images {
        let latents = (0..cfg.num_images)
            .map(|_| sampler.sample_w_plus(generator))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Tensor::cat(&latents, 0)?);
    }

    let path = cfg.data_path.as_ref().ok_or_else(|| {
        FindDirsError::Config("data_path is required unless generated_images is set".to_string())
    })?;
    let data = Tensor::read_npy(path)?.to_dtype(DType::F32)?;
    let latents = select_latents(&data, cfg.data_offset, cfg.num_images, generator)?;
    info!(
        "loaded {} latents from {} at offset {}",
        cfg.num_images,
        path.display(),
        cfg.data_offset
    );
    Ok(latents.to_device(device)?)
}

/// Rows `offset .. offset + count` of a latent dataset, as `[count, L, D]`.
/// `[N, D]` datasets are repeated over every layer.
pub fn select_latents<G: Generator>(
    data: &Tensor,
    offset: usize,
    count: usize,
    generator: &G,
) -> Result<Tensor> {
    let rows = data.dim(0)?;
    if offset + count > rows {
        return Err(FindDirsError::Msg(format!(
            "dataset has {rows} latents, need {count} starting at {offset}"
        )));
    }
    let (n_latent, style_dim) = (generator.n_latent(), generator.style_dim());
    let selected = data.narrow(0, offset, count)?;
    let selected = match selected.dims() {
        [_, d] if *d == style_dim => selected
            .unsqueeze(1)?
            .broadcast_as((count, n_latent, style_dim))?
            .contiguous()?,
        [_, l, d] if *l == n_latent && *d == style_dim => selected.contiguous()?,
        [_, 1, l, d] if *l == n_latent && *d == style_dim => selected.squeeze(1)?.contiguous()?,
        dims => {
            return Err(FindDirsError::Msg(format!(
                "dataset rows of shape {:?} do not fit a [{n_latent}, {style_dim}] latent",
                &dims[1..]
            )))
        }
    };
    Ok(selected)
}
