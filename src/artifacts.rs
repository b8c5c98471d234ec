use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use tracing::debug;

use crate::latent::image::save_image;
use crate::latent::sampler::{load_direction, select_latents};
use crate::model::Generator;
use crate::{FindDirsError, Result};

/// Where a search run leaves its directions and renders. Every write
/// replaces whatever was stored under the same name.
pub trait ArtifactSink {
    fn save_direction(&mut self, trial: usize, direction: &Tensor) -> Result<()>;

    /// Per-image coefficients that go with the stored direction of `trial`.
    fn save_coefficients(&mut self, trial: usize, coefficients: &Tensor) -> Result<()>;

    /// The `[N, L, D]` batch every trial edits.
    fn save_latents(&mut self, latents: &Tensor) -> Result<()>;

    /// Stores a single `[3, H, W]` image in `[-1, 1]`.
    fn save_image(&mut self, name: &str, image: &Tensor) -> Result<()>;

    /// Stores every image of a `[B, 3, H, W]` batch as `{prefix}_{trial}_{j}`.
    fn save_batch(&mut self, prefix: &str, trial: usize, images: &Tensor) -> Result<()> {
        for j in 0..images.dim(0)? {
            self.save_image(&format!("{prefix}_{trial}_{j}"), &images.get(j)?)?;
        }
        Ok(())
    }
}

/// A stored edit read back from a run directory.
#[derive(Debug, Clone)]
pub struct StoredEdit {
    /// `[N, L, D]`
    pub latents: Tensor,
    /// `[1, L, D]`
    pub direction: Tensor,
    /// `[N]`
    pub coefficients: Tensor,
}

impl StoredEdit {
    /// `latents[i] + coefficients[i] * direction`.
    pub fn edited_latents(&self) -> Result<Tensor> {
        let n = self.coefficients.elem_count();
        let shift = self
            .coefficients
            .reshape((n, 1, 1))?
            .broadcast_mul(&self.direction)?;
        Ok(self.latents.broadcast_add(&shift)?)
    }
}

/// Writes `.npy` directions and `.png` images into one directory.
#[derive(Debug, Clone)]
pub struct DirArtifacts {
    dir: PathBuf,
}

impl DirArtifacts {
    /// Creates `dir` if needed and records the run configuration next to the
    /// results as `config.json`.
    pub fn create<P: AsRef<Path>, C: Serialize>(dir: P, config: &C) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let file = std::fs::File::create(dir.join("config.json"))?;
        serde_json::to_writer_pretty(file, config)?;
        Ok(Self { dir })
    }

    /// Wraps an existing run directory without touching its contents.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(FindDirsError::Config(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn direction_path(&self, trial: usize) -> PathBuf {
        self.dir.join(format!("direction{trial}.npy"))
    }

    pub fn coefficients_path(&self, trial: usize) -> PathBuf {
        self.dir.join(format!("coefficients{trial}.npy"))
    }

    pub fn latents_path(&self) -> PathBuf {
        self.dir.join("latents.npy")
    }

    pub fn image_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.png"))
    }

    /// Reads back the training latents, the best direction of `trial` and
    /// the coefficients stored with it.
    pub fn load_edit<G: Generator>(&self, trial: usize, generator: &G, device: &Device) -> Result<StoredEdit> {
        let data = Tensor::read_npy(self.latents_path())?.to_dtype(DType::F32)?;
        let rows = data.dim(0)?;
        let latents = select_latents(&data, 0, rows, generator)?.to_device(device)?;
        let direction = load_direction(self.direction_path(trial), generator, device)?;
        let coefficients = Tensor::read_npy(self.coefficients_path(trial))?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_device(device)?;
        if coefficients.elem_count() != rows {
            return Err(FindDirsError::Msg(format!(
                "{} coefficients stored for {rows} latents",
                coefficients.elem_count()
            )));
        }
        Ok(StoredEdit {
            latents,
            direction,
            coefficients,
        })
    }
}

impl ArtifactSink for DirArtifacts {
    fn save_direction(&mut self, trial: usize, direction: &Tensor) -> Result<()> {
        let path = self.direction_path(trial);
        direction.to_device(&Device::Cpu)?.write_npy(&path)?;
        debug!("saved {}", path.display());
        Ok(())
    }

    fn save_coefficients(&mut self, trial: usize, coefficients: &Tensor) -> Result<()> {
        let path = self.coefficients_path(trial);
        coefficients.to_device(&Device::Cpu)?.write_npy(&path)?;
        debug!("saved {}", path.display());
        Ok(())
    }

    fn save_latents(&mut self, latents: &Tensor) -> Result<()> {
        let path = self.latents_path();
        latents.to_device(&Device::Cpu)?.write_npy(&path)?;
        debug!("saved {}", path.display());
        Ok(())
    }

    fn save_image(&mut self, name: &str, image: &Tensor) -> Result<()> {
        let path = self.image_path(name);
        save_image(image, &path)?;
        debug!("saved {}", path.display());
        Ok(())
    }
}
