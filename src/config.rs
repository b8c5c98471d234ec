use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{FindDirsError, Result};

/// Everything a search run needs, resolved once from the command line and
/// passed down explicitly.
#[derive(Debug, Clone, Serialize)]
pub struct FindDirsConfig {
    pub dir_name: PathBuf,
    pub ckpt: PathBuf,
    pub clip_ckpt: PathBuf,
    pub stylegan_size: usize,
    pub channel_multiplier: usize,
    pub truncation: f64,
    pub num_images: usize,
    pub num_directions: usize,
    pub generated_images: bool,
    pub data_path: Option<PathBuf>,
    pub data_offset: usize,
    pub dir_initialization: Option<PathBuf>,
    pub target_path: Option<PathBuf>,
    pub seed: u64,
    pub search: SearchParams,
}

/// Knobs of the joint optimization loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchParams {
    pub lr: f64,
    pub weight_decay: f64,
    pub coefficient_weight_decay: f64,
    pub step: usize,
    pub lambda_transfer: f64,
    pub lambda_consistency: f64,
    pub rampup: f64,
    pub rampdown: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            lr: 0.2,
            weight_decay: 3e-3,
            coefficient_weight_decay: 0.01,
            step: 1000,
            lambda_transfer: 1.0,
            lambda_consistency: 0.6,
            rampup: 0.005,
            rampdown: 0.75,
        }
    }
}

impl SearchParams {
    pub fn consistency_enabled(&self) -> bool {
        self.lambda_consistency > 0.0
    }

    pub fn validate(&self, num_images: usize) -> Result<()> {
        if !(self.lr >= 0.0 && self.lr.is_finite()) {
            return Err(config_err(format!("lr must be a finite non-negative number, got {}", self.lr)));
        }
        if self.weight_decay < 0.0 || self.coefficient_weight_decay < 0.0 {
            return Err(config_err("weight decay must be non-negative".to_string()));
        }
        if !(self.rampup > 0.0 && self.rampup <= 1.0) {
            return Err(config_err(format!("rampup must be in (0, 1], got {}", self.rampup)));
        }
        if !(self.rampdown > 0.0 && self.rampdown <= 1.0) {
            return Err(config_err(format!("rampdown must be in (0, 1], got {}", self.rampdown)));
        }
        if self.lambda_transfer < 0.0 || self.lambda_consistency < 0.0 {
            return Err(config_err("loss weights must be non-negative".to_string()));
        }
        if self.consistency_enabled() && num_images < 2 {
            return Err(config_err(format!(
                "consistency loss needs at least 2 training images, got {num_images}"
            )));
        }
        Ok(())
    }
}

impl FindDirsConfig {
    /// Checks everything that can be checked before touching a model, so a
    /// bad invocation fails before the first trial instead of halfway in.
    pub fn validate(&self) -> Result<()> {
        if self.num_images == 0 {
            return Err(config_err("num_images must be at least 1".to_string()));
        }
        if self.num_directions == 0 {
            return Err(config_err("num_directions must be at least 1".to_string()));
        }
        if !self.stylegan_size.is_power_of_two() || self.stylegan_size < 32 {
            return Err(config_err(format!(
                "stylegan_size must be a power of two >= 32, got {}",
                self.stylegan_size
            )));
        }
        if self.channel_multiplier == 0 {
            return Err(config_err("channel_multiplier must be at least 1".to_string()));
        }
        if !self.truncation.is_finite() {
            return Err(config_err("truncation must be finite".to_string()));
        }
        self.search.validate(self.num_images)?;

        require_file("ckpt", &self.ckpt)?;
        require_file("clip_ckpt", &self.clip_ckpt)?;
        if let Some(path) = &self.target_path {
            require_file("target_path", path)?;
        }
        if let Some(path) = &self.dir_initialization {
            require_file("dir_initialization", path)?;
        }
        if !self.generated_images {
            match &self.data_path {
                Some(path) => require_file("data_path", path)?,
                None => {
                    return Err(config_err(
                        "data_path is required unless generated_images is set".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

fn require_file(name: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(config_err(format!("{name} {} does not exist", path.display())))
    }
}

fn config_err(msg: String) -> FindDirsError {
    FindDirsError::Config(msg)
}
