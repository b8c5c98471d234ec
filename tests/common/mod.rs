#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use latent_directions::artifacts::ArtifactSink;
use latent_directions::config::{FindDirsConfig, SearchParams};
use latent_directions::model::stylegan2::{Config, StyleGan2};
use latent_directions::model::ImageEncoder;

pub const STYLE_DIM: usize = 8;
pub const SIZE: usize = 8;

/// Randomly initialised StyleGAN2 small enough for CPU tests. The weights are
/// plain tensors, so only the search variables get gradients.
pub fn tiny_generator() -> Result<StyleGan2> {
    let config = Config {
        size: SIZE,
        style_dim: STYLE_DIM,
        n_mlp: 2,
        channel_multiplier: 1,
        max_channels: 4,
        lr_mlp: 0.01,
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    StyleGan2::new(vb, &config)?;

    let tensors: HashMap<String, Tensor> = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect();
    let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
    StyleGan2::new(vb, &config)
}

/// Random linear projection of the flattened image.
pub struct LinearEncoder {
    projection: Tensor,
}

impl LinearEncoder {
    pub fn new(embed_dim: usize) -> Result<Self> {
        let projection = Tensor::randn(0f32, 1., (3 * SIZE * SIZE, embed_dim), &Device::Cpu)?;
        Ok(Self { projection })
    }
}

impl ImageEncoder for LinearEncoder {
    fn embed_dim(&self) -> usize {
        self.projection.dims()[1]
    }

    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        images.flatten_from(1)?.matmul(&self.projection)
    }
}

/// Keeps track of every write instead of touching the filesystem.
#[derive(Default)]
pub struct RecordingSink {
    pub directions: Vec<(usize, Tensor)>,
    pub coefficients: Vec<(usize, Tensor)>,
    pub latents: Option<Tensor>,
    pub images: Vec<String>,
}

impl ArtifactSink for RecordingSink {
    fn save_direction(&mut self, trial: usize, direction: &Tensor) -> latent_directions::Result<()> {
        self.directions.push((trial, direction.detach()));
        Ok(())
    }

    fn save_coefficients(&mut self, trial: usize, coefficients: &Tensor) -> latent_directions::Result<()> {
        self.coefficients.push((trial, coefficients.detach()));
        Ok(())
    }

    fn save_latents(&mut self, latents: &Tensor) -> latent_directions::Result<()> {
        self.latents = Some(latents.detach());
        Ok(())
    }

    fn save_image(&mut self, name: &str, _image: &Tensor) -> latent_directions::Result<()> {
        self.images.push(name.to_string());
        Ok(())
    }
}

pub fn params(step: usize) -> SearchParams {
    SearchParams {
        step,
        ..Default::default()
    }
}

pub fn config(out: &Path, num_directions: usize, num_images: usize, step: usize) -> FindDirsConfig {
    FindDirsConfig {
        dir_name: out.to_path_buf(),
        ckpt: PathBuf::from("unused.safetensors"),
        clip_ckpt: PathBuf::from("unused.safetensors"),
        stylegan_size: SIZE,
        channel_multiplier: 1,
        truncation: 0.7,
        num_images,
        num_directions,
        generated_images: true,
        data_path: None,
        data_offset: 3,
        dir_initialization: None,
        target_path: None,
        seed: 12345,
        search: params(step),
    }
}

pub fn write_target_image(path: &Path) {
    let img = image::RgbImage::from_fn(20, 12, |x, y| image::Rgb([(x * 12) as u8, (y * 20) as u8, 90]));
    img.save(path).unwrap();
}

pub fn count_files(dir: &Path, ext: &str) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some(ext))
        .count()
}
