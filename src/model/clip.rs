use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};

use super::ImageEncoder;

const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Resamples generator output to the CLIP input size: nearest upsampling by
/// 7 followed by average pooling by `resolution / 32`, which lands on 224
/// for any resolution divisible by 32. Then maps `[-1, 1]` to the CLIP
/// pixel normalization.
pub fn clip_preprocess(images: &Tensor, image_size: usize) -> Result<Tensor> {
    let (_, _, h, w) = images.dims4()?;
    if h != w || h % 32 != 0 || image_size != 224 {
        candle_core::bail!(
            "expected square images with a side divisible by 32 and a 224 CLIP input, got {h}x{w} -> {image_size}"
        )
    }
    let pool = h / 32;
    let xs = images.upsample_nearest2d(h * 7, w * 7)?;
    let xs = if pool > 1 { xs.avg_pool2d(pool)? } else { xs };

    let device = images.device();
    let dtype = images.dtype();
    let mean = Tensor::new(&CLIP_MEAN, device)?.to_dtype(dtype)?.reshape((1, 3, 1, 1))?;
    let std = Tensor::new(&CLIP_STD, device)?.to_dtype(dtype)?.reshape((1, 3, 1, 1))?;
    xs.affine(0.5, 0.5)?.broadcast_sub(&mean)?.broadcast_div(&std)
}

pub struct ClipEncoder {
    model: ClipModel,
    config: ClipConfig,
}

impl ClipEncoder {
    pub fn new(vs: VarBuilder, config: ClipConfig) -> Result<Self> {
        let model = ClipModel::new(vs, &config)?;
        Ok(Self { model, config })
    }

    /// Loads `openai/clip-vit-base-patch32` weights in the transformers
    /// safetensors layout.
    pub fn load_file<P: AsRef<std::path::Path>>(
        weights_path: P,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vs = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)?
        };

        ClipEncoder::new(vs, ClipConfig::vit_base_patch32())
    }
}

impl ImageEncoder for ClipEncoder {
    fn embed_dim(&self) -> usize {
        self.config.vision_config.projection_dim
    }

    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let pixel_values = clip_preprocess(images, self.config.image_size)?;
        self.model.get_image_features(&pixel_values)
    }
}
