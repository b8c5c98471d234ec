pub mod clip;
pub mod stylegan2;

use candle_core::{Result, Tensor};

/// Maps latent codes to images.
pub trait Generator {
    /// Width of a single latent vector (`D`).
    fn style_dim(&self) -> usize;

    /// Number of per-layer latents in a W+ code (`L`).
    fn n_latent(&self) -> usize;

    /// Output resolution in pixels.
    fn resolution(&self) -> usize;

    /// Runs the mapping network: `[B, D]` z codes to `[B, D]` w codes.
    fn map(&self, z: &Tensor) -> Result<Tensor>;

    /// Average w over a batch of z codes `[n, D]`, giving `[1, D]`.
    fn mean_latent(&self, z: &Tensor) -> Result<Tensor> {
        self.map(z)?.mean_keepdim(0)
    }

    /// Renders `[B, L, D]` W+ latents into `[B, 3, H, W]` images in `[-1, 1]`.
    fn synthesize(&self, latents: &Tensor) -> Result<Tensor>;
}

/// Maps images in `[-1, 1]` to embedding vectors.
pub trait ImageEncoder {
    fn embed_dim(&self) -> usize;

    /// `[B, 3, H, W]` images to `[B, E]` embeddings, not normalized.
    fn encode(&self, images: &Tensor) -> Result<Tensor>;
}
