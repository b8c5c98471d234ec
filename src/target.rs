use candle_core::{Device, Tensor};
use tracing::info;

use crate::artifacts::ArtifactSink;
use crate::latent::image::image_preprocess;
use crate::loss::normalize;
use crate::model::{Generator, ImageEncoder};
use crate::{FindDirsError, Result};

/// Embedding every trial is pulled toward.
#[derive(Debug, Clone)]
pub enum Target {
    /// One unit-length embedding shared by every trial, from a target image.
    Shared(Tensor),
    /// One embedding per trial, `[num_directions, E]`, taken from the
    /// rendering of that trial's initial direction.
    PerTrial(Tensor),
}

impl Target {
    pub fn from_image<P, G, E, S>(
        path: P,
        generator: &G,
        encoder: &E,
        sink: &mut S,
        device: &Device,
    ) -> Result<Self>
    where
        P: AsRef<std::path::Path>,
        G: Generator,
        E: ImageEncoder,
        S: ArtifactSink,
    {
        info!("encoding target image {}", path.as_ref().display());
        let image = image_preprocess(path, generator.resolution())?.to_device(device)?;
        sink.save_image("target", &image.get(0)?)?;
        let embedding = encoder.encode(&image)?.detach();
        Ok(Target::Shared(normalize(&embedding)?.squeeze(0)?))
    }

    /// Renders each direction as if it were a latent and encodes the result.
    pub fn from_directions<G, E>(directions: &[Tensor], generator: &G, encoder: &E) -> Result<Self>
    where
        G: Generator,
        E: ImageEncoder,
    {
        let directions = Tensor::cat(directions, 0)?;
        let images = generator.synthesize(&directions)?;
        Ok(Target::PerTrial(encoder.encode(&images)?.detach()))
    }

    /// Unit-length `[E]` target for trial `idx`.
    pub fn for_trial(&self, idx: usize) -> Result<Tensor> {
        match self {
            Target::Shared(embedding) => Ok(embedding.clone()),
            Target::PerTrial(embeddings) => {
                let trials = embeddings.dim(0)?;
                if idx >= trials {
                    return Err(FindDirsError::Msg(format!(
                        "no target for trial {idx}, only {trials} were encoded"
                    )));
                }
                Ok(normalize(&embeddings.get(idx)?.unsqueeze(0)?)?.squeeze(0)?)
            }
        }
    }
}
