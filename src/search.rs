use std::fmt::Write;

use candle_core::{Device, Tensor, Var};
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use tracing::{debug, info};

use crate::artifacts::ArtifactSink;
use crate::config::{FindDirsConfig, SearchParams};
use crate::latent::sampler::{initial_directions, training_latents, LatentSampler};
use crate::loss::{self, LossValues};
use crate::model::{Generator, ImageEncoder};
use crate::optim::{Adam, ParamsAdam};
use crate::schedule::RampSchedule;
use crate::target::Target;
use crate::{FindDirsError, Result};

/// Lowest combined loss seen in a trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestState {
    pub loss: f32,
    pub step: Option<usize>,
}

impl Default for BestState {
    fn default() -> Self {
        Self {
            loss: f32::INFINITY,
            step: None,
        }
    }
}

impl BestState {
    /// Records `loss` if it is strictly lower than the best so far.
    pub fn update(&mut self, loss: f32, step: usize) -> bool {
        if loss < self.loss {
            self.loss = loss;
            self.step = Some(step);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialReport {
    pub trial: usize,
    pub best: BestState,
    /// Coefficients in effect when the best direction was stored.
    pub best_coefficients: Vec<f32>,
    pub last: Option<LossValues>,
    pub direction_norm: f32,
}

/// Renders of one evaluation pass, both `[N, 3, H, W]`.
pub struct EditRender {
    pub baseline: Tensor,
    pub edited: Tensor,
}

/// Joint search of a shared latent direction and per-image coefficients
/// over a fixed batch of training latents.
pub struct DirectionSearch<'a, G, E> {
    generator: &'a G,
    encoder: &'a E,
    params: SearchParams,
    latents: Tensor,
    baseline: Tensor,
}

impl<'a, G: Generator, E: ImageEncoder> DirectionSearch<'a, G, E> {
    /// Encodes the unedited latents once; that embedding never changes
    /// during a run and no gradient flows through it.
    pub fn new(generator: &'a G, encoder: &'a E, latents: Tensor, params: SearchParams) -> Result<Self> {
        let (num_images, n_latent, style_dim) = latents.dims3()?;
        if n_latent != generator.n_latent() || style_dim != generator.style_dim() {
            return Err(FindDirsError::Msg(format!(
                "training latents [{num_images}, {n_latent}, {style_dim}] do not fit the generator"
            )));
        }
        params.validate(num_images)?;

        let baseline = encoder.encode(&generator.synthesize(&latents)?)?.detach();
        Ok(Self {
            generator,
            encoder,
            params,
            latents,
            baseline,
        })
    }

    pub fn num_images(&self) -> usize {
        self.baseline.dims()[0]
    }

    /// `latents[i] + coefficients[i] * direction` for every image.
    pub fn edited_latents(&self, direction: &Tensor, coefficients: &Tensor) -> Result<Tensor> {
        let n = self.num_images();
        if coefficients.elem_count() != n {
            return Err(FindDirsError::Msg(format!(
                "{} coefficients for {n} training latents",
                coefficients.elem_count()
            )));
        }
        let shift = coefficients.reshape((n, 1, 1))?.broadcast_mul(direction)?;
        Ok(self.latents.broadcast_add(&shift)?)
    }

    /// Single evaluation pass with a fixed direction, nothing tracked.
    pub fn render(&self, direction: &Tensor, coefficients: &Tensor) -> Result<EditRender> {
        let direction = direction.detach();
        let coefficients = coefficients.detach();
        let baseline = self.generator.synthesize(&self.latents)?;
        let edited = self
            .generator
            .synthesize(&self.edited_latents(&direction, &coefficients)?)?;
        Ok(EditRender { baseline, edited })
    }

    /// Loss terms of one direction against one target.
    pub fn evaluate(
        &self,
        direction: &Tensor,
        coefficients: &Tensor,
        target: &Tensor,
    ) -> Result<loss::Objective> {
        let images = self
            .generator
            .synthesize(&self.edited_latents(direction, coefficients)?)?;
        let edited = self.encoder.encode(&images)?;
        Ok(loss::objective(&edited, &self.baseline, target, &self.params)?)
    }

    pub fn run_trial<S: ArtifactSink>(
        &self,
        trial: usize,
        init: &Tensor,
        target: &Tensor,
        sink: &mut S,
    ) -> Result<TrialReport> {
        if target.elem_count() != self.encoder.embed_dim() {
            return Err(FindDirsError::Msg(format!(
                "target embedding has {} values, the encoder produces {}",
                target.elem_count(),
                self.encoder.embed_dim()
            )));
        }
        let device = init.device();
        let direction = Var::from_tensor(&init.detach())?;
        let coefficients = Var::ones(self.num_images(), init.dtype(), device)?;

        let mut optimizer = Adam::new(
            vec![direction.clone()],
            ParamsAdam {
                lr: self.params.lr,
                weight_decay: self.params.weight_decay,
                ..Default::default()
            },
        )?;
        let mut schedule = RampSchedule::new(
            self.params.lr,
            self.params.step,
            self.params.rampdown,
            self.params.rampup,
        );

        let mut best = BestState::default();
        let mut best_coefficients = coefficients.to_vec1::<f32>()?;
        let mut last = None;

        let pb = progress_bar(self.params.step);
        for i in 0..self.params.step {
            let lr = schedule.step(&mut optimizer);
            // Rebuilt every step, so its moment estimates never carry over.
            let mut optimizer_coeffs = Adam::new(
                vec![coefficients.clone()],
                ParamsAdam {
                    lr: self.params.lr,
                    weight_decay: self.params.coefficient_weight_decay,
                    ..Default::default()
                },
            )?;

            let objective = self.evaluate(direction.as_tensor(), coefficients.as_tensor(), target)?;
            let values = objective.values;
            pb.set_message(format!(
                "{}; lr: {:.4}; norm: {:.4}",
                values.describe(),
                lr,
                l2_norm(direction.as_tensor())?
            ));

            let grads = objective.loss.backward()?;
            optimizer_coeffs.step(&grads)?;
            optimizer.step(&grads)?;
            last = Some(values);

            if best.update(values.total, i) {
                debug!(trial, step = i, loss = values.total, "new best");
                sink.save_direction(trial, direction.as_tensor())?;
                sink.save_coefficients(trial, coefficients.as_tensor())?;
                let render = self.render(direction.as_tensor(), coefficients.as_tensor())?;
                sink.save_batch("img_gen", trial, &render.baseline)?;
                sink.save_batch("img_gen_amp", trial, &render.edited)?;
                best_coefficients = coefficients.to_vec1::<f32>()?;
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(TrialReport {
            trial,
            best,
            best_coefficients,
            last,
            direction_norm: l2_norm(direction.as_tensor())?,
        })
    }
}

fn l2_norm(xs: &Tensor) -> Result<f32> {
    Ok(xs.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?)
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:.cyan/blue}] {wide_msg} {human_pos}/{human_len} {per_sec} ({eta})",
    ) {
        pb.set_style(
            style
                .with_key("eta", |state: &ProgressState, w: &mut dyn Write| {
                    let _ = write!(w, "{:.1}m", state.eta().as_secs_f64() / 60.);
                })
                .progress_chars("#>-"),
        );
    }
    pb
}

/// Runs one trial per direction, each against its own target.
pub fn run_search<G, E, S>(
    search: &DirectionSearch<G, E>,
    directions: &[Tensor],
    target: &Target,
    sink: &mut S,
) -> Result<Vec<TrialReport>>
where
    G: Generator,
    E: ImageEncoder,
    S: ArtifactSink,
{
    let mut reports = Vec::with_capacity(directions.len());
    for (idx, direction) in directions.iter().enumerate() {
        let target = target.for_trial(idx)?;
        let report = search.run_trial(idx, direction, &target, sink)?;
        match report.best.step {
            Some(step) => info!(
                "direction {idx}: best loss {:.4} at step {step}, norm {:.4}",
                report.best.loss, report.direction_norm
            ),
            None => info!("direction {idx}: no steps run"),
        }
        reports.push(report);
    }
    Ok(reports)
}

/// The whole pipeline: sample or load the starting points, render their
/// previews, build the target, then search.
pub fn find_directions<G, E, S>(
    cfg: &FindDirsConfig,
    generator: &G,
    encoder: &E,
    sink: &mut S,
    device: &Device,
) -> Result<Vec<TrialReport>>
where
    G: Generator,
    E: ImageEncoder,
    S: ArtifactSink,
{
    let mut sampler = LatentSampler::new(generator, cfg.seed, cfg.truncation, device)?;

    let directions = initial_directions(cfg, generator, &mut sampler, device)?;
    let previews = generator.synthesize(&Tensor::cat(&directions, 0)?)?;
    for j in 0..directions.len() {
        sink.save_image(&format!("dir_{j}"), &previews.get(j)?)?;
    }
    info!("{} initial directions", directions.len());

    let latents = training_latents(cfg, generator, &mut sampler, device)?;
    sink.save_latents(&latents)?;

    let target = match &cfg.target_path {
        Some(path) => Target::from_image(path, generator, encoder, sink, device)?,
        None => Target::from_directions(&directions, generator, encoder)?,
    };

    let search = DirectionSearch::new(generator, encoder, latents, cfg.search)?;
    run_search(&search, &directions, &target, sink)
}
