// StyleGAN2 generator, parameter names follow the `g_ema` state dict:
// style.1.weight
// style.1.bias
// ...
// input.input
// conv1.conv.weight
// conv1.conv.modulation.weight
// conv1.conv.modulation.bias
// conv1.noise.weight
// conv1.activate.bias
// to_rgb1.conv.weight
// to_rgb1.conv.modulation.weight
// to_rgb1.conv.modulation.bias
// to_rgb1.bias
// convs.{i}.*
// to_rgbs.{i}.*
// noises.noise_{i}
//
// Modulation is applied to the activations instead of the weights so the
// convolution kernel stays shared across the batch.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{init::Init, VarBuilder};

use super::Generator;

const BLUR_KERNEL: [f32; 4] = [1., 3., 3., 1.];

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub size: usize,
    pub style_dim: usize,
    pub n_mlp: usize,
    pub channel_multiplier: usize,
    pub max_channels: usize,
    pub lr_mlp: f64,
}

impl Config {
    pub fn new(size: usize, channel_multiplier: usize) -> Self {
        Self {
            size,
            style_dim: 512,
            n_mlp: 8,
            channel_multiplier,
            max_channels: 512,
            lr_mlp: 0.01,
        }
    }

    pub fn channels(&self, res: usize) -> usize {
        (16384 * self.channel_multiplier / res).min(self.max_channels)
    }

    pub fn log_size(&self) -> usize {
        self.size.trailing_zeros() as usize
    }

    pub fn n_latent(&self) -> usize {
        self.log_size() * 2 - 2
    }

    pub fn num_layers(&self) -> usize {
        (self.log_size() - 2) * 2 + 1
    }
}

fn leaky_relu(xs: &Tensor, negative_slope: f64) -> Result<Tensor> {
    xs.maximum(&(xs * negative_slope)?)
}

/// Bias add along dim 1, leaky relu, then the sqrt(2) gain.
fn fused_leaky_relu(xs: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let mut shape = vec![1; xs.rank()];
    shape[1] = bias.elem_count();
    let xs = xs.broadcast_add(&bias.reshape(shape)?)?;
    leaky_relu(&xs, 0.2)? * std::f64::consts::SQRT_2
}

fn pixel_norm(xs: &Tensor) -> Result<Tensor> {
    let norm = (xs.sqr()?.mean_keepdim(1)? + 1e-8)?.sqrt()?;
    xs.broadcast_div(&norm)
}

/// Inserts a zero after every sample along both spatial dims.
fn zero_stuff(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    xs.unsqueeze(4)?
        .pad_with_zeros(4, 0, 1)?
        .reshape((b, c, h, 2 * w))?
        .unsqueeze(3)?
        .pad_with_zeros(3, 0, 1)?
        .reshape((b, c, 2 * h, 2 * w))
}

#[derive(Debug)]
struct EqualLinear {
    weight: Tensor,
    bias: Tensor,
    scale: f64,
    lr_mul: f64,
    activate: bool,
}

impl EqualLinear {
    fn new(
        in_dim: usize,
        out_dim: usize,
        bias_init: f64,
        lr_mul: f64,
        activate: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            Init::Randn {
                mean: 0.,
                stdev: 1. / lr_mul,
            },
        )?;
        let bias = vb.get_with_hints(out_dim, "bias", Init::Const(bias_init))?;

        Ok(Self {
            weight,
            bias,
            scale: (1. / (in_dim as f64).sqrt()) * lr_mul,
            lr_mul,
            activate,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let weight = (&self.weight * self.scale)?;
        let bias = (&self.bias * self.lr_mul)?;
        let xs = xs.matmul(&weight.t()?)?;
        if self.activate {
            fused_leaky_relu(&xs, &bias)
        } else {
            xs.broadcast_add(&bias.unsqueeze(0)?)
        }
    }
}

/// FIR filter with zero padding, applied per channel.
#[derive(Debug)]
struct Blur {
    kernel: Tensor,
    pad: (usize, usize),
}

impl Blur {
    fn new(gain: f32, pad: (usize, usize), device: &Device) -> Result<Self> {
        let k = BLUR_KERNEL.len();
        let total: f32 = BLUR_KERNEL.iter().sum::<f32>().powi(2);
        let mut data = Vec::with_capacity(k * k);
        for a in BLUR_KERNEL {
            for b in BLUR_KERNEL {
                data.push(a * b / total * gain);
            }
        }
        let kernel = Tensor::from_vec(data, (1, 1, k, k), device)?;
        Ok(Self { kernel, pad })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = xs.dims4()?;
        let (p0, p1) = self.pad;
        let xs = xs.pad_with_zeros(2, p0, p1)?.pad_with_zeros(3, p0, p1)?;
        let (_, _, h, w) = xs.dims4()?;
        let kernel = self.kernel.to_dtype(xs.dtype())?;
        let xs = xs.reshape((b * c, 1, h, w))?.conv2d(&kernel, 0, 1, 1, 1)?;
        let (_, _, oh, ow) = xs.dims4()?;
        xs.reshape((b, c, oh, ow))
    }
}

#[derive(Debug)]
struct ModulatedConv2d {
    weight: Tensor,
    modulation: EqualLinear,
    scale: f64,
    padding: usize,
    demodulate: bool,
    upsample: Option<Blur>,
}

impl ModulatedConv2d {
    fn new(
        in_channel: usize,
        out_channel: usize,
        kernel_size: usize,
        style_dim: usize,
        demodulate: bool,
        upsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb
            .get_with_hints(
                (1, out_channel, in_channel, kernel_size, kernel_size),
                "weight",
                Init::Randn {
                    mean: 0.,
                    stdev: 1.,
                },
            )?
            .squeeze(0)?;
        let modulation = EqualLinear::new(style_dim, in_channel, 1., 1., false, vb.pp("modulation"))?;

        let upsample = if upsample {
            let factor = 2;
            let p = (BLUR_KERNEL.len() - factor) - (kernel_size - 1);
            let pad0 = (p + 1) / 2 + factor - 1;
            let pad1 = p / 2 + 1;
            Some(Blur::new((factor * factor) as f32, (pad0, pad1), vb.device())?)
        } else {
            None
        };

        Ok(Self {
            weight,
            modulation,
            scale: 1. / ((in_channel * kernel_size * kernel_size) as f64).sqrt(),
            padding: kernel_size / 2,
            demodulate,
            upsample,
        })
    }

    fn forward(&self, xs: &Tensor, style: &Tensor) -> Result<Tensor> {
        let (b, in_channel, _, _) = xs.dims4()?;
        let out_channel = self.weight.dim(0)?;
        let style = self.modulation.forward(style)?;
        let weight = (&self.weight * self.scale)?;

        let xs = xs.broadcast_mul(&style.reshape((b, in_channel, 1, 1))?)?;
        let xs = match &self.upsample {
            Some(blur) => {
                let kernel = weight.transpose(0, 1)?.contiguous()?;
                let xs = xs.conv_transpose2d(&kernel, 0, 0, 2, 1)?;
                blur.forward(&xs)?
            }
            None => xs.conv2d(&weight, self.padding, 1, 1, 1)?,
        };

        if !self.demodulate {
            return Ok(xs);
        }
        let weight_sq = weight.sqr()?.sum((2, 3))?;
        let demod = (style.sqr()?.matmul(&weight_sq.t()?)? + 1e-8)?
            .sqrt()?
            .recip()?;
        xs.broadcast_mul(&demod.reshape((b, out_channel, 1, 1))?)
    }
}

#[derive(Debug)]
struct StyledConv {
    conv: ModulatedConv2d,
    noise_weight: Tensor,
    activate_bias: Tensor,
}

impl StyledConv {
    fn new(
        in_channel: usize,
        out_channel: usize,
        style_dim: usize,
        upsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            conv: ModulatedConv2d::new(
                in_channel,
                out_channel,
                3,
                style_dim,
                true,
                upsample,
                vb.pp("conv"),
            )?,
            noise_weight: vb.get_with_hints(1, "noise.weight", Init::Const(0.))?,
            activate_bias: vb.get_with_hints(out_channel, "activate.bias", Init::Const(0.))?,
        })
    }

    fn forward(&self, xs: &Tensor, style: &Tensor, noise: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs, style)?;
        let xs = xs.broadcast_add(&noise.broadcast_mul(&self.noise_weight)?)?;
        fused_leaky_relu(&xs, &self.activate_bias)
    }
}

#[derive(Debug)]
struct ToRgb {
    conv: ModulatedConv2d,
    bias: Tensor,
    upsample: Option<Blur>,
}

impl ToRgb {
    fn new(in_channel: usize, style_dim: usize, upsample: bool, vb: VarBuilder) -> Result<Self> {
        let upsample = if upsample {
            let factor = 2;
            let p = BLUR_KERNEL.len() - factor;
            let pad0 = (p + 1) / 2 + factor - 1;
            let pad1 = p / 2;
            Some(Blur::new((factor * factor) as f32, (pad0, pad1), vb.device())?)
        } else {
            None
        };

        Ok(Self {
            conv: ModulatedConv2d::new(in_channel, 3, 1, style_dim, false, false, vb.pp("conv"))?,
            bias: vb.get_with_hints((1, 3, 1, 1), "bias", Init::Const(0.))?,
            upsample,
        })
    }

    fn forward(&self, xs: &Tensor, style: &Tensor, skip: Option<&Tensor>) -> Result<Tensor> {
        let out = self.conv.forward(xs, style)?.broadcast_add(&self.bias)?;
        match (skip, &self.upsample) {
            (Some(skip), Some(blur)) => out + blur.forward(&zero_stuff(skip)?)?,
            (Some(skip), None) => out + skip,
            (None, _) => Ok(out),
        }
    }
}

#[derive(Debug)]
pub struct StyleGan2 {
    config: Config,
    style: Vec<EqualLinear>,
    input: Tensor,
    conv1: StyledConv,
    to_rgb1: ToRgb,
    convs: Vec<StyledConv>,
    to_rgbs: Vec<ToRgb>,
    noises: Vec<Tensor>,
}

impl StyleGan2 {
    pub fn new(vb: VarBuilder, c: &Config) -> Result<Self> {
        if !c.size.is_power_of_two() || c.size < 4 {
            candle_core::bail!("generator size must be a power of two >= 4, got {}", c.size)
        }

        let style = (1..=c.n_mlp)
            .map(|i| {
                EqualLinear::new(
                    c.style_dim,
                    c.style_dim,
                    0.,
                    c.lr_mlp,
                    true,
                    vb.pp(format!("style.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let ch4 = c.channels(4);
        let input = vb.get_with_hints(
            (1, ch4, 4, 4),
            "input.input",
            Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;
        let conv1 = StyledConv::new(ch4, ch4, c.style_dim, false, vb.pp("conv1"))?;
        let to_rgb1 = ToRgb::new(ch4, c.style_dim, false, vb.pp("to_rgb1"))?;

        let noises = (0..c.num_layers())
            .map(|layer_idx| {
                let res = 1 << ((layer_idx + 5) / 2);
                vb.get_with_hints(
                    (1, 1, res, res),
                    &format!("noises.noise_{layer_idx}"),
                    Init::Randn {
                        mean: 0.,
                        stdev: 1.,
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut convs = Vec::new();
        let mut to_rgbs = Vec::new();
        let mut in_channel = ch4;
        for i in 3..=c.log_size() {
            let out_channel = c.channels(1 << i);
            let idx = 2 * (i - 3);
            convs.push(StyledConv::new(
                in_channel,
                out_channel,
                c.style_dim,
                true,
                vb.pp(format!("convs.{idx}")),
            )?);
            convs.push(StyledConv::new(
                out_channel,
                out_channel,
                c.style_dim,
                false,
                vb.pp(format!("convs.{}", idx + 1)),
            )?);
            to_rgbs.push(ToRgb::new(
                out_channel,
                c.style_dim,
                true,
                vb.pp(format!("to_rgbs.{}", i - 3)),
            )?);
            in_channel = out_channel;
        }

        Ok(Self {
            config: c.clone(),
            style,
            input,
            conv1,
            to_rgb1,
            convs,
            to_rgbs,
            noises,
        })
    }

    pub fn load_file<P: AsRef<std::path::Path>>(
        weights_path: P,
        config: &Config,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vs = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)?
        };

        StyleGan2::new(vs, config)
    }

    fn latent_at(latents: &Tensor, idx: usize) -> Result<Tensor> {
        latents.narrow(1, idx, 1)?.squeeze(1)?.contiguous()
    }
}

impl Generator for StyleGan2 {
    fn style_dim(&self) -> usize {
        self.config.style_dim
    }

    fn n_latent(&self) -> usize {
        self.config.n_latent()
    }

    fn resolution(&self) -> usize {
        self.config.size
    }

    fn map(&self, z: &Tensor) -> Result<Tensor> {
        let mut xs = pixel_norm(z)?;
        for layer in self.style.iter() {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }

    fn synthesize(&self, latents: &Tensor) -> Result<Tensor> {
        let (b, n_latent, _) = latents.dims3()?;
        if n_latent != self.n_latent() {
            candle_core::bail!(
                "expected {} per-layer latents, got {n_latent}",
                self.n_latent()
            )
        }

        let (_, c, h, w) = self.input.dims4()?;
        let out = self.input.broadcast_as((b, c, h, w))?.contiguous()?;
        let mut out = self
            .conv1
            .forward(&out, &Self::latent_at(latents, 0)?, &self.noises[0])?;
        let mut skip = self
            .to_rgb1
            .forward(&out, &Self::latent_at(latents, 1)?, None)?;

        let mut i = 1;
        for (k, to_rgb) in self.to_rgbs.iter().enumerate() {
            let (conv_up, conv) = (&self.convs[2 * k], &self.convs[2 * k + 1]);
            out = conv_up.forward(&out, &Self::latent_at(latents, i)?, &self.noises[2 * k + 1])?;
            out = conv.forward(&out, &Self::latent_at(latents, i + 1)?, &self.noises[2 * k + 2])?;
            skip = to_rgb.forward(&out, &Self::latent_at(latents, i + 2)?, Some(&skip))?;
            i += 2;
        }

        Ok(skip)
    }
}
