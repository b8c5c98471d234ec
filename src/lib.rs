pub mod artifacts;
pub mod config;
pub mod error;
pub mod latent;
pub mod loss;
pub mod model;
pub mod optim;
pub mod schedule;
pub mod search;
pub mod target;

pub use error::{FindDirsError, Result};

pub fn parse_device(device: Option<String>) -> candle_core::Result<candle_core::Device> {
    match device.as_deref() {
        Some("cpu") => Ok(candle_core::Device::Cpu),
        Some("cuda") => candle_core::Device::cuda_if_available(0),
        Some(ordinal) => match ordinal.parse::<usize>() {
            Ok(ordinal) => candle_core::Device::cuda_if_available(ordinal),
            Err(_) => candle_core::bail!("unknown device {ordinal}, expected cpu, cuda or an ordinal"),
        },
        None => candle_core::Device::cuda_if_available(0),
    }
}

/// Seeds the backend RNG where it supports seeding. Latent sampling uses its
/// own seeded RNG, so this only matters for backend-side randomness.
pub fn set_seed(seed: u64, device: &candle_core::Device) -> candle_core::Result<()> {
    match device {
        candle_core::Device::Cpu => {
            tracing::info!("Device: CPU, seed {seed}");
        }
        candle_core::Device::Cuda(_) => {
            device.set_seed(seed)?;
            tracing::info!("Device: CUDA, seed {seed}");
        }
        _ => {
            device.set_seed(seed)?;
            tracing::info!("Device: {device:?}, seed {seed}");
        }
    };

    Ok(())
}
