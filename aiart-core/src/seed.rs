use candle_core::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::{ResolvedDevice, Result};

/// Seeded random state shared by every batch of one request.
///
/// The state advances as noise is drawn, so batch `n` sees a different
/// (but reproducible) slice of the random stream than batch `n - 1`.
#[derive(Debug)]
pub struct SeedHandle {
    device: ResolvedDevice,
    seed: u64,
    rng: StdRng,
}

impl SeedHandle {
    pub fn new(device: &ResolvedDevice, seed: u64) -> Self {
        Self {
            device: device.clone(),
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn initial_seed(&self) -> u64 {
        self.seed
    }

    pub fn device(&self) -> &ResolvedDevice {
        &self.device
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Standard-normal f32 noise, sampled on the host and moved to `device`.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let values: Vec<f32> = (0..shape.elem_count())
            .map(|_| -> f32 { StandardNormal.sample(&mut self.rng) })
            .collect();
        let noise = Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?;
        Ok(noise)
    }
}

/// Builds the seed handle for a request.
///
/// `None` and `0` both mean "no fixed seed": the hosting platform sends `0`
/// for an unset integer parameter.
pub fn make_seed_handle(device: &ResolvedDevice, random_seed: Option<u64>) -> Option<SeedHandle> {
    match random_seed {
        None | Some(0) => None,
        Some(seed) => Some(SeedHandle::new(device, seed)),
    }
}

/// Noise from the shared handle when there is one, else from the device RNG.
pub fn randn<S: Into<Shape>>(
    generator: Option<&mut SeedHandle>,
    shape: S,
    device: &Device,
) -> Result<Tensor> {
    match generator {
        Some(generator) => generator.randn(shape, device),
        None => Ok(Tensor::randn(0f32, 1f32, shape, device)?),
    }
}
