use std::ops::{Deref, DerefMut};

use candle_core::{DType, IndexOp, Tensor};
use image::DynamicImage;

use crate::{tensor_to_image, Result, SeedHandle};

mod stable_diffusion;
mod version;

pub use stable_diffusion::{StableDiffusionLoader, StableDiffusionPipeline};
pub use version::SdVersion;

/// Task-specific arguments forwarded untouched to the model.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskKwargs {
    TextToImage { height: usize, width: usize },
    ImageToImage { base_image: DynamicImage, strength: f64 },
}

/// Arguments of one pipeline invocation, i.e. one batch.
#[derive(Debug)]
pub struct PipelineCall<'a> {
    pub prompt: &'a str,
    pub num_images_per_prompt: usize,
    pub generator: Option<&'a mut SeedHandle>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub task: &'a TaskKwargs,
}

/// Raw pipeline result: a `(n, 3, height, width)` u8 tensor on the host.
#[derive(Debug)]
pub struct PipelineOutput {
    pub images: Tensor,
}

impl PipelineOutput {
    pub fn into_images(self) -> Result<Vec<DynamicImage>> {
        let (count, _, _, _) = self.images.dims4()?;
        (0..count)
            .map(|i| tensor_to_image(&self.images.i(i)?))
            .collect()
    }
}

/// A loaded generative model able to produce `num_images_per_prompt`
/// images per call.
pub trait Pipeline {
    /// Precision the weights were loaded with.
    fn dtype(&self) -> DType;

    fn enable_attention_slicing(&mut self) -> Result<()>;

    /// Switches reduced-precision execution on or off. Use [`Autocast`]
    /// rather than calling this directly.
    fn set_autocast(&mut self, enabled: bool);

    fn run(&mut self, call: PipelineCall<'_>) -> Result<PipelineOutput>;
}

/// Reduced-precision execution scope. Autocast is switched off again when
/// the guard is dropped, including on early return.
pub struct Autocast<'p, P: Pipeline + ?Sized> {
    pipeline: &'p mut P,
}

impl<'p, P: Pipeline + ?Sized> Autocast<'p, P> {
    pub fn enter(pipeline: &'p mut P) -> Self {
        pipeline.set_autocast(true);
        Self { pipeline }
    }
}

impl<P: Pipeline + ?Sized> Deref for Autocast<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.pipeline
    }
}

impl<P: Pipeline + ?Sized> DerefMut for Autocast<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        self.pipeline
    }
}

impl<P: Pipeline + ?Sized> Drop for Autocast<'_, P> {
    fn drop(&mut self) {
        self.pipeline.set_autocast(false);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockPipeline;
    use super::*;

    #[test]
    fn autocast_scope_is_restored_on_drop() {
        let mut pipeline = MockPipeline::new(DType::F32);
        {
            let scoped = Autocast::enter(&mut pipeline);
            assert!(scoped.autocast);
        }
        assert!(!pipeline.autocast);
    }

    #[test]
    fn output_splits_into_images() {
        let images = Tensor::zeros((3, 3, 4, 2), DType::U8, &candle_core::Device::Cpu).unwrap();
        let images = PipelineOutput { images }.into_images().unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!((images[0].width(), images[0].height()), (2, 4));
    }
}
