use std::fmt;

use image::DynamicImage;

use crate::pipeline::{PipelineOutput, TaskKwargs};
use crate::{Error, Result};

pub const DEFAULT_IMAGE_SIZE: usize = 512;
pub const DEFAULT_NUM_INFERENCE_STEPS: usize = 50;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_STRENGTH: f64 = 0.8;

/// Image dimensions must be multiples of this, a constraint of the
/// Stable Diffusion UNet.
pub const DIMENSION_MULTIPLE: usize = 64;

/// One call to `generate_images`.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest<O> {
    pub prompt: String,
    pub image_count: usize,
    /// `None` generates every image in a single pipeline call.
    pub batch_size: Option<usize>,
    /// Only honored on accelerators.
    pub use_autocast: bool,
    /// `None` lets the pipeline pick its own randomness.
    pub random_seed: Option<u64>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub options: O,
}

impl<O> GenerationRequest<O> {
    pub fn new(prompt: impl Into<String>, options: O) -> Self {
        Self {
            prompt: prompt.into(),
            image_count: 1,
            batch_size: None,
            use_autocast: true,
            random_seed: None,
            num_inference_steps: DEFAULT_NUM_INFERENCE_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            options,
        }
    }

    pub fn with_image_count(mut self, image_count: usize) -> Self {
        self.image_count = image_count;
        self
    }

    pub fn with_batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_autocast(mut self, use_autocast: bool) -> Self {
        self.use_autocast = use_autocast;
        self
    }

    pub fn with_random_seed(mut self, random_seed: Option<u64>) -> Self {
        self.random_seed = random_seed;
        self
    }

    pub fn with_num_inference_steps(mut self, num_inference_steps: usize) -> Self {
        self.num_inference_steps = num_inference_steps;
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    /// Checks the fields shared by every task.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(Error::config("the prompt must not be empty"));
        }
        if self.image_count == 0 {
            return Err(Error::config("image_count must be at least 1"));
        }
        if self.num_inference_steps == 0 {
            return Err(Error::config("num_inference_steps must be at least 1"));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(Error::config(format!(
                "guidance_scale must be a non-negative number, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

/// Capability set of a generation variant: which arguments it forwards to
/// the pipeline and how it reads the pipeline's result back.
pub trait Task {
    type Options: fmt::Debug;

    const NAME: &'static str;

    fn validate(options: &Self::Options) -> Result<()>;

    fn task_kwargs(options: &Self::Options) -> TaskKwargs;

    fn decode_result(output: PipelineOutput) -> Result<Vec<DynamicImage>> {
        output.into_images()
    }
}

/// Generates images from a text prompt.
#[derive(Debug)]
pub struct TextToImage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextToImageOptions {
    pub height: usize,
    pub width: usize,
}

impl Default for TextToImageOptions {
    fn default() -> Self {
        Self {
            height: DEFAULT_IMAGE_SIZE,
            width: DEFAULT_IMAGE_SIZE,
        }
    }
}

pub fn validate_dimension(name: &str, value: usize) -> Result<()> {
    if value == 0 || value % DIMENSION_MULTIPLE != 0 {
        return Err(Error::config(format!(
            "{name} must be a positive multiple of {DIMENSION_MULTIPLE}, got {value}"
        )));
    }
    Ok(())
}

impl Task for TextToImage {
    type Options = TextToImageOptions;

    const NAME: &'static str = "text-to-image";

    fn validate(options: &TextToImageOptions) -> Result<()> {
        validate_dimension("height", options.height)?;
        validate_dimension("width", options.width)
    }

    fn task_kwargs(options: &TextToImageOptions) -> TaskKwargs {
        TaskKwargs::TextToImage {
            height: options.height,
            width: options.width,
        }
    }
}

/// Generates images from a base image, guided by a text prompt.
#[derive(Debug)]
pub struct ImageToImage;

#[derive(Clone, Debug, PartialEq)]
pub struct ImageToImageOptions {
    /// Decoded RGB image the outputs are derived from.
    pub base_image: DynamicImage,
    /// How far the outputs may depart from `base_image`, in [0, 1].
    pub strength: f64,
}

impl ImageToImageOptions {
    pub fn new(base_image: DynamicImage) -> Self {
        Self {
            base_image,
            strength: DEFAULT_STRENGTH,
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }
}

pub fn validate_strength(strength: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&strength) {
        return Err(Error::config(format!(
            "strength must be between 0 and 1, got {strength}"
        )));
    }
    Ok(())
}

impl Task for ImageToImage {
    type Options = ImageToImageOptions;

    const NAME: &'static str = "image-to-image";

    fn validate(options: &ImageToImageOptions) -> Result<()> {
        validate_strength(options.strength)
    }

    fn task_kwargs(options: &ImageToImageOptions) -> TaskKwargs {
        TaskKwargs::ImageToImage {
            base_image: options.base_image.clone(),
            strength: options.strength,
        }
    }
}
