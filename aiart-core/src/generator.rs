use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::path::Path;

use image::DynamicImage;

use crate::pipeline::{
    Autocast, Pipeline, PipelineCall, StableDiffusionLoader, StableDiffusionPipeline, TaskKwargs,
};
use crate::{
    load_pipeline, make_seed_handle, resolve, BatchPlan, GenerationRequest, ImageToImage, Loader,
    Precision, ResolvedDevice, Result, SeedHandle, Task, TextToImage,
};

/// Owns a loaded pipeline and the device it was resolved to, and turns
/// requests of task `T` into batched pipeline calls.
pub struct ImageGenerator<T: Task, P: Pipeline = StableDiffusionPipeline> {
    pipeline: P,
    device: ResolvedDevice,
    _task: PhantomData<T>,
}

pub type TextToImageGenerator<P = StableDiffusionPipeline> = ImageGenerator<TextToImage, P>;
pub type ImageToImageGenerator<P = StableDiffusionPipeline> = ImageGenerator<ImageToImage, P>;

impl<T: Task> ImageGenerator<T, StableDiffusionPipeline> {
    /// Loads Stable Diffusion weights from a local directory.
    ///
    /// `device_id` of `None` auto-selects the device.
    pub fn from_pretrained(
        weights_path: impl AsRef<Path>,
        device_id: Option<&str>,
        precision: Precision,
        enable_attention_slicing: bool,
    ) -> Result<Self> {
        Self::load::<StableDiffusionLoader>(
            weights_path.as_ref(),
            device_id,
            precision,
            enable_attention_slicing,
        )
    }
}

impl<T: Task, P: Pipeline> ImageGenerator<T, P> {
    pub fn new(pipeline: P, device: ResolvedDevice) -> Self {
        Self {
            pipeline,
            device,
            _task: PhantomData,
        }
    }

    pub fn load<L: Loader<Pipeline = P>>(
        weights_path: &Path,
        device_id: Option<&str>,
        precision: Precision,
        enable_attention_slicing: bool,
    ) -> Result<Self> {
        let device = resolve(device_id);
        let pipeline =
            load_pipeline::<L>(weights_path, &device, precision, enable_attention_slicing)?;
        Ok(Self::new(pipeline, device))
    }

    pub fn device(&self) -> &ResolvedDevice {
        &self.device
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// Validates the request and returns a lazy stream of its images.
    ///
    /// Nothing runs until the stream is pulled. Batches run one after the
    /// other; a failed batch ends the stream.
    pub fn generate_images(
        &mut self,
        request: &GenerationRequest<T::Options>,
    ) -> Result<ImageStream<'_, T, P>> {
        request.validate()?;
        T::validate(&request.options)?;

        let plan = BatchPlan::new(request.image_count, request.batch_size);
        tracing::info!(
            "Will generate {} total images in {} batches ({})",
            request.image_count,
            plan.batch_count(),
            T::NAME
        );

        let autocast = request.use_autocast && self.device.is_accelerator();
        if autocast {
            tracing::info!("autocast is enabled");
        } else {
            tracing::info!("autocast is disabled");
        }

        let generator = make_seed_handle(&self.device, request.random_seed);
        Ok(ImageStream {
            pipeline: &mut self.pipeline,
            autocast,
            prompt: request.prompt.clone(),
            num_inference_steps: request.num_inference_steps,
            guidance_scale: request.guidance_scale,
            task: T::task_kwargs(&request.options),
            generator,
            plan,
            batch_index: 0,
            pending: VecDeque::new(),
            finished: false,
            _task: PhantomData,
        })
    }
}

/// Single-pass stream of generated images, in batch order then pipeline
/// order. Yields at most one error, after which it is exhausted.
pub struct ImageStream<'g, T: Task, P: Pipeline> {
    pipeline: &'g mut P,
    autocast: bool,
    prompt: String,
    num_inference_steps: usize,
    guidance_scale: f64,
    task: TaskKwargs,
    generator: Option<SeedHandle>,
    plan: BatchPlan,
    batch_index: usize,
    pending: VecDeque<DynamicImage>,
    finished: bool,
    _task: PhantomData<T>,
}

impl<T: Task, P: Pipeline> ImageStream<'_, T, P> {
    pub fn batch_count(&self) -> usize {
        self.plan.batch_count()
    }

    fn run_batch(&mut self, batch_size: usize) -> Result<Vec<DynamicImage>> {
        let call = PipelineCall {
            prompt: &self.prompt,
            num_images_per_prompt: batch_size,
            generator: self.generator.as_mut(),
            num_inference_steps: self.num_inference_steps,
            guidance_scale: self.guidance_scale,
            task: &self.task,
        };
        let output = if self.autocast {
            let mut pipeline = Autocast::enter(&mut *self.pipeline);
            pipeline.run(call)?
        } else {
            self.pipeline.run(call)?
        };
        T::decode_result(output)
    }
}

impl<T: Task, P: Pipeline> Iterator for ImageStream<'_, T, P> {
    type Item = Result<DynamicImage>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(image) = self.pending.pop_front() {
                return Some(Ok(image));
            }
            if self.finished {
                return None;
            }
            let Some(batch_size) = self.plan.size(self.batch_index) else {
                self.finished = true;
                return None;
            };
            self.batch_index += 1;
            tracing::info!(
                "Generating batch {}/{} ({} images)",
                self.batch_index,
                self.plan.batch_count(),
                batch_size
            );
            match self.run_batch(batch_size) {
                Ok(images) => self.pending.extend(images),
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl<T: Task, P: Pipeline> FusedIterator for ImageStream<'_, T, P> {}
