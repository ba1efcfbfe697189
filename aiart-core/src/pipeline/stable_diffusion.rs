use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::imageops::FilterType;
use tokenizers::Tokenizer;

use super::{Pipeline, PipelineCall, PipelineOutput, SdVersion, TaskKwargs};
use crate::seed::randn;
use crate::{image_to_tensor, Error, Loader, ResolvedDevice, Result, DIMENSION_MULTIPLE};

const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;

/// Diffusers-layout component of a weights directory.
#[derive(Debug, Clone, Copy)]
enum Component {
    TextEncoder,
    Unet,
    Vae,
}

impl Component {
    fn dir(self) -> &'static str {
        match self {
            Component::TextEncoder => "text_encoder",
            Component::Unet => "unet",
            Component::Vae => "vae",
        }
    }

    fn stem(self) -> &'static str {
        match self {
            Component::TextEncoder => "model",
            Component::Unet | Component::Vae => "diffusion_pytorch_model",
        }
    }

    /// Safetensors file for this component, preferring the fp16 export
    /// when loading at half precision.
    fn weights(self, weights_path: &Path, dtype: DType) -> Result<PathBuf> {
        let dir = weights_path.join(self.dir());
        let full = dir.join(format!("{}.safetensors", self.stem()));
        let half = dir.join(format!("{}.fp16.safetensors", self.stem()));
        let candidates = if dtype == DType::F16 {
            [half, full]
        } else {
            [full, half]
        };
        candidates
            .into_iter()
            .find(|path| path.is_file())
            .ok_or_else(|| {
                Error::ModelLoading(format!(
                    "no {} safetensors weights found in {}",
                    self.dir(),
                    dir.display()
                ))
            })
    }
}

fn loading(what: &'static str) -> impl FnOnce(candle_core::Error) -> Error {
    move |err| Error::ModelLoading(format!("failed to build the {what}: {err}"))
}

fn load_tokenizer(weights_path: &Path, version: SdVersion) -> Result<Tokenizer> {
    let local = weights_path.join("tokenizer").join("tokenizer.json");
    let tokenizer_file = if local.is_file() {
        local
    } else {
        // diffusers exports ship the vocab/merges pair, not tokenizer.json
        let repo = version.tokenizer_repo();
        tracing::info!("Fetching tokenizer from {repo}");
        hf_hub::api::sync::Api::new()
            .and_then(|api| api.model(repo.to_string()).get("tokenizer.json"))
            .map_err(|err| {
                Error::HfHub(format!("failed to fetch the tokenizer from {repo}: {err}"))
            })?
    };
    Tokenizer::from_file(&tokenizer_file).map_err(|err| {
        Error::Tokenization(format!(
            "failed to load tokenizer {}: {err}",
            tokenizer_file.display()
        ))
    })
}

/// Stable Diffusion v1.5 / v2.1 built on candle-transformers.
pub struct StableDiffusionPipeline {
    version: SdVersion,
    weights_path: PathBuf,
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    /// F16 copy of the UNet, built the first time autocast is used on a
    /// pipeline loaded at full precision.
    autocast_unet: Option<UNet2DConditionModel>,
    autocast: bool,
    sliced_attention_size: Option<usize>,
}

impl StableDiffusionPipeline {
    pub fn version(&self) -> SdVersion {
        self.version
    }

    fn build_unet(&self, dtype: DType) -> Result<UNet2DConditionModel> {
        let unet_weights = Component::Unet.weights(&self.weights_path, dtype)?;
        self.config
            .build_unet(
                unet_weights,
                &self.device,
                LATENT_CHANNELS,
                cfg!(feature = "flash-attn"),
                dtype,
            )
            .map_err(loading("UNet"))
    }

    fn uses_autocast_unet(&self) -> bool {
        self.autocast && self.dtype == DType::F32 && !self.device.is_cpu()
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|err| Error::Tokenization(err.to_string()))?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            tracing::warn!(
                "The prompt is too long ({} tokens), truncating it to {max_len} tokens",
                tokens.len()
            );
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    /// Text embeddings for `n` images, unconditional half first when
    /// classifier-free guidance is on.
    fn text_embeddings(&self, prompt: &str, n: usize, use_guidance: bool) -> Result<Tensor> {
        let cond = self.encode_prompt(prompt)?.repeat((n, 1, 1))?;
        let embeddings = if use_guidance {
            let uncond = self.encode_prompt("")?.repeat((n, 1, 1))?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }

    fn preprocess(&self, image: &image::DynamicImage) -> Result<Tensor> {
        let multiple = DIMENSION_MULTIPLE as u32;
        let width = (image.width() - image.width() % multiple).max(multiple);
        let height = (image.height() - image.height() % multiple).max(multiple);
        let image = if (width, height) == (image.width(), image.height()) {
            image.clone()
        } else {
            image.resize_to_fill(width, height, FilterType::CatmullRom)
        };
        Ok(image_to_tensor(&image, &self.device)?.to_dtype(self.dtype)?)
    }

    fn predict_noise(
        &self,
        latents: &Tensor,
        timestep: usize,
        embeddings: &Tensor,
    ) -> Result<Tensor> {
        match &self.autocast_unet {
            Some(unet) if self.uses_autocast_unet() => {
                let noise = unet.forward(
                    &latents.to_dtype(DType::F16)?,
                    timestep as f64,
                    &embeddings.to_dtype(DType::F16)?,
                )?;
                Ok(noise.to_dtype(self.dtype)?)
            }
            _ => Ok(self.unet.forward(latents, timestep as f64, embeddings)?),
        }
    }
}

impl Pipeline for StableDiffusionPipeline {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn enable_attention_slicing(&mut self) -> Result<()> {
        let slice_size = self.version.attention_slice_size();
        self.config = self.version.config(Some(slice_size));
        self.unet = self.build_unet(self.dtype)?;
        self.autocast_unet = None;
        self.sliced_attention_size = Some(slice_size);
        Ok(())
    }

    fn set_autocast(&mut self, enabled: bool) {
        self.autocast = enabled;
    }

    fn run(&mut self, call: PipelineCall<'_>) -> Result<PipelineOutput> {
        if self.uses_autocast_unet() && self.autocast_unet.is_none() {
            tracing::debug!("Building the half precision UNet");
            self.autocast_unet = Some(self.build_unet(DType::F16)?);
        }

        let n = call.num_images_per_prompt;
        let use_guidance = call.guidance_scale > 1.0;
        let embeddings = self.text_embeddings(call.prompt, n, use_guidance)?;

        let mut scheduler = self.config.build_scheduler(call.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let mut generator = call.generator;

        let (mut latents, t_start) = match call.task {
            TaskKwargs::TextToImage { height, width } => {
                let shape = (n, LATENT_CHANNELS, height / 8, width / 8);
                let noise = randn(generator.as_deref_mut(), shape, &self.device)?;
                ((noise * scheduler.init_noise_sigma())?, 0)
            }
            TaskKwargs::ImageToImage { base_image, strength } => {
                let image = self.preprocess(base_image)?;
                let latents = (self.vae.encode(&image)?.sample()? * VAE_SCALE)?;
                let latents = latents.repeat((n, 1, 1, 1))?;
                let steps = timesteps.len();
                let t_start = steps - ((steps as f64 * strength) as usize).min(steps);
                let latents = if t_start < steps {
                    let noise = randn(generator.as_deref_mut(), latents.dims(), &self.device)?
                        .to_dtype(latents.dtype())?;
                    scheduler.add_noise(&latents, noise, timesteps[t_start])?
                } else {
                    latents
                };
                (latents, t_start)
            }
        };
        latents = latents.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self.predict_noise(&model_input, timestep, &embeddings)?;

            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * call.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!("step {}/{} done", index + 1, timesteps.len());
        }

        let images = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let images = ((images / 2.)? + 0.5)?
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .clamp(0f32, 1.)?;
        let images = (images * 255.)?.to_dtype(DType::U8)?;
        Ok(PipelineOutput { images })
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Pipeline = StableDiffusionPipeline;

    fn load(
        weights_path: &Path,
        device: &ResolvedDevice,
        dtype: DType,
    ) -> Result<StableDiffusionPipeline> {
        if !weights_path.is_dir() {
            return Err(Error::ModelLoading(format!(
                "weights directory {} does not exist",
                weights_path.display()
            )));
        }
        let version = SdVersion::detect(weights_path)?;
        tracing::info!("Detected Stable Diffusion {version:?} weights");

        let device_handle = device.open().map_err(|err| {
            Error::ModelLoading(format!("failed to open device {}: {err}", device.id()))
        })?;
        let config = version.config(None);

        let tokenizer = load_tokenizer(weights_path, version)?;
        let pad_token = config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer.token_to_id(pad_token).ok_or_else(|| {
            Error::Tokenization(format!("padding token {pad_token} is not in the vocabulary"))
        })?;

        // the text encoder always runs at f32
        let clip_weights = Component::TextEncoder.weights(weights_path, dtype)?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[clip_weights],
                DType::F32,
                &device_handle,
            )
            .map_err(loading("text encoder var builder"))?
        };
        let text_model =
            ClipTextTransformer::new(clip_vb, &config.clip).map_err(loading("text encoder"))?;

        let vae_weights = Component::Vae.weights(weights_path, dtype)?;
        let vae = config
            .build_vae(vae_weights, &device_handle, dtype)
            .map_err(loading("autoencoder"))?;

        let unet_weights = Component::Unet.weights(weights_path, dtype)?;
        let unet = config
            .build_unet(
                unet_weights,
                &device_handle,
                LATENT_CHANNELS,
                cfg!(feature = "flash-attn"),
                dtype,
            )
            .map_err(loading("UNet"))?;

        Ok(StableDiffusionPipeline {
            version,
            weights_path: weights_path.to_path_buf(),
            device: device_handle,
            dtype,
            config,
            tokenizer,
            pad_id,
            text_model,
            unet,
            vae,
            autocast_unet: None,
            autocast: false,
            sliced_attention_size: None,
        })
    }
}

impl std::fmt::Debug for StableDiffusionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableDiffusionPipeline")
            .field("version", &self.version)
            .field("weights_path", &self.weights_path)
            .field("dtype", &self.dtype)
            .field("autocast", &self.autocast)
            .field("sliced_attention_size", &self.sliced_attention_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn prefers_fp16_weights_at_half_precision() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("unet/diffusion_pytorch_model.safetensors");
        let half = dir.path().join("unet/diffusion_pytorch_model.fp16.safetensors");
        touch(&full);
        touch(&half);

        assert_eq!(Component::Unet.weights(dir.path(), DType::F16).unwrap(), half);
        assert_eq!(Component::Unet.weights(dir.path(), DType::F32).unwrap(), full);
    }

    #[test]
    fn falls_back_to_whichever_export_exists() {
        let dir = tempfile::tempdir().unwrap();
        let half = dir.path().join("text_encoder/model.fp16.safetensors");
        touch(&half);
        assert_eq!(Component::TextEncoder.weights(dir.path(), DType::F32).unwrap(), half);
    }

    #[test]
    fn missing_weights_are_a_loading_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Component::Vae.weights(dir.path(), DType::F32).unwrap_err();
        assert!(matches!(err, Error::ModelLoading(_)));
    }

    #[test]
    fn loading_a_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = StableDiffusionLoader::load(
            &dir.path().join("missing"),
            &ResolvedDevice::cpu(),
            DType::F32,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ModelLoading(_)));
    }

    #[test]
    fn unreadable_tokenizer_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tokenizer")).unwrap();
        // unreadable tokenizer: the error must surface before any model is built
        std::fs::write(dir.path().join("tokenizer/tokenizer.json"), b"{}").unwrap();
        let err = StableDiffusionLoader::load(dir.path(), &ResolvedDevice::cpu(), DType::F32).unwrap_err();
        assert!(matches!(err, Error::Tokenization(_)));
    }
}
