use serde::Deserialize;

use crate::{
    open_base_image, Credentials, Error, Folder, GenerationRequest, ImageToImage,
    ImageToImageOptions, Precision, Result, Task, TextToImage, TextToImageOptions,
    DEFAULT_GUIDANCE_SCALE, DEFAULT_IMAGE_SIZE, DEFAULT_NUM_INFERENCE_STEPS, DEFAULT_STRENGTH,
};

/// Base URL relative model repos are resolved against.
pub const HUGGING_FACE_BASE_URL: &str = "https://huggingface.co";

/// `model_repo` value selecting `custom_model_repo` instead.
pub const CUSTOM_MODEL_REPO: &str = "CUSTOM";

pub const DEFAULT_FILENAME_PREFIX: &str = "image";

/// Integer and float parameters may arrive as JSON numbers or numeric
/// strings.
mod lenient {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Int(u64),
        Float(f64),
        Text(String),
    }

    fn parse_u64<E: serde::de::Error>(number: Number) -> Result<Option<u64>, E> {
        match number {
            Number::Int(value) => Ok(Some(value)),
            Number::Float(value) if value.fract() == 0.0 && value >= 0.0 => Ok(Some(value as u64)),
            Number::Float(value) => Err(E::custom(format!("expected an integer, got {value}"))),
            Number::Text(text) if text.trim().is_empty() => Ok(None),
            Number::Text(text) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| E::custom(format!("expected an integer, got {text:?}"))),
        }
    }

    pub fn usize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
        parse_u64(Number::deserialize(deserializer)?)?
            .map(|value| value as usize)
            .ok_or_else(|| D::Error::custom("expected an integer, got an empty string"))
    }

    pub fn opt_usize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<usize>, D::Error> {
        match Option::<Number>::deserialize(deserializer)? {
            Some(number) => Ok(parse_u64(number)?.map(|value| value as usize)),
            None => Ok(None),
        }
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Option::<Number>::deserialize(deserializer)? {
            Some(number) => parse_u64(number),
            None => Ok(None),
        }
    }

    pub fn f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Number::deserialize(deserializer)? {
            Number::Int(value) => Ok(value as f64),
            Number::Float(value) => Ok(value),
            Number::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("expected a number, got {text:?}"))),
        }
    }
}

fn default_image_count() -> usize {
    1
}

fn default_filename_prefix() -> String {
    DEFAULT_FILENAME_PREFIX.to_string()
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

fn default_num_inference_steps() -> usize {
    DEFAULT_NUM_INFERENCE_STEPS
}

fn default_guidance_scale() -> f64 {
    DEFAULT_GUIDANCE_SCALE
}

fn default_image_size() -> usize {
    DEFAULT_IMAGE_SIZE
}

fn default_strength() -> f64 {
    DEFAULT_STRENGTH
}

/// Flat recipe configuration, as submitted by the hosting platform.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecipeConfig {
    pub prompt: String,
    #[serde(default = "default_image_count", deserialize_with = "lenient::usize")]
    pub image_count: usize,
    #[serde(default, deserialize_with = "lenient::opt_usize")]
    pub batch_size: Option<usize>,
    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub clear_folder: bool,
    #[serde(default = "default_true")]
    pub use_autocast: bool,
    #[serde(default)]
    pub use_half_precision: bool,
    #[serde(default)]
    pub enable_attention_slicing: bool,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub random_seed: Option<u64>,
    #[serde(default = "default_num_inference_steps", deserialize_with = "lenient::usize")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance_scale", deserialize_with = "lenient::f64")]
    pub guidance_scale: f64,

    #[serde(default = "default_image_size", alias = "height", deserialize_with = "lenient::usize")]
    pub image_height: usize,
    #[serde(default = "default_image_size", alias = "width", deserialize_with = "lenient::usize")]
    pub image_width: usize,

    #[serde(default)]
    pub base_image_path: Option<String>,
    #[serde(default = "default_true")]
    pub resize_base_image: bool,
    #[serde(default = "default_strength", deserialize_with = "lenient::f64")]
    pub strength: f64,
}

impl RecipeConfig {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|err| Error::config(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HubCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub access_token: String,
}

impl HubCredentials {
    /// `None` when neither field is set.
    pub fn to_credentials(&self) -> Option<Credentials> {
        if self.username.is_empty() && self.access_token.is_empty() {
            return None;
        }
        Some(Credentials {
            username: self.username.clone(),
            access_token: self.access_token.clone(),
        })
    }
}

fn default_revision() -> String {
    "main".to_string()
}

/// Configuration of the weights download and of the revision choices.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DownloadWeightsConfig {
    pub model_repo: String,
    #[serde(default)]
    pub custom_model_repo: Option<String>,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default)]
    pub hugging_face_credentials: Option<HubCredentials>,
}

impl DownloadWeightsConfig {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|err| Error::config(err.to_string()))
    }

    pub fn model_repo(&self) -> Result<String> {
        resolve_model_repo(&self.model_repo, self.custom_model_repo.as_deref())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.hugging_face_credentials
            .as_ref()
            .and_then(HubCredentials::to_credentials)
    }
}

/// Absolute URL of the model repo. `CUSTOM` selects `custom_model_repo`;
/// relative paths are resolved against the Hugging Face hub.
pub fn resolve_model_repo(model_repo: &str, custom_model_repo: Option<&str>) -> Result<String> {
    let model_repo = if model_repo == CUSTOM_MODEL_REPO {
        match custom_model_repo.map(str::trim) {
            Some(custom) if !custom.is_empty() => custom,
            _ => return Err(Error::config("undefined parameter: Custom model repo")),
        }
    } else {
        model_repo
    };

    if model_repo.contains("://") {
        Ok(model_repo.to_string())
    } else {
        Ok(format!(
            "{HUGGING_FACE_BASE_URL}/{}",
            model_repo.trim_start_matches('/')
        ))
    }
}

/// Parameters shared by every generation recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonParams {
    pub prompt: String,
    pub image_count: usize,
    pub batch_size: Option<usize>,
    pub filename_prefix: String,
    /// `None` auto-selects the device.
    pub device_id: Option<String>,
    pub clear_folder: bool,
    pub use_autocast: bool,
    pub precision: Precision,
    pub enable_attention_slicing: bool,
    pub random_seed: Option<u64>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
}

impl CommonParams {
    fn from_config(config: &RecipeConfig) -> Result<Self> {
        tracing::info!("Recipe config: {config:?}");

        let device_id = match config.device.trim() {
            "" | "auto" => None,
            device => Some(device.to_string()),
        };
        let filename_prefix = if config.filename_prefix.is_empty() {
            default_filename_prefix()
        } else {
            config.filename_prefix.clone()
        };

        Ok(Self {
            prompt: config.prompt.clone(),
            image_count: config.image_count,
            batch_size: config.batch_size.filter(|size| *size > 0),
            filename_prefix,
            device_id,
            clear_folder: config.clear_folder,
            use_autocast: config.use_autocast,
            precision: Precision::from_half(config.use_half_precision),
            enable_attention_slicing: config.enable_attention_slicing,
            random_seed: config.random_seed.filter(|seed| *seed != 0),
            num_inference_steps: config.num_inference_steps,
            guidance_scale: config.guidance_scale,
        })
    }

    pub fn request<O>(&self, options: O) -> GenerationRequest<O> {
        GenerationRequest::new(self.prompt.clone(), options)
            .with_image_count(self.image_count)
            .with_batch_size(self.batch_size)
            .with_autocast(self.use_autocast)
            .with_random_seed(self.random_seed)
            .with_num_inference_steps(self.num_inference_steps)
            .with_guidance_scale(self.guidance_scale)
    }
}

/// Typed recipe parameters for task `T`.
pub trait RecipeParams {
    type Task: Task;

    fn common(&self) -> &CommonParams;

    fn request(&self) -> GenerationRequest<<Self::Task as Task>::Options>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextToImageParams {
    pub common: CommonParams,
    pub options: TextToImageOptions,
}

impl TextToImageParams {
    pub fn from_config(config: &RecipeConfig) -> Result<Self> {
        let params = Self {
            common: CommonParams::from_config(config)?,
            options: TextToImageOptions {
                height: config.image_height,
                width: config.image_width,
            },
        };
        params.request().validate()?;
        TextToImage::validate(&params.options)?;
        Ok(params)
    }
}

impl RecipeParams for TextToImageParams {
    type Task = TextToImage;

    fn common(&self) -> &CommonParams {
        &self.common
    }

    fn request(&self) -> GenerationRequest<TextToImageOptions> {
        self.common.request(self.options)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageToImageParams {
    pub common: CommonParams,
    pub base_image_path: String,
    pub options: ImageToImageOptions,
}

impl ImageToImageParams {
    /// Also opens the base image from `base_image_folder`.
    pub fn from_config(config: &RecipeConfig, base_image_folder: &dyn Folder) -> Result<Self> {
        let common = CommonParams::from_config(config)?;
        common.request(()).validate()?;
        crate::validate_strength(config.strength)?;

        let base_image_path = match config.base_image_path.as_deref() {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => return Err(Error::config("undefined parameter: Base image path")),
        };
        tracing::info!("Base image folder: {:?}", base_image_folder.name());
        tracing::info!("Opening base image: {base_image_path:?}");
        let base_image =
            open_base_image(base_image_folder, &base_image_path, config.resize_base_image)?;

        Ok(Self {
            common,
            base_image_path,
            options: ImageToImageOptions::new(base_image).with_strength(config.strength),
        })
    }
}

impl RecipeParams for ImageToImageParams {
    type Task = ImageToImage;

    fn common(&self) -> &CommonParams {
        &self.common
    }

    fn request(&self) -> GenerationRequest<ImageToImageOptions> {
        self.common.request(self.options.clone())
    }
}
