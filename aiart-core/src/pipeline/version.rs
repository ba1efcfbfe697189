use std::path::Path;

use candle_transformers::models::stable_diffusion::StableDiffusionConfig;

use crate::{Error, Result};

/// Stable Diffusion architectures the candle pipeline knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1_5,
    V2_1,
}

impl SdVersion {
    /// Detect the version from a repo or directory name.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("STABLE-DIFFUSION-2") || name_upper.contains("SD2") {
            Some(SdVersion::V2_1)
        } else if name_upper.contains("STABLE-DIFFUSION-V1") || name_upper.contains("SD1") {
            Some(SdVersion::V1_5)
        } else {
            None
        }
    }

    /// Detect the version of a diffusers-layout weights directory.
    ///
    /// The UNet's `cross_attention_dim` tells the text encoder apart: 768
    /// for v1 models, 1024 for v2 models.
    pub fn detect(weights_path: &Path) -> Result<Self> {
        let config_path = weights_path.join("unet").join("config.json");
        if config_path.is_file() {
            let config: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
            return match config.get("cross_attention_dim").and_then(|dim| dim.as_u64()) {
                Some(1024) => Ok(SdVersion::V2_1),
                Some(768) => Ok(SdVersion::V1_5),
                Some(other) => Err(Error::ModelLoading(format!(
                    "unsupported cross_attention_dim {other} in {}",
                    config_path.display()
                ))),
                None => Err(Error::ModelLoading(format!(
                    "no cross_attention_dim in {}",
                    config_path.display()
                ))),
            };
        }

        let name = weights_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let version = SdVersion::from_name(&name).unwrap_or_else(|| {
            tracing::warn!(
                "{} has no UNet config, assuming Stable Diffusion v1.5",
                weights_path.display()
            );
            SdVersion::V1_5
        });
        Ok(version)
    }

    pub fn config(self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            SdVersion::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            SdVersion::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }

    /// Slice size used when attention slicing is on. It must divide
    /// `batch * heads` for every attention block.
    pub fn attention_slice_size(self) -> usize {
        match self {
            SdVersion::V1_5 => 4,
            SdVersion::V2_1 => 5,
        }
    }

    /// Hub repo holding a `tokenizer.json` compatible with the text encoder.
    pub fn tokenizer_repo(self) -> &'static str {
        match self {
            SdVersion::V1_5 => "openai/clip-vit-base-patch32",
            SdVersion::V2_1 => "openai/clip-vit-large-patch14",
        }
    }
}
