use std::path::Path;

use candle_core::DType;

use crate::{Pipeline, ResolvedDevice, Result};

/// Numeric precision requested for the model weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    /// The model's default precision (f32).
    #[default]
    Default,
    Half,
}

impl Precision {
    pub fn from_half(use_half_precision: bool) -> Self {
        if use_half_precision {
            Self::Half
        } else {
            Self::Default
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            Self::Default => DType::F32,
            Self::Half => DType::F16,
        }
    }
}

pub trait Loader {
    type Pipeline: Pipeline;

    /// Loads the weights found under `weights_path` onto `device`.
    fn load(weights_path: &Path, device: &ResolvedDevice, dtype: DType) -> Result<Self::Pipeline>
    where
        Self: Sized;
}

/// Precision that will actually be used on `device`. Half precision is
/// not supported on the CPU and falls back to the default.
pub fn effective_precision(device: &ResolvedDevice, precision: Precision) -> Precision {
    if precision == Precision::Half && !device.is_accelerator() {
        tracing::warn!(
            "Half precision isn't supported when running on the CPU. Using full precision instead"
        );
        Precision::Default
    } else {
        precision
    }
}

/// Loads a pipeline and applies the one-time options.
///
/// Load failures are returned as-is; the caller has no usable generator
/// afterwards.
pub fn load_pipeline<L: Loader>(
    weights_path: &Path,
    device: &ResolvedDevice,
    precision: Precision,
    enable_attention_slicing: bool,
) -> Result<L::Pipeline> {
    let precision = effective_precision(device, precision);

    tracing::info!("Loading weights from {}", weights_path.display());
    let mut pipeline = L::load(weights_path, device, precision.dtype())?;

    if enable_attention_slicing {
        tracing::info!("Enabling attention slicing");
        pipeline.enable_attention_slicing()?;
    }
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_capture::count_warnings;
    use crate::pipeline::testing::MockLoader;

    #[test]
    fn half_precision_is_downgraded_on_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, warnings) = count_warnings(|| {
            load_pipeline::<MockLoader>(dir.path(), &ResolvedDevice::cpu(), Precision::Half, false)
        });
        assert_eq!(pipeline.unwrap().dtype(), DType::F32);
        assert_eq!(warnings, 1);
    }

    #[test]
    fn supported_precision_logs_no_warning() {
        let dir = tempfile::tempdir().unwrap();
        let device = ResolvedDevice::fake_accelerator();
        let (pipeline, warnings) = count_warnings(|| {
            load_pipeline::<MockLoader>(dir.path(), &device, Precision::Half, false)
        });
        assert!(pipeline.is_ok());
        assert_eq!(warnings, 0);
    }

    #[test]
    fn half_precision_is_kept_on_accelerator() {
        let dir = tempfile::tempdir().unwrap();
        let device = ResolvedDevice::fake_accelerator();
        let pipeline =
            load_pipeline::<MockLoader>(dir.path(), &device, Precision::Half, false).unwrap();
        assert_eq!(pipeline.dtype(), DType::F16);
    }

    #[test]
    fn default_precision_is_untouched() {
        assert_eq!(
            effective_precision(&ResolvedDevice::cpu(), Precision::Default),
            Precision::Default
        );
    }

    #[test]
    fn attention_slicing_enabled_once_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline =
            load_pipeline::<MockLoader>(dir.path(), &ResolvedDevice::cpu(), Precision::Default, true)
                .unwrap();
        assert!(pipeline.attention_slicing);
        assert!(pipeline.calls.is_empty());
    }

    #[test]
    fn load_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = load_pipeline::<MockLoader>(&missing, &ResolvedDevice::cpu(), Precision::Default, false)
            .unwrap_err();
        assert!(matches!(err, crate::Error::ModelLoading(_)));
    }
}
