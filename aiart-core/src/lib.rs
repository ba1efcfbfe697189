#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

mod base_image;
mod batch;
pub mod device_map;
mod error;
mod folder;
mod generator;
mod git;
pub mod loader;
#[cfg(test)]
mod log_capture;
mod params;
pub mod pipeline;
mod recipe;
mod revisions;
mod seed;
mod task;
mod util;

pub use base_image::*;
pub use batch::BatchPlan;
pub use device_map::*;
pub use error::{Error, Result};
pub use folder::*;
pub use generator::*;
pub use git::*;
pub use loader::*;
pub use params::*;
pub use pipeline::{Autocast, Pipeline, PipelineCall, PipelineOutput, SdVersion, TaskKwargs};
pub use recipe::*;
pub use revisions::*;
pub use seed::{make_seed_handle, SeedHandle};
pub use task::*;
pub use util::*;

/// Where users are sent for installation help.
pub const DOCUMENTATION_URL: &str = "https://www.dataiku.com/product/plugins/ai-art/";
