use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::{
    config::RuntimeConfig,
    stable_diffusion::{check_model_layout, StableDiffusionModel},
    Img2ImgPipeline, ModelVariant, PipelineLoader,
};

/// Loads diffusers-layout Stable Diffusion directories.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiffusersLoader;

impl PipelineLoader for DiffusersLoader {
    fn load(
        &self,
        model_id: &str,
        model_path: &Path,
        config: &RuntimeConfig,
    ) -> Result<Box<dyn Img2ImgPipeline>> {
        check_model_layout(model_path)?;
        let variant = ModelVariant::detect(model_id, model_path);
        info!("Loading model: {model_id} (detected variant: {variant:?})");

        let model = StableDiffusionModel::load(variant, model_path, config)?;
        Ok(Box::new(model))
    }
}
