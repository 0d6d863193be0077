use std::{fs, path::Path};

use serde::Deserialize;
use tracing::debug;

/// Supported Stable Diffusion generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    V1_5,
    V2_1,
}

#[derive(Deserialize)]
struct UnetConfig {
    cross_attention_dim: Option<usize>,
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("2-1") || name_upper.contains("2.1") || name_upper.contains("V2") {
            Some(ModelVariant::V2_1)
        } else if name_upper.contains("1-5") || name_upper.contains("1.5") {
            Some(ModelVariant::V1_5)
        } else {
            None
        }
    }

    /// Detect model variant from the text conditioning width in `unet/config.json`.
    pub fn from_model_dir(model_dir: &Path) -> Option<Self> {
        let raw = fs::read_to_string(model_dir.join("unet").join("config.json")).ok()?;
        let config: UnetConfig = serde_json::from_str(&raw).ok()?;
        match config.cross_attention_dim? {
            768 => Some(ModelVariant::V1_5),
            1024 => Some(ModelVariant::V2_1),
            other => {
                debug!("unrecognized cross_attention_dim {other} in {model_dir:?}");
                None
            }
        }
    }

    /// The directory wins over the name; v1.5 when neither says.
    pub fn detect(model_id: &str, model_dir: &Path) -> Self {
        Self::from_model_dir(model_dir)
            .or_else(|| Self::from_name(model_id))
            .unwrap_or(ModelVariant::V1_5)
    }
}
