use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::DeviceMap;

pub const DEFAULT_MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";
pub const DEFAULT_MODEL_ROOT: &str = "/runpod-volume/models";
pub const DEFAULT_HUB_CACHE: &str = "/runpod-volume/hf_cache";

/// How hub-hosted models are transferred.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubStrategy {
    /// Bulk snapshot through the hub API, staged in the hub cache.
    #[default]
    Snapshot,
    /// Shallow `git clone` of the repository.
    Clone,
}

serde_plain::derive_fromstr_from_deserialize!(HubStrategy);
serde_plain::derive_display_from_serialize!(HubStrategy);

#[derive(Clone, Debug)]
pub struct AcquireConfig {
    /// Root under which every model gets its own directory or file.
    pub model_root: PathBuf,
    pub hub_cache: PathBuf,
    pub hub_token: Option<String>,
    pub marketplace_token: Option<String>,
    pub hub_strategy: HubStrategy,
    /// Try the other hub strategy when the configured one gives up.
    pub hub_fallback: bool,
    /// Attempts per backend before giving up on it.
    pub retries: usize,
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    /// Per-request timeout for marketplace transfers.
    pub transfer_timeout: Duration,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            model_root: PathBuf::from(DEFAULT_MODEL_ROOT),
            hub_cache: PathBuf::from(DEFAULT_HUB_CACHE),
            hub_token: None,
            marketplace_token: None,
            hub_strategy: HubStrategy::default(),
            hub_fallback: true,
            retries: 3,
            retry_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub device_map: DeviceMap,
    /// Attention slice size, `None` disables slicing.
    pub attention_slice_size: Option<usize>,
    pub fetch_timeout: Duration,
    /// Hub cache and token for files a model directory lacks.
    pub hub_cache: PathBuf,
    pub hub_token: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_map: DeviceMap::default(),
            attention_slice_size: Some(1),
            fetch_timeout: crate::codec::FETCH_TIMEOUT,
            hub_cache: PathBuf::from(DEFAULT_HUB_CACHE),
            hub_token: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WorkerConfig {
    pub default_model: Option<String>,
    pub acquire: AcquireConfig,
    pub runtime: RuntimeConfig,
}

impl WorkerConfig {
    pub fn default_model(&self) -> &str {
        self.default_model.as_deref().unwrap_or(DEFAULT_MODEL_ID)
    }
}
