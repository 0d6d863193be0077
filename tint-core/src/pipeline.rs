//! The pretrained pipeline seam and the lazily-loading runtime around it.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::Result;
use image::DynamicImage;
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::{codec, config::RuntimeConfig, TintError, TintResult};

/// Scalar parameters of one image-to-image call, passed through unvalidated.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub guidance_scale: f64,
    pub strength: f64,
    pub num_inference_steps: usize,
    pub seed: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransformMetadata {
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: usize,
    pub strength: f64,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct TransformOutput {
    pub images: Vec<DynamicImage>,
    pub metadata: TransformMetadata,
}

/// A loaded pretrained image-to-image pipeline.
pub trait Img2ImgPipeline: Send + Sync {
    fn run(&self, image: &DynamicImage, request: &TransformRequest) -> Result<TransformOutput>;
}

/// Builds a pipeline from files on disk.
pub trait PipelineLoader: Send + Sync {
    fn load(
        &self,
        model_id: &str,
        model_path: &Path,
        config: &RuntimeConfig,
    ) -> Result<Box<dyn Img2ImgPipeline>>;
}

/// Image argument of [`ModelRuntime::transform`].
#[derive(Clone, Debug)]
pub enum ImageArg {
    Image(DynamicImage),
    Path(PathBuf),
    Url(String),
}

impl From<DynamicImage> for ImageArg {
    fn from(img: DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl TryFrom<&Value> for ImageArg {
    type Error = TintError;

    /// Strings are URLs when they carry an `http(s)://` scheme and paths
    /// otherwise; any other JSON type is rejected.
    fn try_from(value: &Value) -> TintResult<Self> {
        match value {
            Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => {
                Ok(Self::Url(s.clone()))
            }
            Value::String(s) => Ok(Self::Path(PathBuf::from(s))),
            other => Err(TintError::InvalidImageArgument(format!(
                "image must be an image, a path or a URL, got {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
    Unloaded,
    Loading,
    Ready,
}

/// One model identifier bound to a lazily loaded pipeline.
///
/// The first `transform` loads the pipeline; concurrent first callers wait
/// for that single load. A failed load leaves the runtime unloaded.
pub struct ModelRuntime {
    model_id: String,
    model_path: PathBuf,
    loader: Arc<dyn PipelineLoader>,
    config: RuntimeConfig,
    pipeline: OnceCell<Box<dyn Img2ImgPipeline>>,
    loading: AtomicBool,
    http: OnceCell<reqwest::blocking::Client>,
}

impl ModelRuntime {
    pub fn new(
        model_id: impl Into<String>,
        model_path: impl Into<PathBuf>,
        loader: Arc<dyn PipelineLoader>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            model_path: model_path.into(),
            loader,
            config,
            pipeline: OnceCell::new(),
            loading: AtomicBool::new(false),
            http: OnceCell::new(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn state(&self) -> RuntimeState {
        if self.pipeline.get().is_some() {
            RuntimeState::Ready
        } else if self.loading.load(Ordering::Acquire) {
            RuntimeState::Loading
        } else {
            RuntimeState::Unloaded
        }
    }

    /// Returns the loaded pipeline, loading it on first use.
    pub fn pipeline(&self) -> Result<&dyn Img2ImgPipeline> {
        let pipeline = self.pipeline.get_or_try_init(|| {
            self.loading.store(true, Ordering::Release);
            info!("Loading model {} from {:?}", self.model_id, self.model_path);
            let start = Instant::now();
            let loaded = self
                .loader
                .load(&self.model_id, &self.model_path, &self.config);
            self.loading.store(false, Ordering::Release);
            if loaded.is_ok() {
                info!(
                    "Model {} loaded in {:.1}s",
                    self.model_id,
                    start.elapsed().as_secs_f64()
                );
            }
            loaded
        })?;
        Ok(&**pipeline)
    }

    /// Transforms `image` toward the prompt in `request`.
    ///
    /// Path and URL arguments are loaded before the pipeline is touched.
    pub fn transform(
        &self,
        image: ImageArg,
        request: &TransformRequest,
    ) -> TintResult<TransformOutput> {
        let image = self.resolve_image(image)?;
        let pipeline = self.pipeline().map_err(|e| {
            TintError::Inference(format!("failed to load model {}: {e:#}", self.model_id))
        })?;
        pipeline
            .run(&image, request)
            .map_err(|e| TintError::Inference(format!("{e:#}")))
    }

    fn resolve_image(&self, image: ImageArg) -> TintResult<DynamicImage> {
        match image {
            ImageArg::Image(img) => Ok(img),
            ImageArg::Path(path) => {
                codec::load_image(&path).map_err(|e| TintError::ImageDecode(format!("{e:#}")))
            }
            ImageArg::Url(url) => {
                let client = self
                    .http
                    .get_or_try_init(|| codec::http_client(self.config.fetch_timeout))
                    .map_err(|e| TintError::ImageFetch(format!("{e:#}")))?;
                codec::fetch_image(client, &url)
                    .ok_or_else(|| TintError::ImageFetch(url.clone()))
            }
        }
    }
}
