//! Per-job orchestration: validate, acquire, load, transform, encode.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use anyhow::Result;
use image::DynamicImage;
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::{
    codec, config::WorkerConfig, Acquirer, DiffusersLoader, ImageArg, ImageInput, JobInput,
    ModelCache, ModelRuntime, PipelineLoader, TintError, TintResult, TransformRequest,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Message(String),
    List(Vec<String>),
}

/// What a job returns to the queue.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobOutput {
    Success {
        image: String,
        prompt: String,
        processing_time: f64,
    },
    Failure {
        error: ErrorPayload,
    },
}

impl JobOutput {
    pub fn is_error(&self) -> bool {
        matches!(self, JobOutput::Failure { .. })
    }
}

impl From<TintError> for JobOutput {
    fn from(err: TintError) -> Self {
        let error = match err {
            TintError::Validation(errors) => ErrorPayload::List(errors),
            other => ErrorPayload::Message(other.to_string()),
        };
        JobOutput::Failure { error }
    }
}

pub struct JobHandler {
    config: WorkerConfig,
    acquirer: Acquirer,
    loader: Arc<dyn PipelineLoader>,
    cache: ModelCache,
    http: OnceCell<reqwest::blocking::Client>,
}

impl JobHandler {
    /// Handler with the configured download backends and the diffusers loader.
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let acquirer = Acquirer::from_config(&config.acquire)?;
        Ok(Self::with_parts(config, acquirer, Arc::new(DiffusersLoader)))
    }

    pub fn with_parts(
        config: WorkerConfig,
        acquirer: Acquirer,
        loader: Arc<dyn PipelineLoader>,
    ) -> Self {
        Self {
            config,
            acquirer,
            loader,
            cache: ModelCache::new(),
            http: OnceCell::new(),
        }
    }

    pub fn resident_model(&self) -> Option<String> {
        self.cache.resident()
    }

    /// Acquires and loads the default model ahead of the first job.
    pub fn preload(&self) -> TintResult<()> {
        let runtime = self.runtime(self.config.default_model())?;
        runtime.pipeline().map_err(|e| {
            TintError::Inference(format!("failed to load model {}: {e:#}", runtime.model_id()))
        })?;
        Ok(())
    }

    /// Runs one job. Never panics and never returns an error: every failure
    /// becomes an `{error}` output.
    pub fn handle(&self, input: &Value) -> JobOutput {
        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run(input, start)));
        match result {
            Ok(Ok(output)) => {
                info!("Job finished in {:.2}s", start.elapsed().as_secs_f64());
                output
            }
            Ok(Err(e)) => {
                error!("Error processing request: {e}");
                e.into()
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Job panicked: {message}");
                TintError::Inference(message).into()
            }
        }
    }

    fn run(&self, input: &Value, start: Instant) -> TintResult<JobOutput> {
        let input = JobInput::parse(input)?;

        let model_id = input
            .model_id
            .as_deref()
            .unwrap_or(self.config.default_model());
        let runtime = self.runtime(model_id)?;

        let image = self.resolve_image(&input.image)?;
        let request = TransformRequest {
            prompt: input.prompt.clone(),
            negative_prompt: input.negative_prompt.clone(),
            guidance_scale: input.guidance_scale,
            strength: input.strength,
            num_inference_steps: input.num_inference_steps,
            seed: input.seed,
        };
        let output = runtime.transform(ImageArg::Image(image), &request)?;

        let result = output
            .images
            .first()
            .ok_or_else(|| TintError::Inference("pipeline returned no images".into()))?;
        let image = codec::encode_base64_image(result)
            .map_err(|e| TintError::Inference(format!("{e:#}")))?;

        Ok(JobOutput::Success {
            image,
            prompt: input.prompt,
            processing_time: start.elapsed().as_secs_f64(),
        })
    }

    /// Returns the resident runtime for `model_id`, acquiring the model first
    /// when it is not the resident one.
    fn runtime(&self, model_id: &str) -> TintResult<Arc<ModelRuntime>> {
        self.cache
            .get_or_insert_with(model_id, || {
                let path = self.acquirer.acquire(model_id)?;
                Ok(ModelRuntime::new(
                    model_id,
                    path,
                    self.loader.clone(),
                    self.config.runtime.clone(),
                ))
            })
            .map_err(|e| TintError::acquisition(model_id, &e))
    }

    fn resolve_image(&self, image: &ImageInput) -> TintResult<DynamicImage> {
        match image {
            ImageInput::Url(url) => {
                let client = self
                    .http
                    .get_or_try_init(|| codec::http_client(self.config.runtime.fetch_timeout))
                    .map_err(|e| TintError::ImageFetch(format!("{e:#}")))?;
                codec::fetch_image(client, url).ok_or_else(|| TintError::ImageFetch(url.clone()))
            }
            ImageInput::Base64(encoded) => codec::decode_base64_image(encoded),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("pipeline panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("pipeline panicked: {message}")
    } else {
        "pipeline panicked".to_string()
    }
}
