use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    acquire::hub_api,
    config::RuntimeConfig, image_to_tensor, inference_dtype, select_best_device, tensor_to_image,
    Img2ImgPipeline, ModelVariant, TransformMetadata, TransformOutput, TransformRequest,
};

/// Latent scaling factor of the SD 1.x/2.x autoencoder.
const VAE_SCALE: f64 = 0.18215;

/// Where the CLIP tokenizer comes from when the model directory lacks one.
const FALLBACK_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Size used to build the configuration the weights are loaded with.
const LOAD_SIZE: usize = 512;

impl ModelVariant {
    fn sd_config(
        self,
        sliced_attention_size: Option<usize>,
        height: usize,
        width: usize,
    ) -> StableDiffusionConfig {
        match self {
            ModelVariant::V1_5 => {
                StableDiffusionConfig::v1_5(sliced_attention_size, Some(height), Some(width))
            }
            ModelVariant::V2_1 => {
                StableDiffusionConfig::v2_1(sliced_attention_size, Some(height), Some(width))
            }
        }
    }
}

pub struct StableDiffusionModel {
    variant: ModelVariant,
    device: Device,
    dtype: DType,
    sliced_attention_size: Option<usize>,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl StableDiffusionModel {
    /// Loads a diffusers-layout model directory.
    pub fn load(variant: ModelVariant, model_dir: &Path, config: &RuntimeConfig) -> Result<Self> {
        // Configure device.
        let device = select_best_device(config.device_map).context("failed to set up device")?;
        let dtype = inference_dtype(&device);
        let sliced_attention_size = config.attention_slice_size;
        info!(
            "Loading {variant:?} pipeline on {:?} as {dtype:?} (attention slicing: {})",
            device.location(),
            sliced_attention_size.map_or("off".to_string(), |size| size.to_string())
        );

        let sd_config = variant.sd_config(sliced_attention_size, LOAD_SIZE, LOAD_SIZE);

        // --- Load tokenizer ---
        let tokenizer_file = tokenizer_file(model_dir, config)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(Error::msg)
            .with_context(|| format!("failed to load tokenizer {tokenizer_file:?}"))?;
        let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| anyhow!("tokenizer has no {pad_token} token"))?;

        // --- Load CLIP text encoder ---
        // Kept at full precision, embeddings are cast afterwards.
        let clip_weights = weights_file(model_dir, "text_encoder", "model", DType::F32)?;
        let text_model = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            clip_weights,
            &device,
            DType::F32,
        )
        .context("failed to load CLIP text encoder")?;

        // --- Load autoencoder ---
        let vae_weights = weights_file(model_dir, "vae", "diffusion_pytorch_model", dtype)?;
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load autoencoder")?;

        // --- Load UNet ---
        let unet_weights = weights_file(model_dir, "unet", "diffusion_pytorch_model", dtype)?;
        let unet = sd_config
            .build_unet(unet_weights, &device, 4, cfg!(feature = "flash-attn"), dtype)
            .context("failed to load unet")?;

        Ok(StableDiffusionModel {
            variant,
            device,
            dtype,
            sliced_attention_size,
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            text_model,
            vae,
            unet,
        })
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_tokens {
            warn!(
                "prompt is {} tokens, truncating to {}",
                tokens.len(),
                self.max_tokens
            );
            tokens.truncate(self.max_tokens);
        }
        tokens.resize(self.max_tokens, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    /// Prompt embeddings, preceded by the unconditional ones under guidance.
    fn text_embeddings(&self, request: &TransformRequest, use_guidance: bool) -> Result<Tensor> {
        let cond = self.encode_prompt(&request.prompt)?;
        let embeddings = if use_guidance {
            let uncond = self.encode_prompt(request.negative_prompt.as_deref().unwrap_or(""))?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }
}

impl Img2ImgPipeline for StableDiffusionModel {
    fn run(&self, image: &DynamicImage, request: &TransformRequest) -> Result<TransformOutput> {
        // Optionally set seed for reproducibility.
        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let init_image = image_to_tensor(image, &self.device, self.dtype)?;
        let (_, _, height, width) = init_image.dims4()?;
        let sd_config = self
            .variant
            .sd_config(self.sliced_attention_size, height, width);

        let use_guidance = request.guidance_scale > 1.0;
        let text_embeddings = self.text_embeddings(request, use_guidance)?;

        // --- Create scheduler and skip the steps covered by the source image ---
        let mut scheduler = sd_config.build_scheduler(request.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let t_start = timesteps
            .len()
            .saturating_sub((timesteps.len() as f64 * request.strength) as usize);
        debug!(
            "img2img {width}x{height}: denoising {} of {} steps",
            timesteps.len() - t_start.min(timesteps.len()),
            timesteps.len()
        );

        // --- Encode the source image into noised latents ---
        let init_latents = (self.vae.encode(&init_image)?.sample()? * VAE_SCALE)?;
        let latents = if t_start < timesteps.len() {
            let noise = init_latents.randn_like(0f64, 1f64)?;
            scheduler.add_noise(&init_latents, noise, timesteps[t_start])?
        } else {
            init_latents
        };
        let mut latents = latents.to_dtype(self.dtype)?;

        // --- Denoise ---
        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
                (noise_pred_uncond
                    + ((noise_pred_text - noise_pred_uncond)? * request.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        // --- Decode the latents using the autoencoder ---
        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let decoded = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let decoded = (decoded.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        let output = tensor_to_image(&decoded.i(0)?)?;

        Ok(TransformOutput {
            images: vec![output],
            metadata: TransformMetadata {
                width: width as u32,
                height: height as u32,
                num_inference_steps: request.num_inference_steps,
                strength: request.strength,
                guidance_scale: request.guidance_scale,
                seed: request.seed,
            },
        })
    }
}

/// Picks `<component>/<stem>[.fp16].safetensors`, preferring the fp16 file
/// when loading at half precision.
fn weights_file(model_dir: &Path, component: &str, stem: &str, dtype: DType) -> Result<PathBuf> {
    let dir = model_dir.join(component);
    let full = dir.join(format!("{stem}.safetensors"));
    let half = dir.join(format!("{stem}.fp16.safetensors"));
    let candidates = if dtype == DType::F16 {
        [half, full]
    } else {
        [full, half]
    };
    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| anyhow!("no {component} safetensors weights in {model_dir:?}"))
}

fn tokenizer_file(model_dir: &Path, config: &RuntimeConfig) -> Result<PathBuf> {
    let local = model_dir.join("tokenizer").join("tokenizer.json");
    if local.is_file() {
        return Ok(local);
    }
    debug!("{model_dir:?} has no tokenizer.json, fetching {FALLBACK_TOKENIZER_REPO}");
    let api = hub_api(&config.hub_cache, config.hub_token.clone())?;
    api.model(FALLBACK_TOKENIZER_REPO.to_string())
        .get("tokenizer.json")
        .context("failed to get CLIP tokenizer")
}

/// Rejects model paths this pipeline cannot load, before any weights are read.
pub fn check_model_layout(model_path: &Path) -> Result<()> {
    if model_path.is_file() {
        bail!(
            "{model_path:?} is a single-file checkpoint; only diffusers model directories \
             (unet/, vae/, text_encoder/) can be loaded"
        );
    }
    if !model_path.join("unet").is_dir() {
        bail!("{model_path:?} is not a diffusers model directory (missing unet/)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn prefers_half_precision_weights_on_accelerators() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let unet = temp.path().join("unet");
        fs::create_dir_all(&unet)?;
        fs::write(unet.join("diffusion_pytorch_model.safetensors"), b"")?;
        fs::write(unet.join("diffusion_pytorch_model.fp16.safetensors"), b"")?;

        let half = weights_file(temp.path(), "unet", "diffusion_pytorch_model", DType::F16)?;
        assert!(half.ends_with("diffusion_pytorch_model.fp16.safetensors"));
        let full = weights_file(temp.path(), "unet", "diffusion_pytorch_model", DType::F32)?;
        assert!(full.ends_with("diffusion_pytorch_model.safetensors"));
        assert!(weights_file(temp.path(), "vae", "diffusion_pytorch_model", DType::F32).is_err());
        Ok(())
    }

    #[test]
    fn bundled_tokenizer_is_used_without_the_hub() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let tokenizer = temp.path().join("tokenizer");
        fs::create_dir_all(&tokenizer)?;
        fs::write(tokenizer.join("tokenizer.json"), b"{}")?;
        let config = RuntimeConfig {
            hub_cache: temp.path().join("hf_cache"),
            ..Default::default()
        };

        let found = tokenizer_file(temp.path(), &config)?;

        assert_eq!(found, tokenizer.join("tokenizer.json"));
        assert!(!config.hub_cache.exists());
        Ok(())
    }

    #[test]
    fn single_file_checkpoints_are_rejected() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let checkpoint = temp.path().join("dreamshaper.safetensors");
        fs::write(&checkpoint, b"weights")?;
        assert!(check_model_layout(&checkpoint).is_err());
        assert!(check_model_layout(temp.path()).is_err());

        fs::create_dir_all(temp.path().join("unet"))?;
        assert!(check_model_layout(temp.path()).is_ok());
        Ok(())
    }
}
