//! FLUX.1 generation pipeline
//!
//! This module orchestrates the complete image generation workflow:
//! 1. Encode prompt (T5 + CLIP)
//! 2. Denoise with FLUX transformer
//! 3. VAE decode to RGB

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::flux;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::config::PromptConfig;
use crate::download::{ModelPaths, T5Weights};
use crate::generate::ImageGenerator;
use crate::lora::LoraAdapter;
use crate::models::{ClipTextEncoder, FluxTransformer, T5TextEncoder, VaeDecoder};
use crate::selector::{ModelFamily, PipelinePlan, Precision};

/// Latent channels of the FLUX autoencoder
const LATENT_CHANNELS: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    /// Keep the text encoders on the CPU; only embeddings move to the device
    pub cpu_offload: bool,
}

/// Complete FLUX.1 pipeline, loaded once and reused for every generation
pub struct FluxPipeline {
    family: ModelFamily,
    t5: T5TextEncoder,
    clip: ClipTextEncoder,
    transformer: FluxTransformer,
    vae: VaeDecoder,
    device: Device,
    loras: Vec<(String, f32)>,
}

impl FluxPipeline {
    /// Build the pipeline described by `plan` from downloaded files
    pub fn new(
        plan: &PipelinePlan,
        paths: &ModelPaths,
        device: Device,
        options: PipelineOptions,
    ) -> Result<Self> {
        info!(
            model = %plan.family,
            precision = %plan.precision,
            cpu_offload = options.cpu_offload,
            "Initializing FLUX.1 pipeline"
        );

        let encoder_device = if options.cpu_offload {
            Device::Cpu
        } else {
            device.clone()
        };

        // dev was trained with longer T5 sequences than schnell
        let max_length = match plan.family {
            ModelFamily::Schnell => 256,
            ModelFamily::Dev => 512,
        };

        let t5 = match &paths.t5.weights {
            T5Weights::Safetensors { weights, config } => T5TextEncoder::load_full(
                weights,
                config,
                &paths.t5.tokenizer,
                encoder_device.clone(),
                max_length,
            )?,
            T5Weights::Gguf(gguf) => T5TextEncoder::load_quantized(
                gguf,
                &paths.t5.tokenizer,
                encoder_device.clone(),
                max_length,
            )?,
        };
        let clip = ClipTextEncoder::load(&paths.clip.weights, &paths.clip.tokenizer, encoder_device)?;

        let adapters = paths
            .loras
            .iter()
            .map(|(attachment, path)| {
                LoraAdapter::load(path, attachment.source.name).map(|a| (a, attachment.scale))
            })
            .collect::<Result<Vec<_>>>()?;
        let adapter_refs: Vec<(&LoraAdapter, f32)> = adapters.iter().map(|(a, s)| (a, *s)).collect();

        let transformer = match plan.precision {
            Precision::Int4 => FluxTransformer::load_quantized(
                &paths.transformer,
                plan.family,
                &adapter_refs,
                &device,
            )?,
            Precision::Bf16 => FluxTransformer::load_full_precision(
                &paths.transformer,
                plan.family,
                &adapter_refs,
                &device,
            )?,
        };

        let vae = VaeDecoder::load(&paths.vae, plan.family, &device)?;

        info!("✓ Pipeline initialized successfully");

        Ok(Self {
            family: plan.family,
            t5,
            clip,
            transformer,
            vae,
            device,
            loras: adapters.into_iter().map(|(a, s)| (a.name, s)).collect(),
        })
    }

    /// Encode a prompt with T5 and CLIP, returned on the compute device
    pub fn encode_prompt(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let t5_emb = self.t5.encode(prompt).context("T5 encoding failed")?;
        let clip_emb = self.clip.encode(prompt).context("CLIP encoding failed")?;
        debug!(t5 = ?t5_emb.dims(), clip = ?clip_emb.dims(), "Prompt embeddings");

        Ok((t5_emb.to_device(&self.device)?, clip_emb.to_device(&self.device)?))
    }

    /// Generate an image from a prompt configuration
    ///
    /// Width and height are passed through unchecked; FLUX pads them up to
    /// a multiple of 16.
    pub fn generate(&mut self, config: &PromptConfig, seed: u64) -> Result<RgbImage> {
        info!(
            prompt_preview = %config.prompt.chars().take(50).collect::<String>(),
            steps = config.num_inference_steps,
            size = format!("{}x{}", config.width, config.height),
            guidance = config.guidance_scale,
            seed = seed,
            "Starting generation"
        );

        let (t5_emb, clip_emb) = self.encode_prompt(&config.prompt)?;

        let dtype = self.transformer.dtype();
        let noise = seeded_noise(config.height, config.width, seed, &self.device)?;
        let state = flux::sampling::State::new(
            &t5_emb.to_dtype(dtype)?,
            &clip_emb.to_dtype(dtype)?,
            &noise.to_dtype(dtype)?,
        )?;

        let timesteps = schedule(self.family, config.num_inference_steps, state.img.dim(1)?);
        debug!(steps = timesteps.len().saturating_sub(1), "Denoising");

        let latents = self
            .transformer
            .denoise(&state, &timesteps, config.guidance_scale)?;
        let latents = flux::sampling::unpack(&latents, config.height, config.width)?;

        let decoded = self.vae.decode(&latents)?;
        let (width, height, rgb) = self.vae.tensor_to_rgb(&decoded)?;

        RgbImage::from_raw(width, height, rgb)
            .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// Names and scales of the adapters fused into the transformer
    pub fn loras(&self) -> &[(String, f32)] {
        &self.loras
    }
}

impl ImageGenerator for FluxPipeline {
    fn generate(&mut self, config: &PromptConfig, seed: u64) -> Result<RgbImage> {
        FluxPipeline::generate(self, config, seed)
    }
}

/// Sigma schedule: plain for schnell, resolution-shifted for dev
fn schedule(family: ModelFamily, steps: usize, image_seq_len: usize) -> Vec<f64> {
    match family {
        ModelFamily::Schnell => flux::sampling::get_schedule(steps, None),
        ModelFamily::Dev => flux::sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
    }
}

/// Initial latent noise drawn from a CPU generator seeded with `seed`
///
/// The same seed gives the same noise on every device. Shape matches
/// `flux::sampling::get_noise`: [1, 16, 2 * ceil(h / 16), 2 * ceil(w / 16)].
pub fn seeded_noise(height: usize, width: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let latent_h = height.div_ceil(16) * 2;
    let latent_w = width.div_ceil(16) * 2;
    let len = LATENT_CHANNELS * latent_h * latent_w;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        // Box-Muller
        let u1: f32 = rng.gen_range(f32::MIN_POSITIVE..1.0);
        let u2: f32 = rng.gen();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        data.push(radius * theta.cos());
        if data.len() < len {
            data.push(radius * theta.sin());
        }
    }

    let noise = Tensor::from_vec(data, (1, LATENT_CHANNELS, latent_h, latent_w), &Device::Cpu)?;
    Ok(noise.to_dtype(DType::F32)?.to_device(device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_noise_shape_and_determinism() -> Result<()> {
        let a = seeded_noise(1024, 768, 42, &Device::Cpu)?;
        assert_eq!(a.dims(), &[1, 16, 128, 96]);

        let b = seeded_noise(1024, 768, 42, &Device::Cpu)?;
        let diff = (&a - &b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        let c = seeded_noise(1024, 768, 43, &Device::Cpu)?;
        let diff = (&a - &c)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 0.0);
        Ok(())
    }

    #[test]
    fn test_seeded_noise_rounds_up_and_is_standard_normal() -> Result<()> {
        let noise = seeded_noise(1000, 1000, 7, &Device::Cpu)?;
        assert_eq!(noise.dims(), &[1, 16, 126, 126]);

        let values = noise.flatten_all()?.to_vec1::<f32>()?;
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        assert!(mean.abs() < 0.02, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
        Ok(())
    }

    #[test]
    fn test_schedule() {
        let schnell = schedule(ModelFamily::Schnell, 4, 4096);
        assert_eq!(schnell.len(), 5);
        assert_eq!(schnell[0], 1.0);
        assert_eq!(schnell[4], 0.0);

        // Shifting keeps the endpoints but pushes intermediate sigmas up
        let dev = schedule(ModelFamily::Dev, 4, 4096);
        assert_eq!(dev.len(), 5);
        assert!((dev[0] - 1.0).abs() < 1e-9);
        assert!(dev[4].abs() < 1e-9);
        assert!(dev[2] > schnell[2]);
    }
}
