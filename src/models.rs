//! Model loading for FLUX.1 pipeline components
//!
//! This module handles loading all components needed for FLUX image generation:
//! - T5-XXL text encoder (full precision safetensors or quantized GGUF)
//! - CLIP text encoder (full precision)
//! - FLUX.1 transformer (quantized GGUF or full precision, LoRAs fused in)
//! - VAE decoder (full precision)

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{clip, flux, quantized_t5, t5};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::gguf;
use crate::lora::{fused_deltas, LoraAdapter};
use crate::selector::ModelFamily;

/// T5-XXL v1.1 encoder configuration, used for the GGUF weights which ship
/// without a config.json
const T5_XXL_CONFIG: &str = r#"{
    "vocab_size": 32128,
    "d_model": 4096,
    "d_kv": 64,
    "d_ff": 10240,
    "num_layers": 24,
    "num_heads": 64,
    "relative_attention_num_buckets": 32,
    "relative_attention_max_distance": 128,
    "dropout_rate": 0.1,
    "layer_norm_epsilon": 1e-6,
    "initializer_factor": 1.0,
    "feed_forward_proj": "gated-gelu",
    "tie_word_embeddings": false,
    "is_decoder": false,
    "is_encoder_decoder": false,
    "use_cache": true,
    "pad_token_id": 0,
    "eos_token_id": 1
}"#;

const CLIP_MAX_TOKENS: usize = 77;

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|e| anyhow::anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))
}

enum T5Model {
    Full(t5::T5EncoderModel),
    Quantized(quantized_t5::T5EncoderModel),
}

/// T5 text encoder for FLUX (provides main text conditioning)
pub struct T5TextEncoder {
    model: T5Model,
    tokenizer: Tokenizer,
    device: Device,
    max_length: usize,
}

impl T5TextEncoder {
    /// Load the full precision encoder from safetensors + config.json
    pub fn load_full<P: AsRef<Path>>(
        weights: P,
        config: P,
        tokenizer: P,
        device: Device,
        max_length: usize,
    ) -> Result<Self> {
        let weights = weights.as_ref();
        info!(path = %weights.display(), "Loading T5-XXL encoder (full precision)");

        let config = std::fs::read_to_string(config.as_ref())
            .with_context(|| format!("Failed to read T5 config: {}", config.as_ref().display()))?;
        let config: t5::Config = serde_json::from_str(&config)?;

        let dtype = device.bf16_default_to_f32();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, &device)? };
        let model = t5::T5EncoderModel::load(vb, &config)?;

        info!("✓ T5 encoder loaded successfully");

        Ok(Self {
            model: T5Model::Full(model),
            tokenizer: load_tokenizer(tokenizer.as_ref())?,
            device,
            max_length,
        })
    }

    /// Load quantized T5 encoder from a llama.cpp-style GGUF file
    ///
    /// city96's GGUF uses llama.cpp naming, tensors are renamed to the
    /// HuggingFace layout on load.
    pub fn load_quantized<P: AsRef<Path>>(
        gguf_path: P,
        tokenizer: P,
        device: Device,
        max_length: usize,
    ) -> Result<Self> {
        let gguf_path = gguf_path.as_ref();
        info!(path = %gguf_path.display(), "Loading T5-XXL encoder (quantized)");

        let vb = gguf::load_renamed(gguf_path, &device, gguf::map_llama_to_hf)?;
        let config: quantized_t5::Config = serde_json::from_str(T5_XXL_CONFIG)?;
        let model = quantized_t5::T5EncoderModel::load(vb, &config)?;

        info!("✓ T5 encoder loaded successfully");

        Ok(Self {
            model: T5Model::Quantized(model),
            tokenizer: load_tokenizer(tokenizer.as_ref())?,
            device,
            max_length,
        })
    }

    /// Encode text prompt to T5 embeddings
    ///
    /// # Returns
    /// Tensor of shape [1, max_length, 4096]
    pub fn encode(&mut self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        let mut tokens = encoding.get_ids().to_vec();
        tokens.resize(self.max_length, 0);

        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;

        let embeddings = match &mut self.model {
            T5Model::Full(model) => model.forward(&token_ids)?,
            T5Model::Quantized(model) => model.forward(&token_ids)?,
        };
        Ok(embeddings)
    }
}

/// CLIP text encoder for FLUX (pooled conditioning vector)
pub struct ClipTextEncoder {
    model: clip::text_model::ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl ClipTextEncoder {
    /// Load CLIP ViT-L/14 text model from safetensors file
    pub fn load<P: AsRef<Path>>(model_path: P, tokenizer: P, device: Device) -> Result<Self> {
        info!(path = %model_path.as_ref().display(), "Loading CLIP encoder");

        let dtype = device.bf16_default_to_f32();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_path.as_ref()], dtype, &device)?
        };

        let config = clip::text_model::ClipTextConfig {
            vocab_size: 49408,
            embed_dim: 768,
            activation: clip::text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            max_position_embeddings: CLIP_MAX_TOKENS,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            projection_dim: 768,
        };
        let model = clip::text_model::ClipTextTransformer::new(vb.pp("text_model"), &config)?;

        info!("✓ CLIP encoder loaded successfully");

        Ok(Self {
            model,
            tokenizer: load_tokenizer(tokenizer.as_ref())?,
            device,
        })
    }

    /// Encode text prompt to the pooled CLIP embedding [1, 768]
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        let mut tokens = encoding.get_ids().to_vec();
        if tokens.len() > CLIP_MAX_TOKENS {
            debug!(tokens = tokens.len(), "Truncating CLIP tokens");
            tokens.truncate(CLIP_MAX_TOKENS);
        }

        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&token_ids)?)
    }
}

/// FLUX VAE decoder for converting latents to RGB images
pub struct VaeDecoder {
    model: flux::autoencoder::AutoEncoder,
    dtype: DType,
}

impl VaeDecoder {
    /// Load FLUX VAE from ae.safetensors file
    pub fn load<P: AsRef<Path>>(model_path: P, family: ModelFamily, device: &Device) -> Result<Self> {
        info!(path = %model_path.as_ref().display(), "Loading VAE decoder");

        // bf16 on accelerators, f32 on CPU
        let dtype = device.bf16_default_to_f32();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_path.as_ref()], dtype, device)?
        };

        let config = match family {
            ModelFamily::Schnell => flux::autoencoder::Config::schnell(),
            ModelFamily::Dev => flux::autoencoder::Config::dev(),
        };
        let model = flux::autoencoder::AutoEncoder::new(&config, vb)?;

        info!("✓ VAE decoder loaded successfully");

        Ok(Self { model, dtype })
    }

    /// Decode latents [1, 16, H/8, W/8] to an RGB tensor [1, 3, H, W] in [-1, 1]
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = latents.to_dtype(self.dtype)?;
        Ok(self.model.decode(&latents)?)
    }

    /// Convert a decoded tensor to interleaved RGB bytes
    ///
    /// # Returns
    /// (width, height, H * W * 3 bytes)
    pub fn tensor_to_rgb(&self, tensor: &Tensor) -> Result<(u32, u32, Vec<u8>)> {
        // Clamp to [-1, 1], scale to [0, 255]
        let image = tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)?;
        let image = ((image + 1.0)? * 127.5)?.to_dtype(DType::U8)?;

        // Remove batch dimension and permute to HWC
        let image = image.squeeze(0)?.permute((1, 2, 0))?;
        let (height, width, _) = image.dims3()?;

        Ok((width as u32, height as u32, image.flatten_all()?.to_vec1()?))
    }
}

fn flux_config(family: ModelFamily) -> flux::model::Config {
    match family {
        ModelFamily::Schnell => flux::model::Config::schnell(),
        ModelFamily::Dev => flux::model::Config::dev(),
    }
}

/// FLUX transformer, with any LoRA adapters already fused into its weights
pub enum FluxTransformer {
    /// GGUF weights, activations in F32
    Quantized(flux::quantized_model::Flux),
    FullPrecision { model: flux::model::Flux, dtype: DType },
}

impl FluxTransformer {
    /// Load a quantized FLUX.1 transformer from GGUF
    ///
    /// # Arguments
    /// * `gguf_path` - Path to flux1-{schnell,dev}.gguf
    /// * `loras` - (adapter, strength) pairs to fuse
    pub fn load_quantized<P: AsRef<Path>>(
        gguf_path: P,
        family: ModelFamily,
        loras: &[(&LoraAdapter, f32)],
        device: &Device,
    ) -> Result<Self> {
        let gguf_path = gguf_path.as_ref();
        info!(
            path = %gguf_path.display(),
            model = %family,
            lora_count = loras.len(),
            "Loading FLUX.1 transformer (quantized)"
        );

        let deltas = if loras.iter().any(|(_, strength)| *strength != 0.0) {
            let shapes = gguf::tensor_shapes(gguf_path)?;
            fused_deltas(loras, |name| shapes.get(name).copied())?
        } else {
            Default::default()
        };

        let vb = gguf::load_with_deltas(gguf_path, device, &deltas)?;
        let model = flux::quantized_model::Flux::new(&flux_config(family), vb)?;

        info!(fused_tensors = deltas.len(), "✓ FLUX transformer loaded");
        Ok(Self::Quantized(model))
    }

    /// Load a full precision FLUX.1 transformer from safetensors
    ///
    /// Without active LoRAs the file is memory-mapped. With them, weights are
    /// read to the CPU, deltas are added, and the result is moved to `device`.
    pub fn load_full_precision<P: AsRef<Path>>(
        safetensors_path: P,
        family: ModelFamily,
        loras: &[(&LoraAdapter, f32)],
        device: &Device,
    ) -> Result<Self> {
        let safetensors_path = safetensors_path.as_ref();
        let dtype = device.bf16_default_to_f32();

        info!(
            path = %safetensors_path.display(),
            model = %family,
            dtype = ?dtype,
            lora_count = loras.len(),
            "Loading FLUX.1 transformer (full precision)"
        );

        let vb = if loras.iter().any(|(_, strength)| *strength != 0.0) {
            let mut weights = candle_core::safetensors::load(safetensors_path, &Device::Cpu)
                .with_context(|| format!("Failed to read {}", safetensors_path.display()))?;
            let deltas = fused_deltas(loras, |name| weights.get(name).and_then(|t| t.dims2().ok()))?;

            for (name, delta) in deltas {
                if let Some(weight) = weights.get_mut(&name) {
                    let orig = weight.dtype();
                    *weight = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(orig)?;
                }
            }
            VarBuilder::from_tensors(weights, dtype, device)
        } else {
            unsafe { VarBuilder::from_mmaped_safetensors(&[safetensors_path], dtype, device)? }
        };

        let model = flux::model::Flux::new(&flux_config(family), vb)?;

        info!("✓ FLUX transformer loaded");
        Ok(Self::FullPrecision { model, dtype })
    }

    /// Activation dtype expected by the transformer
    pub fn dtype(&self) -> DType {
        match self {
            Self::Quantized(_) => DType::F32,
            Self::FullPrecision { dtype, .. } => *dtype,
        }
    }

    /// Euler-sample the packed latents along `timesteps`
    pub fn denoise(
        &self,
        state: &flux::sampling::State,
        timesteps: &[f64],
        guidance: f64,
    ) -> Result<Tensor> {
        let img = match self {
            Self::Quantized(model) => flux::sampling::denoise(
                model,
                &state.img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &state.vec,
                timesteps,
                guidance,
            )?,
            Self::FullPrecision { model, .. } => flux::sampling::denoise(
                model,
                &state.img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &state.vec,
                timesteps,
                guidance,
            )?,
        };
        Ok(img)
    }
}
