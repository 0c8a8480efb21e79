//! Model downloader for HuggingFace Hub
//!
//! Resolves every file a [`PipelinePlan`] needs:
//! - FLUX.1 transformer (quantized GGUF for int4, safetensors for bf16)
//! - FLUX VAE
//! - CLIP ViT-L/14 text encoder + tokenizer
//! - T5-XXL encoder (safetensors or Q8_0 GGUF) + tokenizer
//! - LoRA adapters from the registry
//!
//! Files are cached by hf-hub, so repeated runs only hit the network once.

use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::{Cache, Repo, RepoType};
use std::path::PathBuf;
use tracing::info;

use crate::selector::{LoraAttachment, ModelFamily, PipelinePlan, Precision};

/// Pick the access token: a non-empty `HF_TOKEN` wins over the cached login
pub fn resolve_token(
    env_token: Option<String>,
    cached: impl FnOnce() -> Option<String>,
) -> Option<String> {
    env_token
        .filter(|token| !token.trim().is_empty())
        .or_else(cached)
}

/// Token from the environment or the cached `huggingface-cli login`
pub fn hub_token() -> Option<String> {
    resolve_token(std::env::var("HF_TOKEN").ok(), || Cache::from_env().token())
}

/// Model downloader that caches models using HuggingFace Hub
pub struct ModelDownloader {
    api: Api,
}

impl ModelDownloader {
    /// Create a new model downloader
    ///
    /// The token for gated repos comes from `HF_TOKEN`, falling back to the
    /// token file under `HF_HOME` written by `huggingface-cli login`.
    pub fn new() -> Result<Self> {
        let token = hub_token();
        if token.is_none() {
            info!("No HuggingFace token found, gated repos will be unavailable");
        }

        let api = ApiBuilder::from_env()
            .with_token(token)
            .build()
            .context("Failed to create HuggingFace API client")?;
        Ok(Self { api })
    }

    async fn get(&self, repo: Repo, file: &str) -> Result<PathBuf> {
        let repo_id = repo.url();
        let path = self
            .api
            .repo(repo)
            .get(file)
            .await
            .with_context(|| format!("Failed to download {} from {}", file, repo_id))?;
        Ok(path)
    }

    /// Download everything needed to build the planned pipeline
    pub async fn download_plan(&self, plan: &PipelinePlan) -> Result<ModelPaths> {
        info!(
            model = %plan.family,
            precision = %plan.precision,
            "Downloading FLUX.1 pipeline models"
        );

        let (transformer, vae, clip, t5, loras) = tokio::try_join!(
            self.download_transformer(plan.family, plan.precision),
            self.download_vae(plan.family),
            self.download_clip(),
            self.download_t5(plan.quantized_t5),
            self.download_loras(&plan.loras),
        )?;

        info!("✓ All models downloaded successfully!");

        Ok(ModelPaths {
            transformer,
            vae,
            clip,
            t5,
            loras,
        })
    }

    /// FLUX.1 transformer weights
    ///
    /// int4 uses the GGUF conversions from `lmz/candle-flux`, bf16 the
    /// reference safetensors (FLUX.1-dev is gated and needs HF_TOKEN).
    pub async fn download_transformer(
        &self,
        family: ModelFamily,
        precision: Precision,
    ) -> Result<PathBuf> {
        let (repo, file) = match precision {
            Precision::Int4 => (
                "lmz/candle-flux".to_string(),
                format!("flux1-{}.gguf", family.as_str()),
            ),
            Precision::Bf16 => (
                family.repo().to_string(),
                format!("flux1-{}.safetensors", family.as_str()),
            ),
        };
        info!(repo = %repo, file = %file, "Downloading FLUX.1 transformer");

        let path = self.get(Repo::model(repo), &file).await?;
        info!("  ✓ Transformer downloaded: {}", path.display());
        Ok(path)
    }

    pub async fn download_vae(&self, family: ModelFamily) -> Result<PathBuf> {
        info!("Downloading VAE decoder (~350MB)");

        let path = self
            .get(Repo::model(family.repo().to_string()), "ae.safetensors")
            .await?;
        info!("  ✓ VAE decoder downloaded: {}", path.display());
        Ok(path)
    }

    pub async fn download_clip(&self) -> Result<ClipPaths> {
        info!("Downloading CLIP encoder (~500MB)");

        let repo = || Repo::model("openai/clip-vit-large-patch14".to_string());
        let weights = self.get(repo(), "model.safetensors").await?;
        let tokenizer = self.get(repo(), "tokenizer.json").await?;

        info!("  ✓ CLIP encoder downloaded: {}", weights.display());
        Ok(ClipPaths { weights, tokenizer })
    }

    /// T5-XXL encoder, full precision or Q8_0 GGUF (~9GB either way)
    pub async fn download_t5(&self, quantized: bool) -> Result<T5Paths> {
        let tokenizer = self
            .get(
                Repo::model("lmz/mt5-tokenizers".to_string()),
                "t5-v1_1-xxl.tokenizer.json",
            )
            .await?;

        let weights = if quantized {
            info!("Downloading T5-XXL quantized (Q8_0, ~5GB)");
            let gguf = self
                .get(
                    Repo::model("city96/t5-v1_1-xxl-encoder-gguf".to_string()),
                    "t5-v1_1-xxl-encoder-Q8_0.gguf",
                )
                .await?;
            T5Weights::Gguf(gguf)
        } else {
            info!("Downloading T5-XXL full precision (~9GB)");
            let repo = || {
                Repo::with_revision(
                    "google/t5-v1_1-xxl".to_string(),
                    RepoType::Model,
                    "refs/pr/2".to_string(),
                )
            };
            let weights = self.get(repo(), "model.safetensors").await?;
            let config = self.get(repo(), "config.json").await?;
            T5Weights::Safetensors { weights, config }
        };

        info!("  ✓ T5-XXL downloaded");
        Ok(T5Paths { weights, tokenizer })
    }

    pub async fn download_loras(
        &self,
        loras: &[LoraAttachment],
    ) -> Result<Vec<(LoraAttachment, PathBuf)>> {
        let mut paths = Vec::with_capacity(loras.len());
        for lora in loras {
            info!(name = lora.source.name, repo = lora.source.repo, "Downloading LoRA adapter");
            let path = self
                .get(
                    Repo::model(lora.source.repo.to_string()),
                    lora.source.weight_name,
                )
                .await?;
            paths.push((lora.clone(), path));
        }
        Ok(paths)
    }
}

pub struct ClipPaths {
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

pub enum T5Weights {
    Safetensors { weights: PathBuf, config: PathBuf },
    Gguf(PathBuf),
}

pub struct T5Paths {
    pub weights: T5Weights,
    pub tokenizer: PathBuf,
}

/// Paths to all downloaded models
pub struct ModelPaths {
    /// GGUF for int4, safetensors for bf16
    pub transformer: PathBuf,
    pub vae: PathBuf,
    pub clip: ClipPaths,
    pub t5: T5Paths,
    pub loras: Vec<(LoraAttachment, PathBuf)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_token_wins_over_cached_login() {
        let token = resolve_token(Some("hf_env".to_string()), || Some("hf_cached".to_string()));
        assert_eq!(token.as_deref(), Some("hf_env"));
    }

    #[test]
    fn test_falls_back_to_cached_login() {
        let cached = || Some("hf_cached".to_string());
        assert_eq!(resolve_token(None, cached).as_deref(), Some("hf_cached"));
        assert_eq!(resolve_token(Some("  ".to_string()), cached).as_deref(), Some("hf_cached"));
        assert_eq!(resolve_token(None, || None), None);
    }
}
