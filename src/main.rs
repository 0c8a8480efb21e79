//! CLI entry point for FLUX.1 batch generation

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use flux_batch::config::{default_prompts, load_prompts, BatchConfig, PromptConfig};
use flux_batch::download::{hub_token, ModelDownloader, T5Weights};
use flux_batch::generate::{generate_image, run_batch};
use flux_batch::output::save_image;
use flux_batch::pipeline::PipelineOptions;
use flux_batch::selector::{
    load_pipeline, select_pipeline, ModelFamily, PipelinePlan, PipelineRequest, LORA_REGISTRY,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flux-batch")]
#[command(author = "rzem-ai")]
#[command(version = "0.1.0")]
#[command(about = "Batch FLUX.1 image generation", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Which pipeline variant to load
#[derive(Args, Clone)]
struct ModelArgs {
    /// Model family: schnell or dev
    #[arg(short, long, default_value = "schnell")]
    model: String,

    /// Transformer precision: int4 (quantized, CUDA only) or bf16
    #[arg(long, default_value = "int4")]
    precision: String,

    /// Use the quantized T5-XXL text encoder
    #[arg(long)]
    qencoder: bool,

    /// Compute device: cpu, cuda[:N] or metal[:N]
    #[arg(short, long, default_value = "cuda")]
    device: String,
}

impl ModelArgs {
    fn request(&self) -> PipelineRequest {
        PipelineRequest::new(&self.model, &self.precision)
            .with_qencoder(self.qencoder)
            .with_device(&self.device)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate every prompt of a batch and save the images
    ///
    /// Without --prompts the built-in list of ten prompts is used, each at
    /// 1024x1024, 4 steps, guidance 0 and a random seed.
    Batch {
        #[command(flatten)]
        model: ModelArgs,

        /// JSON array of prompt configurations
        #[arg(short, long)]
        prompts: Option<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Keep the text encoders on the GPU instead of the CPU
        #[arg(long)]
        no_offload: bool,
    },

    /// Generate a single image with a chosen model, precision and LoRA
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        /// Text prompt
        #[arg(short, long)]
        prompt: String,

        /// LoRA adapter from the registry, "All" or "None" (dev only)
        #[arg(short, long, default_value = "None")]
        lora: String,

        /// LoRA strength
        #[arg(long, default_value = "1.0")]
        lora_weight: f32,

        #[arg(long, default_value = "1024")]
        width: usize,

        #[arg(long, default_value = "1024")]
        height: usize,

        #[arg(long, default_value = "4")]
        steps: usize,

        #[arg(long, default_value = "0.0")]
        guidance_scale: f64,

        /// Random seed for reproducibility (random if omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Output directory
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Move the text encoders to the CPU
        #[arg(long)]
        cpu_offload: bool,
    },

    /// Download the models for a selection without generating
    Download {
        #[command(flatten)]
        model: ModelArgs,

        /// LoRA adapter from the registry, "All" or "None" (dev only)
        #[arg(short, long, default_value = "None")]
        lora: String,
    },

    /// List the available LoRA adapters
    Loras,
}

/// FLUX.1-dev is gated on the Hub; warn before a long download fails with 401
fn warn_missing_token(plan: &PipelinePlan) {
    if plan.family != ModelFamily::Dev {
        return;
    }
    if hub_token().is_none() {
        eprintln!("⚠️  No HuggingFace token (HF_TOKEN or huggingface-cli login); gated FLUX.1-dev weights will fail to download");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Batch {
            model,
            prompts,
            output_dir,
            no_offload,
        } => {
            let prompts = match prompts {
                Some(path) => load_prompts(path)?,
                None => default_prompts(),
            };
            let batch = BatchConfig::new(prompts, output_dir);

            let plan = select_pipeline(&model.request())?;
            warn_missing_token(&plan);
            let downloader = ModelDownloader::new()?;
            let options = PipelineOptions {
                cpu_offload: !no_offload,
            };
            let mut pipeline = load_pipeline(&plan, &downloader, options).await?;

            let saved = run_batch(&mut pipeline, &batch, &mut rand::thread_rng())?;

            println!();
            println!("✨ Generated {} images in {}", saved.len(), batch.output_dir.display());
        }

        Commands::Generate {
            model,
            prompt,
            lora,
            lora_weight,
            width,
            height,
            steps,
            guidance_scale,
            seed,
            output_dir,
            cpu_offload,
        } => {
            let plan = select_pipeline(&model.request().with_lora(&lora, lora_weight))?;
            warn_missing_token(&plan);
            let downloader = ModelDownloader::new()?;
            let mut pipeline =
                load_pipeline(&plan, &downloader, PipelineOptions { cpu_offload }).await?;

            for (name, scale) in pipeline.loras() {
                println!("  LoRA {}: scale {}", name, scale);
            }

            let config = PromptConfig::new(prompt)
                .with_size(width, height)
                .with_steps(steps)
                .with_guidance_scale(guidance_scale)
                .with_seed(seed);
            let result = generate_image(&mut pipeline, &config, &mut rand::thread_rng())?;
            let path = save_image(&result.image, &config.prompt, result.seed, &output_dir)?;

            println!();
            println!("✨ Saved image to: {}", path.display());
        }

        Commands::Download { model, lora } => {
            let plan = select_pipeline(&model.request().with_lora(&lora, 1.0))?;
            warn_missing_token(&plan);
            let downloader = ModelDownloader::new()?;
            let paths = downloader.download_plan(&plan).await?;

            println!();
            println!("✓ All models downloaded successfully!");
            println!();
            println!("Model locations:");
            println!("  Transformer: {}", paths.transformer.display());
            println!("  VAE:         {}", paths.vae.display());
            println!("  CLIP:        {}", paths.clip.weights.display());
            match &paths.t5.weights {
                T5Weights::Safetensors { weights, .. } => {
                    println!("  T5:          {}", weights.display())
                }
                T5Weights::Gguf(gguf) => println!("  T5 (Q8_0):   {}", gguf.display()),
            }
            for (attachment, path) in &paths.loras {
                println!("  LoRA {}: {}", attachment.source.name, path.display());
            }
        }

        Commands::Loras => {
            println!("Available LoRA adapters (FLUX.1-dev):");
            for lora in LORA_REGISTRY {
                println!("  {:<22} {}/{}", lora.name, lora.repo, lora.weight_name);
            }
        }
    }

    Ok(())
}
