//! FLUX.1 batch image generation
//!
//! Generates one image per prompt configuration with a FLUX.1 pipeline built
//! on the Candle ML framework, and saves each as
//! `output/{prompt_prefix}_{YYYYMMDD-HHMMSS}_{seed}.png`.
//!
//! ## Features
//!
//! - **Batch generation**: a fixed prompt list runs sequentially through one pipeline
//! - **Model selection**: schnell or dev, quantized (int4) or full precision (bf16)
//! - **LoRA adapters**: fused into the transformer weights at load time
//! - **Reproducible**: seeds are drawn per prompt unless configured, and
//!   recorded in the file name
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flux_batch::config::BatchConfig;
//! use flux_batch::download::ModelDownloader;
//! use flux_batch::generate::run_batch;
//! use flux_batch::pipeline::PipelineOptions;
//! use flux_batch::selector::{load_pipeline, select_pipeline, PipelineRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let plan = select_pipeline(&PipelineRequest::new("schnell", "int4"))?;
//!     let downloader = ModelDownloader::new()?;
//!     let mut pipeline =
//!         load_pipeline(&plan, &downloader, PipelineOptions { cpu_offload: true }).await?;
//!
//!     let batch = BatchConfig::default();
//!     run_batch(&mut pipeline, &batch, &mut rand::thread_rng())?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod generate;
pub mod gguf;
pub mod lora;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod selector;
