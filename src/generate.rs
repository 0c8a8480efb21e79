//! Sequential batch generation
//!
//! Runs every prompt configuration through an [`ImageGenerator`] one at a
//! time, saving each image before starting the next. The first error aborts
//! the batch; images saved before it stay on disk.

use anyhow::Result;
use image::RgbImage;
use rand::Rng;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::{BatchConfig, PromptConfig};
use crate::output::save_image;

/// Upper bound (inclusive) for randomly drawn seeds
pub const MAX_SEED: u64 = 1_000_000_000;

/// Anything that can turn a prompt configuration and a seed into an image
pub trait ImageGenerator {
    fn generate(&mut self, config: &PromptConfig, seed: u64) -> Result<RgbImage>;
}

/// Image produced for one configuration together with the seed that made it
pub struct GenerationResult {
    pub image: RgbImage,
    pub seed: u64,
}

/// The configured seed, or a fresh one in `[0, MAX_SEED]`
pub fn resolve_seed<R: Rng + ?Sized>(config: &PromptConfig, rng: &mut R) -> u64 {
    config.seed.unwrap_or_else(|| rng.gen_range(0..=MAX_SEED))
}

/// Milliseconds below one second, seconds otherwise
pub fn format_latency(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 1.0 {
        format!("{:.2}ms", secs * 1000.0)
    } else {
        format!("{:.2}s", secs)
    }
}

pub fn generate_image<G, R>(
    generator: &mut G,
    config: &PromptConfig,
    rng: &mut R,
) -> Result<GenerationResult>
where
    G: ImageGenerator + ?Sized,
    R: Rng + ?Sized,
{
    let seed = resolve_seed(config, rng);

    let start = Instant::now();
    let image = generator.generate(config, seed)?;
    let latency = format_latency(start.elapsed());

    let preview: String = config.prompt.chars().take(50).collect();
    info!("Generated image for prompt: '{}...' - Latency: {}", preview, latency);

    Ok(GenerationResult { image, seed })
}

/// Generate and save every configured prompt in order
///
/// # Returns
/// Paths of the saved images, in prompt order
pub fn run_batch<G, R>(generator: &mut G, batch: &BatchConfig, rng: &mut R) -> Result<Vec<PathBuf>>
where
    G: ImageGenerator + ?Sized,
    R: Rng + ?Sized,
{
    let total = batch.prompts.len();
    info!("Starting generation for {} prompts...", total);

    let mut saved = Vec::with_capacity(total);
    for (idx, config) in batch.prompts.iter().enumerate() {
        info!("Processing prompt {}/{}", idx + 1, total);

        let result = generate_image(generator, config, rng)?;
        let path = save_image(&result.image, &config.prompt, result.seed, &batch.output_dir)?;

        info!("Saved image to: {}", path.display());
        saved.push(path);
    }

    Ok(saved)
}
