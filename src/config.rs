//! Prompt configuration for batch generation
//!
//! A batch is a fixed, ordered list of [`PromptConfig`] records plus the
//! directory the images are written to. The list is built once at startup
//! (either the built-in prompts or a JSON file) and treated as read-only.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_WIDTH: usize = 1024;
pub const DEFAULT_HEIGHT: usize = 1024;
pub const DEFAULT_STEPS: usize = 4;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 0.0;
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// Parameters for a single generated image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    pub prompt: String,
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_height")]
    pub height: usize,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default)]
    pub guidance_scale: f64,
    /// `None` means a random seed is drawn at generation time
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_width() -> usize {
    DEFAULT_WIDTH
}

fn default_height() -> usize {
    DEFAULT_HEIGHT
}

fn default_steps() -> usize {
    DEFAULT_STEPS
}

impl PromptConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            num_inference_steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
        }
    }

    pub fn with_size(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.num_inference_steps = steps;
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
}

const DEFAULT_PROMPTS: [&str; 10] = [
    "A misty Japanese garden at dawn, with a red maple tree dropping leaves onto a koi pond, cinematic lighting, photorealistic style",
    "Cyberpunk café interior, neon signs reflecting off rain-soaked windows, steam rising from coffee cups, volumetric lighting, highly detailed",
    "Ancient library with floating books and magical dust particles, rays of sunlight streaming through stained glass windows, fantasy art style",
    "Crystal cave with bioluminescent fungi, underground lake reflecting turquoise crystals, ethereal atmosphere, hyper-realistic detail",
    "Steampunk airship floating through golden sunset clouds, brass and copper details, steam trailing behind, atmospheric perspective",
    "Northern lights dancing over a snow-covered forest, starry night sky, lone wolf howling, moonlight casting blue shadows, digital art",
    "Underwater city with art deco architecture, schools of iridescent fish swimming between buildings, caustic lighting, octane render",
    "Desert oasis with ancient ruins, palm trees swaying in the wind, golden hour lighting, sand particles in the air, cinematic composition",
    "Enchanted greenhouse filled with glowing flowers, butterflies with luminescent wings, dew drops on leaves, magical realism style",
    "Floating islands in the sky connected by crystalline bridges, waterfalls cascading into the void, ethereal clouds, fantasy concept art",
];

/// The built-in prompt list, all with default parameters and random seeds
pub fn default_prompts() -> Vec<PromptConfig> {
    DEFAULT_PROMPTS.iter().map(|p| PromptConfig::new(*p)).collect()
}

/// Load a JSON array of prompt configurations
///
/// Omitted fields take the same defaults as [`PromptConfig::new`].
pub fn load_prompts<P: AsRef<Path>>(path: P) -> Result<Vec<PromptConfig>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
    let prompts: Vec<PromptConfig> = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse prompt file: {}", path.display()))?;

    info!(path = %path.display(), count = prompts.len(), "Loaded prompt configurations");
    Ok(prompts)
}

/// Everything the batch loop needs, fixed for the lifetime of the process
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub prompts: Vec<PromptConfig>,
    pub output_dir: PathBuf,
}

impl BatchConfig {
    pub fn new(prompts: Vec<PromptConfig>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompts,
            output_dir: output_dir.into(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::new(default_prompts(), DEFAULT_OUTPUT_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_config_defaults() {
        let config = PromptConfig::new("a cat");
        assert_eq!(config.width, 1024);
        assert_eq!(config.height, 1024);
        assert_eq!(config.num_inference_steps, 4);
        assert_eq!(config.guidance_scale, 0.0);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn test_default_prompts() {
        let prompts = default_prompts();
        assert_eq!(prompts.len(), 10);
        assert!(prompts[0].prompt.starts_with("A misty Japanese garden"));
        assert!(prompts.iter().all(|p| p.seed.is_none() && p.num_inference_steps == 4));

        let batch = BatchConfig::default();
        assert_eq!(batch.prompts, prompts);
        assert_eq!(batch.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let json = r#"[
            {"prompt": "a lighthouse"},
            {"prompt": "a fox", "width": 512, "height": 768, "num_inference_steps": 28,
             "guidance_scale": 3.5, "seed": 42}
        ]"#;
        let prompts: Vec<PromptConfig> = serde_json::from_str(json).unwrap();

        assert_eq!(prompts[0], PromptConfig::new("a lighthouse"));
        assert_eq!(
            prompts[1],
            PromptConfig::new("a fox")
                .with_size(512, 768)
                .with_steps(28)
                .with_guidance_scale(3.5)
                .with_seed(Some(42))
        );
    }

    #[test]
    fn test_load_prompts_missing_file() {
        let err = load_prompts("/nonexistent/prompts.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read prompt file"));
    }

    #[test]
    fn test_load_prompts_from_file() {
        let dir = crate::output::tests::scratch_dir("prompts");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("prompts.json");
        std::fs::write(
            &path,
            r#"[{"prompt": "a lighthouse"}, {"prompt": "a fox", "steps": 2, "seed": 9}]"#,
        )
        .unwrap();

        // Unknown keys are ignored, omitted ones take defaults
        let prompts = load_prompts(&path).unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0], PromptConfig::new("a lighthouse"));
        assert_eq!(prompts[1].prompt, "a fox");
        assert_eq!(prompts[1].num_inference_steps, 4);
        assert_eq!(prompts[1].seed, Some(9));

        std::fs::write(&path, r#"{"prompt": "not a list"}"#).unwrap();
        let err = load_prompts(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse prompt file"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
