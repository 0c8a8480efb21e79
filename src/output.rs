//! Saving generated images
//!
//! File names are `{prefix}_{YYYYMMDD-HHMMSS}_{seed}.png`. The prefix is the
//! first 15 characters of the prompt with spaces turned into underscores and
//! everything that is not alphanumeric or `_` dropped.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone};
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::debug;

const PREFIX_CHARS: usize = 15;

/// Sanitized file name prefix derived from a prompt
pub fn prompt_prefix(prompt: &str) -> String {
    prompt
        .replace(' ', "_")
        .chars()
        .take(PREFIX_CHARS)
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

pub fn output_filename<Tz>(prompt: &str, timestamp: &DateTime<Tz>, seed: u64) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}_{}_{}.png",
        prompt_prefix(prompt),
        timestamp.format("%Y%m%d-%H%M%S"),
        seed
    )
}

/// Save an image as PNG under `output_dir`, creating the directory if needed
///
/// Returns the path written.
pub fn save_image<P: AsRef<Path>>(
    image: &RgbImage,
    prompt: &str,
    seed: u64,
    output_dir: P,
) -> Result<PathBuf> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir).with_context(|| {
        format!("Failed to create output directory: {}", output_dir.display())
    })?;

    let path = output_dir.join(output_filename(prompt, &Local::now(), seed));
    image
        .save_with_format(&path, image::ImageFormat::Png)
        .with_context(|| format!("Failed to save image: {}", path.display()))?;

    debug!(path = %path.display(), "Image written");
    Ok(path)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fresh scratch directory under the system temp dir
    pub(crate) fn scratch_dir(name: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "flux-batch-{}-{}-{}",
            name,
            std::process::id(),
            n
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_prompt_prefix() {
        assert_eq!(prompt_prefix("A/B? test!!"), "AB_test");
        assert_eq!(prompt_prefix("A misty Japanese garden at dawn"), "A_misty_Japanes");
        assert_eq!(prompt_prefix("Cyberpunk café interior"), "Cyberpunk_café_");
        assert_eq!(prompt_prefix(""), "");
    }

    #[test]
    fn test_prefix_truncates_before_filtering() {
        // 15 characters are taken first, so stripped symbols shorten the prefix
        assert_eq!(prompt_prefix("!!!!!!!!!!!!!!!abc"), "");
        assert_eq!(prompt_prefix("a,b,c,d,e,f,g,h,i,j"), "abcdefgh");
    }

    #[test]
    fn test_output_filename() {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            output_filename("A/B? test!!", &timestamp, 42),
            "AB_test_20240309-070501_42.png"
        );
    }

    #[test]
    fn test_save_image_twice() {
        let dir = scratch_dir("save");
        let image = RgbImage::from_pixel(8, 8, image::Rgb([200, 10, 10]));

        let first = save_image(&image, "a red square", 7, &dir).unwrap();
        let second = save_image(&image, "a red square", 8, &dir).unwrap();

        assert!(first.exists());
        assert!(second.exists());
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("a_red_square_"));
        assert!(second.to_string_lossy().ends_with("_8.png"));

        let loaded = image::open(&first).unwrap().to_rgb8();
        assert_eq!(loaded.dimensions(), (8, 8));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
