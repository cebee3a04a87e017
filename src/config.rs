use crate::types::Config;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Missing file means defaults; a file that exists but does not parse is an error.
    /// Runs before logging is up, so the caller reports which case it was.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Config::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<()> {
        self.classifier.validate()?;

        if self.gps.attempts == 0 {
            bail!("gps.attempts must be at least 1");
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            bail!(
                "camera resolution must be non-zero, got {}x{}",
                self.camera.width,
                self.camera.height
            );
        }
        if !(1..=100).contains(&self.recorder.jpeg_quality) {
            bail!(
                "recorder.jpeg_quality must be in 1..=100, got {}",
                self.recorder.jpeg_quality
            );
        }
        Ok(())
    }
}
