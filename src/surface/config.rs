// src/surface/config.rs
//
// Every tunable of the surface classifier. Defaults are the field-tested
// reference values; retune here (or in config.yaml), never in the algorithm.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Which local-darkness cue is fused with the edge channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContrastChannel {
    /// Gaussian-weighted adaptive threshold, binary inverse.
    Adaptive,
    /// |luminance - heavily blurred luminance| above a fixed threshold.
    LocalContrast,
}

/// How the edge channel and the contrast channel are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fusion {
    /// Either cue is enough (more sensitive).
    Or,
    /// Both cues must agree (more precise).
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringScheme {
    /// Four weighted feature tests.
    Weighted,
    /// Any region inside the area band is a full-score candidate.
    AreaBand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    // Preprocessing
    pub blur_kernel: u32,

    // Edge channel
    pub canny_low: f32,
    pub canny_high: f32,

    // Contrast channel
    pub contrast_channel: ContrastChannel,
    pub adaptive_block: u32,
    pub adaptive_offset: f32,
    pub contrast_blur_kernel: u32,
    pub contrast_threshold: u8,

    // Fusion + cleanup
    pub fusion: Fusion,
    pub morph_kernel: u32,

    // Region filtering (px²)
    pub area_min: f32,
    pub area_max: f32,
    pub ideal_area_min: f32,
    pub ideal_area_max: f32,

    // Feature predicates
    pub dark_intensity_max: f32,
    pub aspect_min: f32,
    pub aspect_max: f32,
    pub circularity_min: f32,
    pub circularity_max: f32,

    // Feature weights
    pub dark_weight: f32,
    pub aspect_weight: f32,
    pub circularity_weight: f32,
    pub ideal_area_weight: f32,

    // Decision
    pub scoring: ScoringScheme,
    pub qualify_score: f32,
    pub pothole_threshold: f32,
    pub uncertain_threshold: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            blur_kernel: 7,
            canny_low: 50.0,
            canny_high: 150.0,
            contrast_channel: ContrastChannel::Adaptive,
            adaptive_block: 11,
            adaptive_offset: 2.0,
            contrast_blur_kernel: 21,
            contrast_threshold: 15,
            fusion: Fusion::Or,
            morph_kernel: 5,
            area_min: 500.0,
            area_max: 50_000.0,
            ideal_area_min: 1_000.0,
            ideal_area_max: 30_000.0,
            dark_intensity_max: 100.0,
            aspect_min: 0.4,
            aspect_max: 2.5,
            circularity_min: 0.3,
            circularity_max: 0.8,
            dark_weight: 0.3,
            aspect_weight: 0.2,
            circularity_weight: 0.3,
            ideal_area_weight: 0.2,
            scoring: ScoringScheme::Weighted,
            qualify_score: 0.5,
            pothole_threshold: 0.6,
            uncertain_threshold: 0.4,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, k) in [
            ("blur_kernel", self.blur_kernel),
            ("adaptive_block", self.adaptive_block),
            ("contrast_blur_kernel", self.contrast_blur_kernel),
        ] {
            if k == 0 || k % 2 == 0 {
                bail!("classifier.{} must be odd and positive, got {}", name, k);
            }
        }
        if self.morph_kernel % 2 == 0 {
            bail!(
                "classifier.morph_kernel must be odd, got {}",
                self.morph_kernel
            );
        }
        if self.canny_low > self.canny_high {
            bail!(
                "classifier.canny_low ({}) exceeds canny_high ({})",
                self.canny_low,
                self.canny_high
            );
        }

        for (name, lo, hi) in [
            ("area", self.area_min, self.area_max),
            ("ideal_area", self.ideal_area_min, self.ideal_area_max),
            ("aspect", self.aspect_min, self.aspect_max),
            ("circularity", self.circularity_min, self.circularity_max),
        ] {
            if lo > hi {
                bail!("classifier.{}_min ({}) exceeds {}_max ({})", name, lo, name, hi);
            }
        }

        for (name, v) in [
            ("qualify_score", self.qualify_score),
            ("pothole_threshold", self.pothole_threshold),
            ("uncertain_threshold", self.uncertain_threshold),
            ("dark_weight", self.dark_weight),
            ("aspect_weight", self.aspect_weight),
            ("circularity_weight", self.circularity_weight),
            ("ideal_area_weight", self.ideal_area_weight),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("classifier.{} must be within [0, 1], got {}", name, v);
            }
        }
        if self.uncertain_threshold > self.pothole_threshold {
            bail!(
                "classifier.uncertain_threshold ({}) exceeds pothole_threshold ({})",
                self.uncertain_threshold,
                self.pothole_threshold
            );
        }
        if self.scoring == ScoringScheme::Weighted && self.max_weighted_score() <= self.qualify_score {
            bail!(
                "classifier weights sum to {:.2}, no region can exceed qualify_score ({})",
                self.max_weighted_score(),
                self.qualify_score
            );
        }
        Ok(())
    }

    /// Upper bound of a region score under the weighted scheme.
    pub fn max_weighted_score(&self) -> f32 {
        self.dark_weight + self.aspect_weight + self.circularity_weight + self.ideal_area_weight
    }
}
