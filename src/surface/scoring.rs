// src/surface/scoring.rs
//
// Region scoring and confidence banding.
//
// Each region gets four independent binary votes. A vote that holds adds
// its fixed weight; the score is the sum of the weights that held, so it is
// always one of the 16 subset sums and never exceeds the weight total.

use super::config::{ClassifierConfig, ScoringScheme};
use super::regions::CandidateRegion;
use crate::types::Label;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureVotes {
    /// Darker than the surrounding road surface.
    pub dark: bool,
    /// Neither a sliver nor a long streak.
    pub plausible_aspect: bool,
    /// Irregular outline, but not line-like.
    pub irregular_outline: bool,
    /// Inside the sub-band where real potholes usually land.
    pub ideal_area: bool,
}

impl FeatureVotes {
    pub fn evaluate(region: &CandidateRegion, config: &ClassifierConfig) -> Self {
        Self {
            dark: region.mean_intensity < config.dark_intensity_max,
            plausible_aspect: region.aspect_ratio > config.aspect_min
                && region.aspect_ratio < config.aspect_max,
            irregular_outline: region.circularity > config.circularity_min
                && region.circularity < config.circularity_max,
            ideal_area: region.area > config.ideal_area_min
                && region.area < config.ideal_area_max,
        }
    }

    pub fn score(&self, config: &ClassifierConfig) -> f32 {
        let mut score = 0.0f32;
        if self.dark {
            score += config.dark_weight;
        }
        if self.plausible_aspect {
            score += config.aspect_weight;
        }
        if self.irregular_outline {
            score += config.circularity_weight;
        }
        if self.ideal_area {
            score += config.ideal_area_weight;
        }
        score.clamp(0.0, 1.0)
    }
}

/// Score for a region that already passed the area band.
pub fn score_region(region: &CandidateRegion, config: &ClassifierConfig) -> f32 {
    match config.scoring {
        ScoringScheme::Weighted => FeatureVotes::evaluate(region, config).score(config),
        ScoringScheme::AreaBand => 1.0,
    }
}

/// Strictly above the cutoff; a region sitting exactly on it does not qualify.
pub fn qualifies(score: f32, config: &ClassifierConfig) -> bool {
    score > config.qualify_score
}

/// Map a confidence onto the three-way label.
pub fn band(confidence: f32, config: &ClassifierConfig) -> Label {
    if confidence >= config.pothole_threshold {
        Label::Pothole
    } else if confidence >= config.uncertain_threshold {
        Label::Uncertain
    } else {
        Label::NonPothole
    }
}
