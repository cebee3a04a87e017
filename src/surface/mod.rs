// src/surface/mod.rs
//
// Road surface classifier.
//
// Signal flow:
//   RGB frame → luminance → blur ─┬→ edge channel ─────┐
//                                 └→ contrast channel ──┴→ fuse → close/open
//   (AND fusion widens the edge trace first and skips the opening)
//   cleaned mask → outer contours → area band → feature votes → score
//   best qualifying score → confidence band → Label
//
// Pure: the same frame always yields the same result, and there is no
// failure path. "Nothing found" is NonPothole at 0.0.

pub mod annotate;
pub mod config;
pub mod filters;
pub mod regions;
pub mod scoring;

pub use config::{ClassifierConfig, Fusion};
pub use regions::CandidateRegion;

use crate::types::{CapturedFrame, DetectionResult, Label};
use tracing::debug;

/// Frames smaller than this in either dimension cannot hold a candidate.
const MIN_FRAME_SIDE: u32 = 3;

pub struct SurfaceClassifier {
    config: ClassifierConfig,
}

impl SurfaceClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Scored regions that passed the area band, in contour order.
    pub fn analyze(&self, frame: &CapturedFrame) -> Vec<CandidateRegion> {
        let cfg = &self.config;
        let image = &frame.image;
        if image.width() < MIN_FRAME_SIDE || image.height() < MIN_FRAME_SIDE {
            return Vec::new();
        }

        let gray = filters::luminance(image);
        let blurred = filters::gaussian(&gray, cfg.blur_kernel);
        let mut edges = filters::edge_channel(&blurred, cfg.canny_low, cfg.canny_high);
        if cfg.fusion == Fusion::And {
            edges = filters::widen_edges(&edges, cfg.morph_kernel);
        }
        let contrast = filters::contrast_channel(
            &gray,
            &blurred,
            cfg.contrast_channel,
            cfg.adaptive_block,
            cfg.adaptive_offset,
            cfg.contrast_blur_kernel,
            cfg.contrast_threshold,
        );
        let fused = filters::fuse(&edges, &contrast, cfg.fusion);
        let cleaned = filters::clean(&fused, cfg.morph_kernel, cfg.fusion);

        let mut regions = regions::extract_regions(&cleaned, &gray, cfg.area_min, cfg.area_max);
        for region in &mut regions {
            region.score = scoring::score_region(region, cfg);
        }
        regions
    }

    pub fn classify(&self, frame: &CapturedFrame) -> DetectionResult {
        let regions = self.analyze(frame);
        let mut annotated = frame.image.clone();

        let mut best: Option<f32> = None;
        let mut qualifying = 0usize;
        for region in &regions {
            debug!(
                "region at ({}, {}) {}x{}: area={:.0} aspect={:.2} circ={:.2} mean={:.1} score={:.2}",
                region.bbox.x,
                region.bbox.y,
                region.bbox.width,
                region.bbox.height,
                region.area,
                region.aspect_ratio,
                region.circularity,
                region.mean_intensity,
                region.score
            );
            if !scoring::qualifies(region.score, &self.config) {
                continue;
            }
            qualifying += 1;
            annotate::draw_region(&mut annotated, region);
            best = Some(best.map_or(region.score, |b| b.max(region.score)));
        }

        let (label, confidence) = match best {
            Some(confidence) => (scoring::band(confidence, &self.config), confidence),
            None => (Label::NonPothole, 0.0),
        };

        debug!(
            "{} region(s) in band, {} qualifying → {} ({:.2})",
            regions.len(),
            qualifying,
            label,
            confidence
        );

        DetectionResult {
            label,
            confidence,
            annotated,
            qualifying_regions: qualifying,
        }
    }
}
