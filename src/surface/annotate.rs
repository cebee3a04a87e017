// src/surface/annotate.rs
//
// Overlay drawing for qualifying regions: outline, bounding box and score.

use super::regions::CandidateRegion;
use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::warn;

const CONTOUR_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

static SCORE_FONT: &[u8] = include_bytes!("../../assets/DejaVuSansMono.ttf");
const TEXT_HEIGHT: f32 = 18.0;
/// Gap between the score text cell and the top of the box.
const TEXT_GAP: i32 = 4;

fn score_font() -> Option<FontRef<'static>> {
    match FontRef::try_from_slice(SCORE_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            warn!("annotate: bundled font unusable ({}), score text skipped", e);
            None
        }
    }
}

/// Outline the contour and box the region on `canvas`, with its score
/// printed just above the box.
pub fn draw_region(canvas: &mut RgbImage, region: &CandidateRegion) {
    // 2x2 brush along the 8-connected outline gives a 2 px stroke.
    for p in &region.contour {
        draw_filled_rect_mut(canvas, Rect::at(p.x, p.y).of_size(2, 2), CONTOUR_COLOR);
    }

    let bbox = region.bbox;
    if bbox.width > 0 && bbox.height > 0 {
        draw_hollow_rect_mut(
            canvas,
            Rect::at(bbox.x, bbox.y).of_size(bbox.width, bbox.height),
            BOX_COLOR,
        );
        if bbox.width > 2 && bbox.height > 2 {
            draw_hollow_rect_mut(
                canvas,
                Rect::at(bbox.x + 1, bbox.y + 1).of_size(bbox.width - 2, bbox.height - 2),
                BOX_COLOR,
            );
        }
    }

    if let Some(font) = score_font() {
        let text_y = (bbox.y - TEXT_HEIGHT as i32 - TEXT_GAP).max(0);
        draw_text_mut(
            canvas,
            TEXT_COLOR,
            bbox.x,
            text_y,
            PxScale::from(TEXT_HEIGHT),
            &font,
            &format!("{:.2}", region.score),
        );
    }
}
