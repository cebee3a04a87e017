// src/surface/regions.rs
//
// Region extraction: outermost contours of the cleaned mask and the
// shape/intensity features the scorer votes on.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::drawing::draw_polygon_mut;
use imageproc::geometry::arc_length;
use imageproc::point::Point;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// A connected footprint on the fused mask. Lives for one classify call.
#[derive(Debug, Clone)]
pub struct CandidateRegion {
    pub contour: Vec<Point<i32>>,
    pub bbox: BoundingBox,
    pub area: f32,
    pub aspect_ratio: f32,
    pub circularity: f32,
    pub mean_intensity: f32,
    pub score: f32,
}

/// Shoelace area of a closed polygon.
pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        twice_area += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    (twice_area as f64).abs() / 2.0
}

pub fn bounding_box(points: &[Point<i32>]) -> BoundingBox {
    let min_x = points.iter().map(|p| p.x).min().unwrap_or(0);
    let max_x = points.iter().map(|p| p.x).max().unwrap_or(-1);
    let min_y = points.iter().map(|p| p.y).min().unwrap_or(0);
    let max_y = points.iter().map(|p| p.y).max().unwrap_or(-1);
    BoundingBox {
        x: min_x,
        y: min_y,
        width: (max_x - min_x + 1).max(0) as u32,
        height: (max_y - min_y + 1).max(0) as u32,
    }
}

/// Width over height; 0 when the box has no height.
pub fn aspect_ratio(bbox: &BoundingBox) -> f32 {
    if bbox.height == 0 {
        0.0
    } else {
        bbox.width as f32 / bbox.height as f32
    }
}

/// 4π·area / perimeter². 1.0 for a disc, lower for elongated or ragged outlines.
pub fn circularity(area: f64, perimeter: f64) -> f64 {
    if perimeter <= 0.0 {
        return 0.0;
    }
    4.0 * PI * area / (perimeter * perimeter)
}

/// Mean luminance over the filled contour (outline included).
pub fn mean_inside(gray: &GrayImage, contour: &[Point<i32>], bbox: &BoundingBox) -> f32 {
    if bbox.width == 0 || bbox.height == 0 {
        return 0.0;
    }

    let mut local = GrayImage::new(bbox.width, bbox.height);
    let mut shifted: Vec<Point<i32>> = contour
        .iter()
        .map(|p| Point::new(p.x - bbox.x, p.y - bbox.y))
        .collect();
    shifted.dedup();
    if shifted.len() > 1 && shifted.first() == shifted.last() {
        shifted.pop();
    }

    if shifted.len() >= 3 {
        draw_polygon_mut(&mut local, &shifted, Luma([255u8]));
    }
    for p in &shifted {
        if p.x >= 0 && p.y >= 0 && (p.x as u32) < bbox.width && (p.y as u32) < bbox.height {
            local.put_pixel(p.x as u32, p.y as u32, Luma([255u8]));
        }
    }

    let mut sum = 0u64;
    let mut count = 0u64;
    for (lx, ly, m) in local.enumerate_pixels() {
        if m[0] == 0 {
            continue;
        }
        let gx = bbox.x + lx as i32;
        let gy = bbox.y + ly as i32;
        if gx < 0 || gy < 0 || gx as u32 >= gray.width() || gy as u32 >= gray.height() {
            continue;
        }
        sum += gray.get_pixel(gx as u32, gy as u32)[0] as u64;
        count += 1;
    }

    if count == 0 {
        0.0
    } else {
        (sum as f64 / count as f64) as f32
    }
}

/// Outermost contours of `mask` whose area falls inside `[area_min, area_max]`,
/// with their features computed against `gray`. Scores are left at zero.
pub fn extract_regions(
    mask: &GrayImage,
    gray: &GrayImage,
    area_min: f32,
    area_max: f32,
) -> Vec<CandidateRegion> {
    let mut regions = Vec::new();

    for contour in find_contours::<i32>(mask) {
        if contour.border_type != BorderType::Outer || contour.parent.is_some() {
            continue;
        }

        let area = polygon_area(&contour.points);
        if (area as f32) < area_min || (area as f32) > area_max {
            continue;
        }

        let perimeter = arc_length(&contour.points, true);
        if perimeter <= 0.0 {
            continue;
        }

        let bbox = bounding_box(&contour.points);
        let mean_intensity = mean_inside(gray, &contour.points, &bbox);

        regions.push(CandidateRegion {
            bbox,
            area: area as f32,
            aspect_ratio: aspect_ratio(&bbox),
            circularity: circularity(area, perimeter) as f32,
            mean_intensity,
            score: 0.0,
            contour: contour.points,
        });
    }

    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_rect(w: u32, h: u32, x0: u32, y0: u32, rw: u32, rh: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if x >= x0 && x < x0 + rw && y >= y0 && y < y0 + rh {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn test_polygon_area_square() {
        let square = vec![
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(polygon_area(&square), 100.0);
        assert_eq!(polygon_area(&square[..2]), 0.0);
    }

    #[test]
    fn test_aspect_ratio_zero_height() {
        let bbox = BoundingBox {
            x: 0,
            y: 0,
            width: 10,
            height: 0,
        };
        assert_eq!(aspect_ratio(&bbox), 0.0);
    }

    #[test]
    fn test_circularity_bounds() {
        // Ideal disc of radius 10.
        let r = 10.0;
        let c = circularity(PI * r * r, 2.0 * PI * r);
        assert!((c - 1.0).abs() < 1e-9);
        // Thin 100x1 strip.
        assert!(circularity(100.0, 202.0) < 0.05);
        assert_eq!(circularity(50.0, 0.0), 0.0);
    }

    #[test]
    fn test_extract_single_rectangle() {
        let mask = filled_rect(200, 200, 50, 60, 80, 40);
        let gray = GrayImage::from_fn(200, 200, |x, y| {
            if (50..130).contains(&x) && (60..100).contains(&y) {
                Luma([70])
            } else {
                Luma([200])
            }
        });

        let regions = extract_regions(&mask, &gray, 500.0, 50_000.0);
        assert_eq!(regions.len(), 1);

        let r = &regions[0];
        assert_eq!(
            r.bbox,
            BoundingBox {
                x: 50,
                y: 60,
                width: 80,
                height: 40
            }
        );
        // Pixel-centre outline: (80-1) x (40-1).
        assert!((r.area - 79.0 * 39.0).abs() < 1.0);
        assert!((r.aspect_ratio - 2.0).abs() < 1e-6);
        assert!((r.mean_intensity - 70.0).abs() < 1e-3);
        assert!(r.circularity > 0.6 && r.circularity < 0.7);
    }

    #[test]
    fn test_area_band_filters_small_and_nested() {
        let mut mask = filled_rect(200, 200, 20, 20, 120, 120);
        // Punch a hole with an island inside: the island is not external.
        for y in 50..110 {
            for x in 50..110 {
                mask.put_pixel(x, y, Luma([0]));
            }
        }
        for y in 70..90 {
            for x in 70..90 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        // Speck well below the band.
        for y in 170..175 {
            for x in 170..175 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }

        let gray = GrayImage::from_pixel(200, 200, Luma([90]));
        let regions = extract_regions(&mask, &gray, 200.0, 50_000.0);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bbox.width, 120);
    }
}
