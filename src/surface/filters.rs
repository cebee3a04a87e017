// src/surface/filters.rs
//
// Per-pixel stages of the surface classifier: luminance, denoising,
// the edge channel, the local-darkness channel, fusion and cleanup.
// All masks are 0 / 255 single-channel images.

use super::config::{ContrastChannel, Fusion};
use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::{edges, filter, morphology};

const FOREGROUND: u8 = 255;

/// ITU-R BT.601 luma, the same weighting camera pipelines use for Y.
pub fn luminance(frame: &RgbImage) -> GrayImage {
    GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let [r, g, b] = frame.get_pixel(x, y).0;
        let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Luma([y.round().clamp(0.0, 255.0) as u8])
    })
}

/// Gaussian sigma implied by an odd kernel size.
#[inline]
pub fn kernel_sigma(ksize: u32) -> f32 {
    0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

pub fn gaussian(gray: &GrayImage, ksize: u32) -> GrayImage {
    if ksize <= 1 {
        return gray.clone();
    }
    filter::gaussian_blur_f32(gray, kernel_sigma(ksize))
}

/// Hysteresis edge map on the denoised luminance.
pub fn edge_channel(blurred: &GrayImage, low: f32, high: f32) -> GrayImage {
    edges::canny(blurred, low, high)
}

/// Foreground where a pixel sits at least `offset` below its
/// Gaussian-weighted neighbourhood mean.
pub fn adaptive_channel(blurred: &GrayImage, block: u32, offset: f32) -> GrayImage {
    let local_mean = gaussian(blurred, block);
    GrayImage::from_fn(blurred.width(), blurred.height(), |x, y| {
        let src = blurred.get_pixel(x, y)[0] as f32;
        let mean = local_mean.get_pixel(x, y)[0] as f32;
        if src <= mean - offset {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

/// Foreground where luminance departs from a heavily blurred copy of itself
/// by more than `threshold`, in either direction.
pub fn local_contrast_channel(gray: &GrayImage, ksize: u32, threshold: u8) -> GrayImage {
    let background = gaussian(gray, ksize);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let diff = gray.get_pixel(x, y)[0].abs_diff(background.get_pixel(x, y)[0]);
        if diff > threshold {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

pub fn contrast_channel(
    gray: &GrayImage,
    blurred: &GrayImage,
    channel: ContrastChannel,
    adaptive_block: u32,
    adaptive_offset: f32,
    contrast_kernel: u32,
    contrast_threshold: u8,
) -> GrayImage {
    match channel {
        ContrastChannel::Adaptive => adaptive_channel(blurred, adaptive_block, adaptive_offset),
        ContrastChannel::LocalContrast => {
            local_contrast_channel(gray, contrast_kernel, contrast_threshold)
        }
    }
}

pub fn fuse(edges: &GrayImage, contrast: &GrayImage, fusion: Fusion) -> GrayImage {
    GrayImage::from_fn(edges.width(), edges.height(), |x, y| {
        let e = edges.get_pixel(x, y)[0] > 0;
        let c = contrast.get_pixel(x, y)[0] > 0;
        let on = match fusion {
            Fusion::Or => e || c,
            Fusion::And => e && c,
        };
        Luma([if on { FOREGROUND } else { 0 }])
    })
}

#[inline]
fn radius_of(ksize: u32) -> u8 {
    (ksize / 2).min(u8::MAX as u32) as u8
}

/// Thickens the one-pixel Canny trace into a band as wide as the
/// cleanup element, so an AND with the contrast channel keeps a
/// closed ring around the dark region instead of a broken hairline.
pub fn widen_edges(edges: &GrayImage, ksize: u32) -> GrayImage {
    match radius_of(ksize) {
        0 => edges.clone(),
        radius => morphology::dilate(edges, Norm::LInf, radius),
    }
}

/// Close (bridge fragmented edges) then open (drop speckle) with a square
/// structuring element of side `ksize`.
///
/// The AND mask is already sparse and only a few pixels wide, so it is
/// closed but never opened.
pub fn clean(mask: &GrayImage, ksize: u32, fusion: Fusion) -> GrayImage {
    let radius = radius_of(ksize);
    if radius == 0 {
        return mask.clone();
    }
    let closed = morphology::close(mask, Norm::LInf, radius);
    match fusion {
        Fusion::Or => morphology::open(&closed, Norm::LInf, radius),
        Fusion::And => closed,
    }
}
