//! DeltaMetrics - Pure Frame Comparison Statistics
//!
//! ## Responsibilities
//!
//! - Motion/occlusion score between two frames within an ROI
//! - Inventory change score between a pre and post frame
//! - Normalized-ROI to pixel-rect mapping
//!
//! No I/O and no device state; every function is deterministic for
//! identical inputs.

use crate::error::{Error, Result};
use crate::models::Roi;
use image::GrayImage;

/// Number of bins for the luma histogram distance
const HISTOGRAM_BINS: usize = 64;

/// Weight of the raw pixel-difference term in the inventory delta score
const PIXEL_WEIGHT: f32 = 0.6;

/// Weight of the histogram-distance term in the inventory delta score
const HISTOGRAM_WEIGHT: f32 = 0.4;

/// Rectangle in normalized [0,1] coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl NormRect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// The full frame
    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    fn contains(&self, nx: f32, ny: f32) -> bool {
        nx >= self.x && nx < self.x + self.w && ny >= self.y && ny < self.y + self.h
    }
}

impl From<&Roi> for NormRect {
    fn from(roi: &Roi) -> Self {
        Self::new(roi.x, roi.y, roi.w, roi.h)
    }
}

/// Pixel-space rectangle, end-exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelRect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

/// Map a normalized rect onto an image, validating it covers at least one pixel.
fn to_pixel_rect(rect: &NormRect, width: u32, height: u32) -> Result<PixelRect> {
    if !(0.0..=1.0).contains(&rect.x)
        || !(0.0..=1.0).contains(&rect.y)
        || rect.w <= 0.0
        || rect.h <= 0.0
        || rect.x + rect.w > 1.0 + f32::EPSILON
        || rect.y + rect.h > 1.0 + f32::EPSILON
    {
        return Err(Error::Validation(format!(
            "roi out of bounds: x={} y={} w={} h={}",
            rect.x, rect.y, rect.w, rect.h
        )));
    }

    let x0 = (rect.x * width as f32).floor() as u32;
    let y0 = (rect.y * height as f32).floor() as u32;
    let x1 = (((rect.x + rect.w) * width as f32).ceil() as u32).min(width);
    let y1 = (((rect.y + rect.h) * height as f32).ceil() as u32).min(height);

    if x1 <= x0 || y1 <= y0 {
        return Err(Error::Validation(format!(
            "roi degenerates to zero pixels on {}x{} frame",
            width, height
        )));
    }

    Ok(PixelRect { x0, y0, x1, y1 })
}

/// Collect luma values of ROI pixels, skipping pixels inside any ignore rect.
fn roi_pixels(img: &GrayImage, rect: PixelRect, ignore: &[NormRect]) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut out = Vec::with_capacity(((rect.x1 - rect.x0) * (rect.y1 - rect.y0)) as usize);
    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let nx = x as f32 / width as f32;
            let ny = y as f32 / height as f32;
            if ignore.iter().any(|r| r.contains(nx, ny)) {
                continue;
            }
            out.push(img.get_pixel(x, y)[0] as f32);
        }
    }
    out
}

fn check_same_dimensions(a: &GrayImage, b: &GrayImage) -> Result<()> {
    if a.dimensions() != b.dimensions() {
        return Err(Error::Validation(format!(
            "frame dimensions differ: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }
    Ok(())
}

/// Motion/occlusion score between two frames within `roi`, in [0,1].
///
/// Mean-subtracted absolute luma difference, normalized by ROI pixel count
/// and dynamic range, so a global brightness shift (sunlight, auto-exposure)
/// scores near zero while a local occlusion scores high. Pixels inside any
/// `ignore` rect are excluded.
pub fn motion_score(
    a: &GrayImage,
    b: &GrayImage,
    roi: &NormRect,
    ignore: &[NormRect],
) -> Result<f32> {
    check_same_dimensions(a, b)?;
    let rect = to_pixel_rect(roi, a.width(), a.height())?;

    let pa = roi_pixels(a, rect, ignore);
    let pb = roi_pixels(b, rect, ignore);
    if pa.is_empty() {
        return Err(Error::Validation(
            "roi fully covered by ignore regions".to_string(),
        ));
    }

    let mean_a: f32 = pa.iter().sum::<f32>() / pa.len() as f32;
    let mean_b: f32 = pb.iter().sum::<f32>() / pb.len() as f32;

    let sum: f32 = pa
        .iter()
        .zip(pb.iter())
        .map(|(va, vb)| ((va - mean_a) - (vb - mean_b)).abs())
        .sum();

    Ok((sum / (pa.len() as f32 * 255.0)).clamp(0.0, 1.0))
}

/// Normalized L1 histogram distance over ROI luma values, in [0,1].
fn histogram_distance(pa: &[f32], pb: &[f32]) -> f32 {
    let mut ha = [0f32; HISTOGRAM_BINS];
    let mut hb = [0f32; HISTOGRAM_BINS];
    let scale = HISTOGRAM_BINS as f32 / 256.0;
    for v in pa {
        ha[((v * scale) as usize).min(HISTOGRAM_BINS - 1)] += 1.0;
    }
    for v in pb {
        hb[((v * scale) as usize).min(HISTOGRAM_BINS - 1)] += 1.0;
    }
    let na = pa.len() as f32;
    let nb = pb.len() as f32;
    let l1: f32 = ha
        .iter()
        .zip(hb.iter())
        .map(|(ca, cb)| (ca / na - cb / nb).abs())
        .sum();
    // L1 distance of two probability distributions is at most 2
    (l1 / 2.0).clamp(0.0, 1.0)
}

/// Inventory change score between a pre and post frame within `roi`, in [0,1].
///
/// Combines two independent signals as a weighted average:
/// `0.6 * mean absolute pixel difference + 0.4 * histogram distance`.
/// The pixel term reacts to a localized object appearing or vanishing; the
/// histogram term reacts to overall content change while tolerating small
/// spatial shifts. A weighted average (rather than max) keeps the score
/// smooth under threshold tuning.
pub fn inventory_delta_score(pre: &GrayImage, post: &GrayImage, roi: &NormRect) -> Result<f32> {
    check_same_dimensions(pre, post)?;
    let rect = to_pixel_rect(roi, pre.width(), pre.height())?;

    let pa = roi_pixels(pre, rect, &[]);
    let pb = roi_pixels(post, rect, &[]);

    let pixel_delta: f32 = pa
        .iter()
        .zip(pb.iter())
        .map(|(va, vb)| (va - vb).abs())
        .sum::<f32>()
        / (pa.len() as f32 * 255.0);

    let hist_delta = histogram_distance(&pa, &pb);

    Ok((PIXEL_WEIGHT * pixel_delta + HISTOGRAM_WEIGHT * hist_delta).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: u32, height: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(width, height, image::Luma([value]))
    }

    /// Left half one value, right half another
    fn split(width: u32, height: u32, left: u8, right: u8) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                image::Luma([left])
            } else {
                image::Luma([right])
            }
        })
    }

    #[test]
    fn test_identical_frames_score_zero() {
        let a = flat(64, 64, 100);
        let score = motion_score(&a, &a, &NormRect::full(), &[]).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_global_brightness_shift_scores_zero() {
        let a = flat(64, 64, 100);
        let b = flat(64, 64, 160);
        let score = motion_score(&a, &b, &NormRect::full(), &[]).unwrap();
        assert!(score < 0.01, "brightness shift scored {}", score);
    }

    #[test]
    fn test_local_change_scores_high() {
        let a = flat(64, 64, 100);
        let b = split(64, 64, 100, 230);
        let score = motion_score(&a, &b, &NormRect::full(), &[]).unwrap();
        assert!(score > 0.2, "local change scored {}", score);
    }

    #[test]
    fn test_roi_restricts_computation() {
        let a = flat(64, 64, 100);
        // change only the right half, then score the left half
        let b = split(64, 64, 100, 230);
        let left = NormRect::new(0.0, 0.0, 0.5, 1.0);
        let score = motion_score(&a, &b, &left, &[]).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_ignore_rect_masks_change() {
        let a = flat(64, 64, 100);
        let b = split(64, 64, 100, 230);
        let right = NormRect::new(0.5, 0.0, 0.5, 1.0);
        let score = motion_score(&a, &b, &NormRect::full(), &[right]).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_degenerate_roi_rejected() {
        let a = flat(8, 8, 0);
        assert!(motion_score(&a, &a, &NormRect::new(0.2, 0.2, 0.0, 0.5), &[]).is_err());
        assert!(motion_score(&a, &a, &NormRect::new(0.9, 0.0, 0.5, 1.0), &[]).is_err());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let a = flat(8, 8, 0);
        let b = flat(16, 16, 0);
        assert!(motion_score(&a, &b, &NormRect::full(), &[]).is_err());
    }

    #[test]
    fn test_inventory_delta_identical_is_zero() {
        let a = split(64, 64, 40, 200);
        let score = inventory_delta_score(&a, &a, &NormRect::full()).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_inventory_delta_detects_removal() {
        // object (bright region) present pre, gone post
        let pre = split(64, 64, 40, 200);
        let post = flat(64, 64, 40);
        let score = inventory_delta_score(&pre, &post, &NormRect::full()).unwrap();
        assert!(score > 0.25, "removal scored {}", score);
    }

    #[test]
    fn test_deterministic() {
        let pre = split(64, 64, 10, 250);
        let post = flat(64, 64, 128);
        let s1 = inventory_delta_score(&pre, &post, &NormRect::full()).unwrap();
        let s2 = inventory_delta_score(&pre, &post, &NormRect::full()).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_scores_bounded() {
        let pre = flat(32, 32, 0);
        let post = flat(32, 32, 255);
        let m = motion_score(&pre, &post, &NormRect::full(), &[]).unwrap();
        let d = inventory_delta_score(&pre, &post, &NormRect::full()).unwrap();
        assert!((0.0..=1.0).contains(&m));
        assert!((0.0..=1.0).contains(&d));
    }
}
