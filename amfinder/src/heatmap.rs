//! Heatmap rendering for class activation maps.
//!
//! Turns a raw activation map into a coloured tile-sized image and blends it
//! over a desaturated copy of the tile.

use clap::ValueEnum;
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::map::map_colors;
use ndarray::{Array2, ArrayView3};
use serde::{Deserialize, Serialize};

/// Added to the normalization denominator so uniform maps stay finite.
pub const NORMALIZE_EPSILON: f32 = 1e-10;

/// Heatmap weight in the final blend; the background gets the rest.
pub const HEATMAP_WEIGHT: f32 = 0.4;

/// Channel weights `[r, g, b]` of the background grayscale conversion.
/// Red and blue weights are swapped relative to Rec. 601 luma, matching
/// existing amfinder CAM output.
pub const BACKGROUND_LUMA: [f32; 3] = [0.114, 0.587, 0.299];

/// Contrast gain and bias applied to the grayscale background.
pub const BACKGROUND_GAIN: f32 = 1.5;
pub const BACKGROUND_BIAS: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ColorMap {
    #[default]
    Jet,
    Hot,
    Turbo,
    Bone,
}

/// Palettes for best-match and other classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeatmapStyle {
    pub best_match: ColorMap,
    pub other: ColorMap,
}

impl Default for HeatmapStyle {
    fn default() -> Self {
        Self {
            best_match: ColorMap::Jet,
            other: ColorMap::Bone,
        }
    }
}

impl HeatmapStyle {
    pub fn with_best_match(best_match: ColorMap) -> Self {
        Self {
            best_match,
            ..Self::default()
        }
    }

    pub fn colormap_for(&self, is_best_match: bool) -> ColorMap {
        if is_best_match {
            self.best_match
        } else {
            self.other
        }
    }
}

/// Sample `data` at fractional column `u` and row `v`, clamped to the edges.
/// An empty map samples as zero.
fn bilinear_sample(data: &Array2<f32>, u: f32, v: f32) -> f32 {
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 {
        return 0.0;
    }

    let u = u.clamp(0.0, (cols - 1) as f32);
    let v = v.clamp(0.0, (rows - 1) as f32);

    let u0 = u.floor() as usize;
    let v0 = v.floor() as usize;
    let u1 = (u0 + 1).min(cols - 1);
    let v1 = (v0 + 1).min(rows - 1);

    let fu = u - u0 as f32;
    let fv = v - v0 as f32;

    let top = data[[v0, u0]] * (1.0 - fu) + data[[v0, u1]] * fu;
    let bottom = data[[v1, u0]] * (1.0 - fu) + data[[v1, u1]] * fu;

    top * (1.0 - fv) + bottom * fv
}

/// Bilinear resize with pixel centres aligned between source and target.
pub fn resize_bilinear(data: &Array2<f32>, width: usize, height: usize) -> Array2<f32> {
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 {
        return Array2::zeros((height, width));
    }
    let sx = cols as f32 / width as f32;
    let sy = rows as f32 / height as f32;
    Array2::from_shape_fn((height, width), |(y, x)| {
        let u = (x as f32 + 0.5) * sx - 0.5;
        let v = (y as f32 + 0.5) * sy - 0.5;
        bilinear_sample(data, u, v)
    })
}

/// Min-max normalize to 8-bit intensities (truncating).
pub fn normalize_to_u8(data: &Array2<f32>) -> Array2<u8> {
    let min = data.iter().copied().fold(f32::INFINITY, f32::min);
    let max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let denom = max - min + NORMALIZE_EPSILON;
    data.mapv(|v| {
        let t = ((v - min) / denom).clamp(0.0, 1.0);
        (t * 255.0) as u8
    })
}

/// Colour for a normalized value in [0, 1].
pub fn apply_colormap(value: f32, colormap: ColorMap) -> Rgb<u8> {
    let t = value.clamp(0.0, 1.0);
    let (r, g, b) = match colormap {
        ColorMap::Jet => jet(t),
        ColorMap::Hot => hot(t),
        ColorMap::Turbo => turbo(t),
        ColorMap::Bone => bone(t),
    };
    Rgb([to_u8(r), to_u8(g), to_u8(b)])
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

// dark blue -> blue -> cyan -> yellow -> red -> dark red
fn jet(t: f32) -> (f32, f32, f32) {
    let channel = |offset: f32| (1.5 - (4.0 * t - offset).abs()).clamp(0.0, 1.0);
    (channel(3.0), channel(2.0), channel(1.0))
}

// black -> red -> yellow -> white
fn hot(t: f32) -> (f32, f32, f32) {
    (
        (3.0 * t).clamp(0.0, 1.0),
        (3.0 * t - 1.0).clamp(0.0, 1.0),
        (3.0 * t - 2.0).clamp(0.0, 1.0),
    )
}

// blue -> cyan -> green -> yellow -> red (approximation)
fn turbo(t: f32) -> (f32, f32, f32) {
    (
        ((6.0 * t - 3.0) * t * t).clamp(0.0, 1.0),
        (-4.0 * (t - 0.5).powi(2) + 1.0).clamp(0.0, 1.0),
        ((-6.0 * t + 3.0) * (1.0 - t)).clamp(0.0, 1.0),
    )
}

// grayscale with a blue tint: 7/8 gray plus 1/8 reversed hot
fn bone(t: f32) -> (f32, f32, f32) {
    let (hr, hg, hb) = hot(t);
    (
        (7.0 * t + hb) / 8.0,
        (7.0 * t + hg) / 8.0,
        (7.0 * t + hr) / 8.0,
    )
}

/// Colour a raw activation map at `edge × edge` pixels.
pub fn render_heatmap(
    cam: &Array2<f32>,
    is_best_match: bool,
    edge: u32,
    style: &HeatmapStyle,
) -> RgbImage {
    let resized = resize_bilinear(cam, edge as usize, edge as usize);
    let intensities = normalize_to_u8(&resized);
    let gray = GrayImage::from_fn(edge, edge, |x, y| Luma([intensities[[y as usize, x as usize]]]));
    let colormap = style.colormap_for(is_best_match);
    map_colors(&gray, |Luma([v])| apply_colormap(v as f32 / 255.0, colormap))
}

/// Desaturated, contrast-boosted copy of a normalized `[h, w, 3]` tile.
pub fn muted_background(tile: ArrayView3<f32>) -> GrayImage {
    let (height, width, _) = tile.dim();
    let gray = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let level = |channel: usize| f32::from((tile[[y, x, channel]] * 255.0) as u8);
        let [wr, wg, wb] = BACKGROUND_LUMA;
        let v = wr * level(0) + wg * level(1) + wb * level(2);
        Luma([v.round().clamp(0.0, 255.0) as u8])
    });
    map_colors(&gray, |Luma([v])| {
        Luma([(BACKGROUND_GAIN * v as f32 + BACKGROUND_BIAS)
            .abs()
            .round()
            .min(255.0) as u8])
    })
}

/// Weighted blend of a heatmap over a grayscale background.
pub fn blend_over(heatmap: &RgbImage, background: &GrayImage) -> RgbImage {
    RgbImage::from_fn(heatmap.width(), heatmap.height(), |x, y| {
        let h = heatmap.get_pixel(x, y);
        let Luma([b]) = *background.get_pixel(x, y);
        let mix = |c: u8| {
            (HEATMAP_WEIGHT * c as f32 + (1.0 - HEATMAP_WEIGHT) * b as f32)
                .round()
                .min(255.0) as u8
        };
        Rgb([mix(h[0]), mix(h[1]), mix(h[2])])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_bilinear_sample_corners_and_clamping() {
        let data = Array2::from_shape_fn((4, 4), |(i, j)| (i * 4 + j) as f32);
        assert_eq!(bilinear_sample(&data, 0.0, 0.0), 0.0);
        assert_eq!(bilinear_sample(&data, 3.0, 3.0), 15.0);
        assert_eq!(bilinear_sample(&data, -2.0, -2.0), 0.0);
        assert_eq!(bilinear_sample(&data, 9.0, 9.0), 15.0);
        assert!((bilinear_sample(&data, 0.5, 0.0) - 0.5).abs() < 1e-6);

        let empty = Array2::<f32>::zeros((0, 3));
        assert_eq!(bilinear_sample(&empty, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_resize_bilinear_preserves_constant_and_size() {
        let data = Array2::from_elem((3, 5), 2.5f32);
        let resized = resize_bilinear(&data, 32, 20);
        assert_eq!(resized.dim(), (20, 32));
        assert!(resized.iter().all(|&v| (v - 2.5).abs() < 1e-6));
    }

    #[test]
    fn test_resize_bilinear_upscales_gradient_monotonically() {
        let data = array![[0.0f32, 1.0]];
        let resized = resize_bilinear(&data, 8, 1);
        let row: Vec<f32> = resized.row(0).to_vec();
        assert_eq!(row[0], 0.0);
        assert_eq!(row[7], 1.0);
        assert!(row.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_normalize_constant_map_has_no_nan() {
        for value in [0.0f32, 3.7, -1e6, 1e-30] {
            let data = Array2::from_elem((4, 4), value);
            let out = normalize_to_u8(&data);
            assert!(out.iter().all(|&v| v == 0));
        }
    }

    #[test]
    fn test_normalize_spans_full_range() {
        let data = array![[-2.0f32, 0.0], [1.0, 2.0]];
        let out = normalize_to_u8(&data);
        assert_eq!(out[[0, 0]], 0);
        assert!(out[[1, 1]] >= 254);
        assert!(out[[0, 1]] > 100 && out[[0, 1]] < 140);
    }

    #[test]
    fn test_colormap_endpoints() {
        assert_eq!(apply_colormap(0.0, ColorMap::Hot), Rgb([0, 0, 0]));
        assert_eq!(apply_colormap(1.0, ColorMap::Hot), Rgb([255, 255, 255]));
        assert_eq!(apply_colormap(0.0, ColorMap::Bone), Rgb([0, 0, 0]));
        assert_eq!(apply_colormap(1.0, ColorMap::Bone), Rgb([255, 255, 255]));
        // jet runs from dark blue to dark red
        let low = apply_colormap(0.0, ColorMap::Jet);
        let high = apply_colormap(1.0, ColorMap::Jet);
        assert!(low[2] > 100 && low[0] == 0);
        assert!(high[0] > 100 && high[2] == 0);
    }

    #[test]
    fn test_bone_is_nearly_gray() {
        for i in 0..=10 {
            let Rgb([r, g, b]) = apply_colormap(i as f32 / 10.0, ColorMap::Bone);
            assert!(b >= g && g >= r);
            assert!((b as i32 - r as i32) <= 40);
        }
    }

    #[test]
    fn test_render_heatmap_size_and_palette_choice() {
        let cam = array![[0.0f32, 1.0], [2.0, 3.0]];
        let style = HeatmapStyle::default();
        let best = render_heatmap(&cam, true, 16, &style);
        let other = render_heatmap(&cam, false, 16, &style);
        assert_eq!(best.dimensions(), (16, 16));
        assert_ne!(best, other);
        // bottom-right holds the maximum: red in jet, near white in bone
        assert!(best.get_pixel(15, 15)[0] > 100);
        assert!(other.get_pixel(15, 15)[0] > 200);
    }

    #[test]
    fn test_render_heatmap_uniform_map() {
        let cam = Array2::from_elem((3, 3), 0.42f32);
        let img = render_heatmap(&cam, true, 8, &HeatmapStyle::default());
        let first = *img.get_pixel(0, 0);
        assert!(img.pixels().all(|p| *p == first));
        assert_eq!(first, apply_colormap(0.0, ColorMap::Jet));
    }

    #[test]
    fn test_muted_background_boosts_contrast() {
        let tile = Array3::from_elem((2, 2, 3), 0.5f32);
        let bg = muted_background(tile.view());
        // 127.5 truncates to 127, then 1.5 * 127 + 0.8 = 191.3 -> 191
        assert!(bg.pixels().all(|p| p[0] == 191));

        // red weighs 0.114: 29.07 -> 29, 1.5 * 29 + 0.8 = 44.3 -> 44
        let mut red = Array3::zeros((1, 1, 3));
        red[[0, 0, 0]] = 1.0f32;
        assert_eq!(muted_background(red.view()).get_pixel(0, 0)[0], 44);

        // blue weighs 0.299: 76.245 -> 76, 1.5 * 76 + 0.8 = 114.8 -> 115
        let mut blue = Array3::zeros((1, 1, 3));
        blue[[0, 0, 2]] = 1.0f32;
        assert_eq!(muted_background(blue.view()).get_pixel(0, 0)[0], 115);

        let bright = Array3::from_elem((1, 1, 3), 1.0f32);
        assert_eq!(muted_background(bright.view()).get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn test_blend_weights() {
        let heat = RgbImage::from_pixel(1, 1, Rgb([200, 0, 100]));
        let bg = GrayImage::from_pixel(1, 1, Luma([50]));
        let out = blend_over(&heat, &bg);
        // 0.4 * 200 + 0.6 * 50 = 110, 0.6 * 50 = 30, 0.4 * 100 + 30 = 70
        assert_eq!(*out.get_pixel(0, 0), Rgb([110, 30, 70]));
    }
}
