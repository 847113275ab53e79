//! Color statistics used to compare smoky, clear and desmoked image sets.
//!
//! Values follow the 8-bit conventions of common vision libraries: hue in
//! `[0, 180)` and CIELAB a* offset by 128, both rounded per pixel before
//! averaging.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::is_image_file;
use crate::error::{DesmokeError, Result};

/// D65 reference white, X component (Y is 1).
const WHITE_X: f64 = 0.950456;
const LAB_EPSILON: f64 = 0.008856;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorStats {
    pub mean_hue: f64,
    pub mean_a: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_dark_channel: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStats {
    pub image_path: PathBuf,
    #[serde(flatten)]
    pub stats: ColorStats,
}

impl fmt::Display for ImageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image: {}, Mean Hue: {:.2}, Mean a*: {:.2}",
            self.image_path.display(),
            self.stats.mean_hue,
            self.stats.mean_a
        )?;
        if let Some(dark) = self.stats.mean_dark_channel {
            write!(f, ", Mean dark channel: {dark:.4}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Range {
    fn of(values: impl Iterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }
        (count > 0).then(|| Self {
            min,
            max,
            mean: sum / count as f64,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverallStats {
    pub hue: Range,
    pub a: Range,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dark_channel: Option<Range>,
}

impl fmt::Display for OverallStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Overall Statistics:")?;
        write!(
            f,
            "Hue - Min: {:.2}, Max: {:.2}, Mean: {:.2}\na*  - Min: {:.2}, Max: {:.2}, Mean: {:.2}",
            self.hue.min, self.hue.max, self.hue.mean, self.a.min, self.a.max, self.a.mean
        )?;
        if let Some(dark) = &self.dark_channel {
            write!(
                f,
                "\nDC  - Min: {:.4}, Max: {:.4}, Mean: {:.4}",
                dark.min, dark.max, dark.mean
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub images: Vec<ImageStats>,
    pub overall: OverallStats,
}

impl StatsReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 8-bit hue of one sRGB pixel: degrees / 2, so `[0, 180)`.
pub fn hue_u8(r: u8, g: u8, b: u8) -> u8 {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let max = r.max(g).max(b);
    let diff = max - r.min(g).min(b);
    if diff == 0.0 {
        return 0;
    }
    let mut hue = if max == r {
        60.0 * (g - b) / diff
    } else if max == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if hue < 0.0 {
        hue += 360.0;
    }
    let half = (hue / 2.0).round();
    if half >= 180.0 {
        0
    } else {
        half as u8
    }
}

fn srgb_to_linear(c: u8) -> f64 {
    let c = c as f64 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn lab_f(t: f64) -> f64 {
    if t > LAB_EPSILON {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

/// 8-bit CIELAB a* of one sRGB pixel under D65, offset by 128.
pub fn lab_a_u8(r: u8, g: u8, b: u8) -> u8 {
    let (r, g, b) = (srgb_to_linear(r), srgb_to_linear(g), srgb_to_linear(b));
    let x = (0.412453 * r + 0.357580 * g + 0.180423 * b) / WHITE_X;
    let y = 0.212671 * r + 0.715160 * g + 0.072169 * b;
    let a = 500.0 * (lab_f(x) - lab_f(y)) + 128.0;
    a.round().clamp(0.0, 255.0) as u8
}

/// `[H, W, 3]` RGB array in `[0, 1]`.
fn load_rgb(path: &Path) -> Result<Array3<f32>> {
    let img = image::open(path)?.to_rgb8();
    let (width, height) = (img.width() as usize, img.height() as usize);
    let values: Vec<f32> = img.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
    Array3::from_shape_vec((height, width, 3), values)
        .map_err(|e| DesmokeError::TensorData(e.to_string()))
}

/// Per-pixel channel minimum followed by a `patch x patch` minimum filter,
/// clipped at the borders. Done as two 1-D passes.
pub fn dark_channel(rgb: &Array3<f32>, patch: usize) -> Array2<f32> {
    let channel_min = rgb.map_axis(Axis(2), |px| px.iter().copied().fold(f32::INFINITY, f32::min));
    let pad = patch / 2;
    let (height, width) = channel_min.dim();

    let mut rows = Array2::<f32>::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let lo = x.saturating_sub(pad);
            let hi = (x + pad).min(width - 1);
            rows[[y, x]] = (lo..=hi).map(|j| channel_min[[y, j]]).fold(f32::INFINITY, f32::min);
        }
    }

    let mut dark = Array2::<f32>::zeros((height, width));
    for y in 0..height {
        let lo = y.saturating_sub(pad);
        let hi = (y + pad).min(height - 1);
        for x in 0..width {
            dark[[y, x]] = (lo..=hi).map(|i| rows[[i, x]]).fold(f32::INFINITY, f32::min);
        }
    }
    dark
}

/// Mean 8-bit hue and a* of one image; `dark_patch` adds the mean dark channel.
pub fn compute_color_statistics(path: &Path, dark_patch: Option<usize>) -> Result<ColorStats> {
    let rgb = load_rgb(path)?;
    let pixels = rgb.len_of(Axis(0)) * rgb.len_of(Axis(1));
    if pixels == 0 {
        return Err(DesmokeError::NoStatistics);
    }

    let (mut hue_sum, mut a_sum) = (0u64, 0u64);
    for px in rgb.lanes(Axis(2)) {
        let [r, g, b] = [px[0], px[1], px[2]].map(|c| (c * 255.0).round() as u8);
        hue_sum += hue_u8(r, g, b) as u64;
        a_sum += lab_a_u8(r, g, b) as u64;
    }

    let mean_dark_channel = dark_patch.map(|patch| dark_channel(&rgb, patch).mean().unwrap_or(0.0) as f64);

    Ok(ColorStats {
        mean_hue: hue_sum as f64 / pixels as f64,
        mean_a: a_sum as f64 / pixels as f64,
        mean_dark_channel,
    })
}

/// Statistics of every image file in `folder`, sorted by path. Images that
/// fail to load are logged and skipped.
pub fn process_images_in_folder(folder: &Path, dark_patch: Option<usize>) -> Result<Vec<ImageStats>> {
    if !folder.is_dir() {
        return Err(DesmokeError::MissingDirectory(folder.to_path_buf()));
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut stats = Vec::with_capacity(paths.len());
    for path in paths {
        match compute_color_statistics(&path, dark_patch) {
            Ok(s) => {
                debug!("{}: hue {:.2} a* {:.2}", path.display(), s.mean_hue, s.mean_a);
                stats.push(ImageStats {
                    image_path: path,
                    stats: s,
                });
            }
            Err(e) => warn!("Error processing {}: {}", path.display(), e),
        }
    }
    Ok(stats)
}

/// Min, max and mean of the per-image values.
pub fn compute_overall_statistics(stats: &[ImageStats]) -> Result<OverallStats> {
    let hue = Range::of(stats.iter().map(|s| s.stats.mean_hue)).ok_or(DesmokeError::NoStatistics)?;
    let a = Range::of(stats.iter().map(|s| s.stats.mean_a)).ok_or(DesmokeError::NoStatistics)?;
    let dark_channel = if stats.iter().all(|s| s.stats.mean_dark_channel.is_some()) {
        Range::of(stats.iter().filter_map(|s| s.stats.mean_dark_channel))
    } else {
        None
    };
    Ok(OverallStats { hue, a, dark_channel })
}

pub fn folder_report(folder: &Path, dark_patch: Option<usize>) -> Result<StatsReport> {
    let images = process_images_in_folder(folder, dark_patch)?;
    let overall = compute_overall_statistics(&images)?;
    Ok(StatsReport { images, overall })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{scratch_dir, write_solid};
    use image::{Rgb, RgbImage};

    #[test]
    fn hue_follows_the_half_degree_convention() {
        assert_eq!(hue_u8(255, 0, 0), 0);
        assert_eq!(hue_u8(0, 255, 0), 60);
        assert_eq!(hue_u8(0, 0, 255), 120);
        assert_eq!(hue_u8(200, 100, 50), 10);
        assert_eq!(hue_u8(255, 0, 1), 0);
        assert_eq!(hue_u8(128, 128, 128), 0);
    }

    #[test]
    fn a_star_matches_reference_values() {
        assert_eq!(lab_a_u8(255, 0, 0), 208);
        assert_eq!(lab_a_u8(0, 255, 0), 42);
        assert_eq!(lab_a_u8(0, 0, 255), 207);
        assert_eq!(lab_a_u8(200, 100, 50), 164);
        assert_eq!(lab_a_u8(128, 128, 128), 128);
        assert_eq!(lab_a_u8(255, 255, 255), 128);
        assert_eq!(lab_a_u8(0, 0, 0), 128);
    }

    #[test]
    fn image_means_average_pixel_values() {
        let root = scratch_dir("stats-image");
        let path = root.join("half.png");
        let img = RgbImage::from_fn(4, 2, |x, _| if x < 2 { Rgb([255, 0, 0]) } else { Rgb([0, 255, 0]) });
        img.save(&path).unwrap();

        let stats = compute_color_statistics(&path, None).unwrap();
        assert_eq!(stats.mean_hue, 30.0);
        assert_eq!(stats.mean_a, 125.0);
        assert_eq!(stats.mean_dark_channel, None);
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn dark_channel_spreads_the_darkest_pixel() {
        let mut rgb = Array3::<f32>::ones((5, 5, 3));
        rgb[[2, 2, 1]] = 0.0;
        let dark = dark_channel(&rgb, 3);
        assert_eq!(dark[[1, 1]], 0.0);
        assert_eq!(dark[[3, 3]], 0.0);
        assert_eq!(dark[[0, 0]], 1.0);
        assert_eq!(dark[[4, 2]], 1.0);
    }

    #[test]
    fn folder_skips_unreadable_files_and_sorts() {
        let root = scratch_dir("stats-folder");
        write_solid(&root.join("b.png"), 4, [200, 100, 50]);
        write_solid(&root.join("a.png"), 4, [128, 128, 128]);
        std::fs::write(root.join("broken.jpg"), b"not an image").unwrap();
        std::fs::write(root.join("notes.txt"), b"ignored").unwrap();

        let stats = process_images_in_folder(&root, Some(3)).unwrap();
        let names: Vec<_> = stats
            .iter()
            .map(|s| s.image_path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
        assert_eq!(stats[1].stats.mean_hue, 10.0);
        assert_eq!(stats[1].stats.mean_a, 164.0);

        let overall = compute_overall_statistics(&stats).unwrap();
        assert_eq!(overall.hue.min, 0.0);
        assert_eq!(overall.hue.max, 10.0);
        assert_eq!(overall.hue.mean, 5.0);
        assert_eq!(overall.a.mean, 146.0);
        let dark = overall.dark_channel.unwrap();
        assert!((dark.max - 128.0 / 255.0).abs() < 1e-6);
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn report_lines_use_two_decimals() {
        let image = ImageStats {
            image_path: PathBuf::from("x/1.png"),
            stats: ColorStats {
                mean_hue: 12.346,
                mean_a: 150.0,
                mean_dark_channel: None,
            },
        };
        assert_eq!(image.to_string(), "Image: x/1.png, Mean Hue: 12.35, Mean a*: 150.00");

        let overall = compute_overall_statistics(&[image]).unwrap();
        assert_eq!(
            overall.to_string(),
            "Overall Statistics:\nHue - Min: 12.35, Max: 12.35, Mean: 12.35\na*  - Min: 150.00, Max: 150.00, Mean: 150.00"
        );
    }

    #[test]
    fn empty_input_has_no_overall_statistics() {
        assert!(matches!(compute_overall_statistics(&[]), Err(DesmokeError::NoStatistics)));
        let root = scratch_dir("stats-empty");
        assert!(matches!(folder_report(&root, None), Err(DesmokeError::NoStatistics)));
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn report_serializes_to_json() {
        let root = scratch_dir("stats-json");
        write_solid(&root.join("a.png"), 2, [255, 0, 0]);
        let report = folder_report(&root, None).unwrap();
        let text = report.to_json().unwrap();
        assert!(text.starts_with("{\n"));
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["images"][0]["mean_a"], 208.0);
        assert_eq!(json["overall"]["hue"]["max"], 0.0);
        assert!(json["overall"].get("dark_channel").is_none());
        std::fs::remove_dir_all(root).ok();
    }
}
