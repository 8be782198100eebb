// Pure-Rust heuristic model family
//
// Image statistics stand in for trained networks so the service runs without
// model files. Every capability is deterministic for identical pixels.

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use imageproc::region_labelling::{connected_components, Connectivity};

use super::{Located, RegionLocator, RegionScorer, Scored};
use crate::core::errors::ModelError;
use crate::core::geometry::{BBox, Point};

/// Longest side used for blob analysis
const ANALYSIS_MAX_SIDE: u32 = 1200;

/// Connected ink blob in analysis coordinates (inclusive bounds)
#[derive(Debug, Clone, Copy)]
struct Blob {
    x_min: u32,
    y_min: u32,
    x_max: u32,
    y_max: u32,
    ink: u32,
}

impl Blob {
    fn width(&self) -> u32 {
        self.x_max - self.x_min + 1
    }

    fn height(&self) -> u32 {
        self.y_max - self.y_min + 1
    }

    fn density(&self) -> f32 {
        self.ink as f32 / (self.width() * self.height()) as f32
    }

    /// Box in the caller's grid, padded by one analysis pixel.
    fn to_bbox(&self, scale: f32, limit_w: u32, limit_h: u32) -> BBox {
        BBox::new(
            (self.x_min as f32 - 1.0) / scale,
            (self.y_min as f32 - 1.0) / scale,
            (self.x_max as f32 + 2.0) / scale,
            (self.y_max as f32 + 2.0) / scale,
        )
        .clamp_to(limit_w, limit_h)
    }
}

/// Downsamples large inputs for analysis. Returns the image and the factor
/// mapping caller pixels to analysis pixels.
fn analysis_view(image: &DynamicImage) -> (DynamicImage, f32) {
    let longest = image.width().max(image.height());
    if longest <= ANALYSIS_MAX_SIDE {
        return (image.clone(), 1.0);
    }
    let scale = ANALYSIS_MAX_SIDE as f32 / longest as f32;
    let w = ((image.width() as f32 * scale).round() as u32).max(1);
    let h = ((image.height() as f32 * scale).round() as u32).max(1);
    (
        image.resize_exact(w, h, image::imageops::FilterType::Triangle),
        scale,
    )
}

fn mask_count(mask: &GrayImage) -> u32 {
    mask.pixels().filter(|p| p.0[0] > 0).count() as u32
}

/// Groups mask pixels into blobs after dilating by `k` so nearby strokes
/// merge.
fn blobs(mask: &GrayImage, k: u8) -> Vec<Blob> {
    let dilated = dilate(mask, Norm::LInf, k);
    let labels = connected_components(&dilated, Connectivity::Eight, Luma([0u8]));

    let mut found: Vec<Option<Blob>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let id = label.0[0] as usize;
        if id == 0 {
            continue;
        }
        if found.len() < id {
            found.resize(id, None);
        }
        let ink = u32::from(mask.get_pixel(x, y).0[0] > 0);
        let blob = found[id - 1].get_or_insert(Blob {
            x_min: x,
            y_min: y,
            x_max: x,
            y_max: y,
            ink: 0,
        });
        blob.x_min = blob.x_min.min(x);
        blob.y_min = blob.y_min.min(y);
        blob.x_max = blob.x_max.max(x);
        blob.y_max = blob.y_max.max(y);
        blob.ink += ink;
    }
    found.into_iter().flatten().filter(|b| b.ink > 0).collect()
}

/// Scores `value` by closeness to `target` on a log scale; 1.0 at the
/// target, 0.0 at `target * spread` or `target / spread`.
fn log_closeness(value: f32, target: f32, spread: f32) -> f32 {
    (1.0 - (value / target).ln().abs() / spread.ln()).clamp(0.0, 1.0)
}

fn is_chroma(r: u8, g: u8, b: u8) -> bool {
    let mx = r.max(g).max(b);
    let mn = r.min(g).min(b);
    mx >= 90 && mx - mn >= 60 && (r == mx || b == mx)
}

fn hue_degrees(r: u8, g: u8, b: u8) -> f32 {
    let (r, g, b) = (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let mx = r.max(g).max(b);
    let mn = r.min(g).min(b);
    let delta = mx - mn;
    if delta <= f32::EPSILON {
        return 0.0;
    }
    let h = if mx == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if mx == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    h.rem_euclid(360.0)
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

/// Finds handwriting-like ink blobs: elongated, sparse, with an irregular
/// upper contour (printed text lines are dense and flat-topped).
#[derive(Debug, Clone)]
pub struct InkSignatureLocator {
    pub max_luma: u8,
    pub min_aspect: f32,
    pub max_aspect: f32,
}

impl Default for InkSignatureLocator {
    fn default() -> Self {
        Self {
            max_luma: 170,
            min_aspect: 1.2,
            max_aspect: 12.0,
        }
    }
}

impl InkSignatureLocator {
    fn contour_irregularity(mask: &GrayImage, blob: &Blob) -> f32 {
        let mut tops = Vec::with_capacity(blob.width() as usize);
        for x in blob.x_min..=blob.x_max {
            if let Some(y) = (blob.y_min..=blob.y_max).find(|&y| mask.get_pixel(x, y).0[0] > 0) {
                tops.push(y as f32);
            }
        }
        if tops.len() < 2 {
            return 0.0;
        }
        let jumps: f32 = tops.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        let mean_jump = jumps / (tops.len() - 1) as f32;
        (mean_jump / (0.15 * blob.height() as f32).max(1.0)).clamp(0.0, 1.0)
    }
}

impl RegionLocator for InkSignatureLocator {
    fn name(&self) -> &str {
        "heuristic-signature-locator"
    }

    fn locate(&self, image: &DynamicImage) -> Result<Vec<Located>, ModelError> {
        let (view, scale) = analysis_view(image);
        let gray = view.to_luma8();
        let rgb = view.to_rgb8();
        let (w, h) = gray.dimensions();
        if w < 8 || h < 8 {
            return Ok(Vec::new());
        }

        let cutoff = otsu_level(&gray).min(self.max_luma);
        let mut mask = GrayImage::new(w, h);
        for (x, y, p) in gray.enumerate_pixels() {
            if p.0[0] <= cutoff {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        if (mask_count(&mask) as f32) < 0.0005 * (w * h) as f32 {
            return Ok(Vec::new());
        }

        let k = (w.max(h) / 150).clamp(2, 8) as u8;
        let mut found = Vec::new();
        for blob in blobs(&mask, k) {
            let (bw, bh) = (blob.width() as f32, blob.height() as f32);
            if bw < 0.04 * w as f32 || bh < 0.01 * h as f32 {
                continue;
            }
            if bh > 0.3 * h as f32 || bw > 0.9 * w as f32 {
                continue;
            }
            let aspect = bw / bh;
            if aspect < self.min_aspect || aspect > self.max_aspect {
                continue;
            }
            let density = blob.density();
            if !(0.02..=0.45).contains(&density) {
                continue;
            }

            let aspect_score = log_closeness(aspect, 3.5, 4.0);
            let density_score = (1.0 - (density - 0.12).abs() / 0.2).clamp(0.0, 1.0);
            let irregularity = Self::contour_irregularity(&mask, &blob);
            let blue_ink = blue_ink_fraction(&rgb, &mask, &blob);

            let confidence = (0.35 * aspect_score
                + 0.25 * density_score
                + 0.3 * irregularity
                + 0.1 * blue_ink)
                .clamp(0.0, 1.0);
            found.push(Located::rect(blob.to_bbox(scale, image.width(), image.height()), confidence));
        }
        Ok(found)
    }
}

fn blue_ink_fraction(rgb: &RgbImage, mask: &GrayImage, blob: &Blob) -> f32 {
    let mut blue = 0u32;
    for y in blob.y_min..=blob.y_max {
        for x in blob.x_min..=blob.x_max {
            if mask.get_pixel(x, y).0[0] == 0 {
                continue;
            }
            let [r, g, b] = rgb.get_pixel(x, y).0;
            if b as i32 > r as i32 + 25 && b as i32 > g as i32 + 10 {
                blue += 1;
            }
        }
    }
    blue as f32 / blob.ink.max(1) as f32
}

/// Stroke-width consistency scorer. Natural signatures show fluent strokes
/// of varying width; traced or pasted ones are unnaturally uniform or
/// blotchy.
#[derive(Debug, Clone, Default)]
pub struct StrokeAuthenticityScorer;

impl RegionScorer for StrokeAuthenticityScorer {
    fn name(&self) -> &str {
        "heuristic-authenticity-scorer"
    }

    fn score(&self, crop: &DynamicImage) -> Result<Scored, ModelError> {
        // Too few pixels to judge strokes; the candidate itself stays valid
        if crop.width() < 4 || crop.height() < 4 {
            return Ok(Scored::new("indeterminate", 0.0));
        }
        let gray = crop.to_luma8();
        let cutoff = otsu_level(&gray).min(170);

        let mut runs: Vec<f32> = Vec::new();
        for row in gray.rows() {
            let mut run = 0u32;
            for p in row {
                if p.0[0] <= cutoff {
                    run += 1;
                } else if run > 0 {
                    runs.push(run as f32);
                    run = 0;
                }
            }
            if run > 0 {
                runs.push(run as f32);
            }
        }

        if runs.len() < 8 {
            return Ok(Scored::new("indeterminate", 0.3));
        }

        let mean = runs.iter().sum::<f32>() / runs.len() as f32;
        let var = runs.iter().map(|r| (r - mean).powi(2)).sum::<f32>() / runs.len() as f32;
        let cv = var.sqrt() / mean.max(f32::EPSILON);

        let scored = if cv < 0.3 {
            Scored::new("suspicious", (0.6 + (0.3 - cv)).min(0.95))
        } else if cv > 1.5 {
            Scored::new("suspicious", (0.6 + (cv - 1.5) / 2.0).min(0.9))
        } else {
            let fluency = (1.0 - (cv - 0.75).abs() / 0.75).clamp(0.0, 1.0);
            Scored::new("genuine", 0.6 + 0.35 * fluency)
        };
        Ok(scored)
    }
}

// ---------------------------------------------------------------------------
// Seals
// ---------------------------------------------------------------------------

/// Finds compact, roughly isotropic blobs of saturated red or blue ink.
#[derive(Debug, Clone)]
pub struct ChromaSealLocator {
    pub max_aspect: f32,
}

impl Default for ChromaSealLocator {
    fn default() -> Self {
        Self { max_aspect: 1.8 }
    }
}

impl ChromaSealLocator {
    /// Share of ink in the four corner patches of the blob's box. Round
    /// seals leave their corners empty.
    fn corner_fraction(mask: &GrayImage, blob: &Blob) -> f32 {
        let cw = (blob.width() as f32 * 0.15).ceil() as u32;
        let ch = (blob.height() as f32 * 0.15).ceil() as u32;
        let mut ink = 0u32;
        for (x0, y0) in [
            (blob.x_min, blob.y_min),
            (blob.x_max + 1 - cw, blob.y_min),
            (blob.x_min, blob.y_max + 1 - ch),
            (blob.x_max + 1 - cw, blob.y_max + 1 - ch),
        ] {
            for y in y0..y0 + ch {
                for x in x0..x0 + cw {
                    if mask.get_pixel(x, y).0[0] > 0 {
                        ink += 1;
                    }
                }
            }
        }
        ink as f32 / blob.ink.max(1) as f32
    }

    fn octagon(bbox: &BBox) -> Vec<Point> {
        let cx = (bbox.x_min + bbox.x_max) / 2.0;
        let cy = (bbox.y_min + bbox.y_max) / 2.0;
        let rx = bbox.width() / 2.0;
        let ry = bbox.height() / 2.0;
        (0..8)
            .map(|i| {
                let t = std::f32::consts::PI / 8.0 + i as f32 * std::f32::consts::PI / 4.0;
                // Circumscribe the ellipse so the outline never clips ink
                let k = 1.0 / (std::f32::consts::PI / 8.0).cos();
                Point::new(cx + rx * k * t.cos(), cy + ry * k * t.sin())
            })
            .collect()
    }
}

impl RegionLocator for ChromaSealLocator {
    fn name(&self) -> &str {
        "heuristic-seal-locator"
    }

    fn locate(&self, image: &DynamicImage) -> Result<Vec<Located>, ModelError> {
        let (view, scale) = analysis_view(image);
        let rgb = view.to_rgb8();
        let (w, h) = rgb.dimensions();
        if w < 8 || h < 8 {
            return Ok(Vec::new());
        }

        let mut mask = GrayImage::new(w, h);
        for (x, y, p) in rgb.enumerate_pixels() {
            let [r, g, b] = p.0;
            if is_chroma(r, g, b) {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        if (mask_count(&mask) as f32) < 0.0005 * (w * h) as f32 {
            return Ok(Vec::new());
        }

        let k = (w.max(h) / 100).clamp(2, 10) as u8;
        let min_side = 0.03 * w.min(h) as f32;
        let mut found = Vec::new();
        for blob in blobs(&mask, k) {
            let (bw, bh) = (blob.width() as f32, blob.height() as f32);
            if bw.min(bh) < min_side {
                continue;
            }
            let aspect = bw / bh;
            if aspect > self.max_aspect || aspect < 1.0 / self.max_aspect {
                continue;
            }
            let density = blob.density();
            if !(0.04..=0.75).contains(&density) {
                continue;
            }

            let squareness = log_closeness(aspect, 1.0, self.max_aspect);
            let density_score = (1.0 - (density - 0.25).abs() / 0.5).clamp(0.0, 1.0);
            let round = Self::corner_fraction(&mask, &blob) < 0.05;
            let confidence = (0.5 * squareness
                + 0.3 * density_score
                + if round { 0.2 } else { 0.1 })
            .clamp(0.0, 1.0);

            let bbox = blob.to_bbox(scale, image.width(), image.height());
            let polygon = round.then(|| Self::octagon(&bbox));
            found.push(Located {
                bbox,
                polygon,
                confidence,
            });
        }
        Ok(found)
    }
}

/// Dominant ink hue to seal type: red corporate, blue notary, violet
/// government.
#[derive(Debug, Clone)]
pub struct HueSealClassifier {
    pub min_ink_pixels: usize,
}

impl Default for HueSealClassifier {
    fn default() -> Self {
        Self { min_ink_pixels: 20 }
    }
}

impl RegionScorer for HueSealClassifier {
    fn name(&self) -> &str {
        "heuristic-seal-classifier"
    }

    fn score(&self, crop: &DynamicImage) -> Result<Scored, ModelError> {
        let rgb = crop.to_rgb8();
        // red, blue, violet, other
        let mut counts = [0usize; 4];
        for p in rgb.pixels() {
            let [r, g, b] = p.0;
            if !is_chroma(r, g, b) {
                continue;
            }
            let hue = hue_degrees(r, g, b);
            let bucket = if !(20.0..330.0).contains(&hue) {
                0
            } else if (190.0..260.0).contains(&hue) {
                1
            } else if (260.0..330.0).contains(&hue) {
                2
            } else {
                3
            };
            counts[bucket] += 1;
        }

        let total: usize = counts.iter().sum();
        if total < self.min_ink_pixels {
            return Ok(Scored::new("unknown", 0.0));
        }

        let (best, count) = counts
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
            .map(|(i, c)| (i, *c))
            .unwrap_or((3, 0));
        let label = match best {
            0 => "corporate",
            1 => "notary",
            2 => "government",
            _ => "unknown",
        };
        Ok(Scored::new(label, count as f32 / total as f32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn page(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([255, 255, 255]))
    }

    fn draw_ring(img: &mut RgbImage, cx: f32, cy: f32, r: f32, color: Rgb<u8>) {
        for y in 0..img.height() {
            for x in 0..img.width() {
                let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
                if (d - r).abs() < 3.0 || (d < r * 0.5 && (x + y) % 3 == 0) {
                    img.put_pixel(x, y, color);
                }
            }
        }
    }

    #[test]
    fn test_blank_page_has_no_candidates() {
        let img = DynamicImage::ImageRgb8(page(300, 200));
        assert!(InkSignatureLocator::default().locate(&img).unwrap().is_empty());
        assert!(ChromaSealLocator::default().locate(&img).unwrap().is_empty());
    }

    #[test]
    fn test_red_ring_is_located_and_classified() {
        let mut img = page(400, 300);
        draw_ring(&mut img, 200.0, 150.0, 50.0, Rgb([210, 30, 40]));
        let img = DynamicImage::ImageRgb8(img);

        let found = ChromaSealLocator::default().locate(&img).unwrap();
        assert_eq!(found.len(), 1);
        let seal = &found[0];
        assert!(seal.bbox.x_min < 152.0 && seal.bbox.x_max > 248.0);
        assert!(seal.polygon.as_ref().map(|p| p.len()) == Some(8));

        let crop = img.crop_imm(140, 90, 120, 120);
        let scored = HueSealClassifier::default().score(&crop).unwrap();
        assert_eq!(scored.label, "corporate");
        assert!(scored.confidence > 0.9);
    }

    #[test]
    fn test_hue_buckets() {
        assert!(hue_degrees(255, 0, 0) < 1.0);
        assert!((hue_degrees(0, 0, 255) - 240.0).abs() < 1.0);
        assert!((hue_degrees(160, 0, 255) - 277.6).abs() < 1.0);
    }

    #[test]
    fn test_tiny_crop_is_indeterminate() {
        let crop = DynamicImage::ImageRgb8(page(3, 3));
        let scored = StrokeAuthenticityScorer.score(&crop).unwrap();
        assert_eq!(scored.label, "indeterminate");
        assert_eq!(scored.confidence, 0.0);
    }

    #[test]
    fn test_uniform_strokes_are_suspicious() {
        // Perfectly regular vertical bars: every run has the same width
        let mut img = page(120, 40);
        for y in 5..35 {
            for x in 0..120 {
                if x % 10 < 3 {
                    img.put_pixel(x, y, Rgb([10, 10, 10]));
                }
            }
        }
        let scored = StrokeAuthenticityScorer
            .score(&DynamicImage::ImageRgb8(img))
            .unwrap();
        assert_eq!(scored.label, "suspicious");
    }
}
