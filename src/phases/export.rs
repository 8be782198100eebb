// Export: annotated overlay and enhanced image bytes for a finished result

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use tracing::{debug, instrument};

use super::normalization::flatten;
use crate::core::errors::ExportError;
use crate::core::geometry::Point;
use crate::core::types::{Category, DocumentResult};
use crate::utils::{encode_image, OutputFormat};

const SIGNATURE_COLOUR: Rgb<u8> = Rgb([30, 90, 220]);
const SEAL_COLOUR: Rgb<u8> = Rgb([220, 40, 40]);

fn colour_for(category: Category) -> Rgb<u8> {
    match category {
        Category::Signature => SIGNATURE_COLOUR,
        Category::Seal => SEAL_COLOUR,
    }
}

/// Draws a closed outline `thickness` pixels wide.
fn draw_outline(canvas: &mut RgbImage, outline: &[Point], thickness: u32, colour: Rgb<u8>) {
    if outline.len() < 2 {
        return;
    }
    let half = thickness as f32 / 2.0;
    for (i, a) in outline.iter().enumerate() {
        let b = &outline[(i + 1) % outline.len()];
        for step in 0..thickness {
            let offset = step as f32 - half;
            draw_line_segment_mut(canvas, (a.x + offset, a.y), (b.x + offset, b.y), colour);
            draw_line_segment_mut(canvas, (a.x, a.y + offset), (b.x, b.y + offset), colour);
        }
    }
}

/// Overlay of every detection on the original document, drawn in original
/// coordinates.
#[instrument(skip_all, fields(document_id = %result.document_id))]
pub fn render_annotated(original: &[u8], result: &DocumentResult) -> Result<RgbImage, ExportError> {
    let decoded =
        image::load_from_memory(original).map_err(|e| ExportError::Decode(e.to_string()))?;
    let mut canvas = flatten(decoded);

    let thickness = (canvas.width().max(canvas.height()) / 500).max(2);
    for resolved in &result.detections {
        draw_outline(
            &mut canvas,
            &resolved.original.polygon,
            thickness,
            colour_for(resolved.detection.category),
        );
    }

    debug!("Annotated {} detection(s)", result.detections.len());
    Ok(canvas)
}

pub fn export_annotated(
    original: &[u8],
    result: &DocumentResult,
    format: OutputFormat,
) -> Result<Vec<u8>, ExportError> {
    let canvas = render_annotated(original, result)?;
    Ok(encode_image(&DynamicImage::ImageRgb8(canvas), format)?)
}

pub fn export_enhanced(result: &DocumentResult, format: OutputFormat) -> Result<Vec<u8>, ExportError> {
    let enhanced = result
        .enhanced
        .as_ref()
        .ok_or_else(|| ExportError::MissingEnhancement(result.document_id.clone()))?;
    Ok(encode_image(&enhanced.pixels, format)?)
}
