// ONNX Runtime model family
//
// Locators are RT-DETR style exports taking `images` [1,3,S,S] and
// `orig_target_sizes` [1,2] and returning `labels`, `boxes` (xyxy in original
// pixels) and `scores`. Scorers are plain classifiers over a 224x224 crop
// returning one logit row.

use anyhow::Result;
use image::DynamicImage;
use ndarray::{Array2, Array4};
use ort::value::Value;
use std::sync::Arc;
use tracing::{debug, trace};

use super::{Located, ModelSet, RegionLocator, RegionScorer, Scored};
use crate::core::config::ModelConfig;
use crate::core::errors::ModelError;
use crate::core::geometry::BBox;
use crate::middleware::ModelGate;
use crate::services::onnx_builder::{build_pool, SessionPool};

const SCORER_INPUT: u32 = 224;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

fn inference_error(err: ort::Error) -> ModelError {
    ModelError::Inference(err.to_string())
}

/// Packs an image into a [1,3,S,S] tensor, optionally ImageNet-normalized.
fn to_tensor(img: &DynamicImage, size: u32, normalize: bool) -> Array4<f32> {
    let resized = img
        .resize_exact(size, size, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let s = size as usize;
    let mut array = Array4::<f32>::zeros((1, 3, s, s));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let mut v = pixel[c] as f32 / 255.0;
            if normalize {
                v = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
            array[[0, c, y as usize, x as usize]] = v;
        }
    }
    array
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum.max(f32::EPSILON)).collect()
}

pub struct OnnxLocator {
    name: String,
    pool: SessionPool,
    input_size: u32,
}

impl RegionLocator for OnnxLocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn locate(&self, image: &DynamicImage) -> Result<Vec<Located>, ModelError> {
        let tensor = to_tensor(image, self.input_size, false);
        let sizes = Array2::from_shape_vec(
            (1, 2),
            vec![image.width() as i64, image.height() as i64],
        )
        .map_err(|e| ModelError::Inference(e.to_string()))?;

        let images_value = Value::from_array(tensor).map_err(inference_error)?;
        let sizes_value = Value::from_array(sizes).map_err(inference_error)?;

        let (count, boxes, scores) = self.pool.with_session(|session| {
            let outputs = session
                .run(ort::inputs![
                    "images" => images_value,
                    "orig_target_sizes" => sizes_value
                ])
                .map_err(inference_error)?;

            let (labels_shape, _) = outputs["labels"]
                .try_extract_tensor::<i64>()
                .map_err(inference_error)?;
            let count = labels_shape.get(1).copied().unwrap_or(0).max(0) as usize;
            let (_, boxes) = outputs["boxes"]
                .try_extract_tensor::<f32>()
                .map_err(inference_error)?;
            let (_, scores) = outputs["scores"]
                .try_extract_tensor::<f32>()
                .map_err(inference_error)?;
            Ok((count, boxes.to_vec(), scores.to_vec()))
        })?;

        if boxes.len() < count * 4 || scores.len() < count {
            return Err(ModelError::Inference(format!(
                "{} returned truncated outputs ({} boxes, {} scores for {} detections)",
                self.name,
                boxes.len() / 4,
                scores.len(),
                count
            )));
        }

        let found: Vec<Located> = (0..count)
            .map(|i| {
                let bbox = BBox::new(boxes[i * 4], boxes[i * 4 + 1], boxes[i * 4 + 2], boxes[i * 4 + 3])
                    .clamp_to(image.width(), image.height());
                Located::rect(bbox, scores[i].clamp(0.0, 1.0))
            })
            .filter(|l| l.bbox.area() > 0.0)
            .collect();
        trace!("{}: {} raw candidates", self.name, found.len());
        Ok(found)
    }

    fn release(&self) {
        self.pool.release();
    }
}

pub struct OnnxScorer {
    name: String,
    pool: SessionPool,
    labels: Vec<String>,
}

impl RegionScorer for OnnxScorer {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, crop: &DynamicImage) -> Result<Scored, ModelError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(ModelError::Inference("empty crop".to_string()));
        }
        let tensor = to_tensor(crop, SCORER_INPUT, true);
        let input = Value::from_array(tensor).map_err(inference_error)?;

        let logits = self.pool.with_session(|session| {
            let outputs = session.run(ort::inputs![input]).map_err(inference_error)?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(inference_error)?;
            Ok(data.to_vec())
        })?;

        let probs = softmax(&logits);
        let (best, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| ModelError::Inference(format!("{} returned no logits", self.name)))?;
        let label = self
            .labels
            .get(best)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Scored::new(label, confidence))
    }

    fn release(&self) {
        self.pool.release();
    }
}

/// Loaded ONNX capabilities, ready to be wrapped into a [`ModelSet`]
pub struct OnnxFamily {
    device: String,
    signature_locator: OnnxLocator,
    authenticity_scorer: OnnxScorer,
    seal_locator: OnnxLocator,
    seal_classifier: OnnxScorer,
}

impl OnnxFamily {
    /// Blocking: builds every session pool.
    pub fn load(models: &ModelConfig) -> Result<Self> {
        let device = models.inference_device.as_deref();
        let count = models.pool_size;

        let (backend, pool) = build_pool(&models.signature_locator_path, "signature-locator", device, count)?;
        let signature_locator = OnnxLocator {
            name: "onnx-signature-locator".to_string(),
            pool,
            input_size: models.input_size,
        };

        let (_, pool) = build_pool(&models.authenticity_scorer_path, "authenticity-scorer", device, count)?;
        let authenticity_scorer = OnnxScorer {
            name: "onnx-authenticity-scorer".to_string(),
            pool,
            labels: vec!["genuine".to_string(), "suspicious".to_string()],
        };

        let (_, pool) = build_pool(&models.seal_locator_path, "seal-locator", device, count)?;
        let seal_locator = OnnxLocator {
            name: "onnx-seal-locator".to_string(),
            pool,
            input_size: models.input_size,
        };

        let (_, pool) = build_pool(&models.seal_classifier_path, "seal-classifier", device, count)?;
        let seal_classifier = OnnxScorer {
            name: "onnx-seal-classifier".to_string(),
            pool,
            labels: ["notary", "corporate", "government", "unknown"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        debug!("ONNX family loaded on {}", backend);
        Ok(Self {
            device: backend,
            signature_locator,
            authenticity_scorer,
            seal_locator,
            seal_classifier,
        })
    }

    pub fn into_model_set(self, gate: ModelGate) -> ModelSet {
        ModelSet::new(
            format!("onnx ({})", self.device),
            Arc::new(self.signature_locator),
            Arc::new(self.authenticity_scorer),
            Arc::new(self.seal_locator),
            Arc::new(self.seal_classifier),
            gate,
        )
    }
}
