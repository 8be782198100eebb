//! Scripted model capabilities for end-to-end batch tests.
//!
//! Documents are blank white PNGs, so normalization is the identity and the
//! scripted boxes land in original coordinates unchanged. Behaviour is keyed
//! by image dimensions.
#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docaudit::core::errors::ModelError;
use docaudit::core::geometry::BBox;
use docaudit::services::{Located, RegionLocator, RegionScorer, Scored};
use docaudit::{
    BatchOrchestrator, CircuitBreakerConfig, Document, DocumentInput, Metrics, ModelGate,
    ModelSet, PipelineConfig, ResultStore,
};

pub fn blank_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

pub fn doc(id: &str, width: u32, height: u32) -> DocumentInput {
    DocumentInput::Inline(Document::new(id, blank_png(width, height)))
}

pub fn garbage(id: &str) -> DocumentInput {
    DocumentInput::Inline(Document::new(id, b"definitely not an image".to_vec()))
}

#[derive(Clone)]
pub enum Behavior {
    Boxes(Vec<Located>),
    /// Fails with `Unavailable` for the first `n` calls, then returns the boxes
    FlakyThen(usize, Vec<Located>),
    AlwaysUnavailable,
    Sleep(Duration),
    /// Holds the call for a while and records how many calls overlap
    Tracked(Arc<InFlight>, Duration),
    Panic,
}

/// Current and peak number of overlapping locator calls
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Locator whose answer depends on the input's dimensions; unknown sizes
/// yield no candidates.
pub struct ScriptedLocator {
    name: &'static str,
    script: HashMap<(u32, u32), Behavior>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedLocator {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            script: HashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn on(mut self, size: (u32, u32), behavior: Behavior) -> Self {
        self.script.insert(size, behavior);
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl RegionLocator for ScriptedLocator {
    fn name(&self) -> &str {
        self.name
    }

    fn locate(&self, image: &DynamicImage) -> Result<Vec<Located>, ModelError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.get(&(image.width(), image.height())) {
            None => Ok(Vec::new()),
            Some(Behavior::Boxes(boxes)) => Ok(boxes.clone()),
            Some(Behavior::FlakyThen(n, boxes)) => {
                if call < *n {
                    Err(ModelError::Unavailable("warming up".to_string()))
                } else {
                    Ok(boxes.clone())
                }
            }
            Some(Behavior::AlwaysUnavailable) => {
                Err(ModelError::Unavailable("backend offline".to_string()))
            }
            Some(Behavior::Sleep(d)) => {
                std::thread::sleep(*d);
                Ok(Vec::new())
            }
            Some(Behavior::Tracked(in_flight, hold)) => {
                in_flight.enter();
                std::thread::sleep(*hold);
                in_flight.leave();
                Ok(Vec::new())
            }
            Some(Behavior::Panic) => panic!("scripted locator blew up"),
        }
    }
}

/// Scorer that always answers with the same label
pub struct FixedScorer(pub Scored);

impl RegionScorer for FixedScorer {
    fn name(&self) -> &str {
        "fixed-scorer"
    }

    fn score(&self, _crop: &DynamicImage) -> Result<Scored, ModelError> {
        Ok(self.0.clone())
    }
}

pub fn located(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Located {
    Located::rect(BBox::new(x1, y1, x2, y2), confidence)
}

pub fn gate(pool: usize, failure_threshold: usize) -> ModelGate {
    ModelGate::new(
        pool,
        CircuitBreakerConfig {
            failure_threshold,
            timeout: Duration::from_secs(60),
            success_threshold: 1,
        },
        Metrics::new(),
    )
}

pub fn models(signature: ScriptedLocator, seal: ScriptedLocator, gate: ModelGate) -> ModelSet {
    models_with_scorer(
        signature,
        Arc::new(FixedScorer(Scored::new("genuine", 0.9))),
        seal,
        gate,
    )
}

pub fn models_with_scorer(
    signature: ScriptedLocator,
    scorer: Arc<dyn RegionScorer>,
    seal: ScriptedLocator,
    gate: ModelGate,
) -> ModelSet {
    ModelSet::new(
        "scripted",
        Arc::new(signature),
        scorer,
        Arc::new(seal),
        Arc::new(FixedScorer(Scored::new("notary", 0.8))),
        gate,
    )
}

/// Base configuration with short backoff so retry tests stay fast
pub fn base_config() -> PipelineConfig {
    PipelineConfig {
        retry_backoff: Duration::from_millis(5),
        ..PipelineConfig::default()
    }
}

pub fn orchestrator(models: ModelSet, base: PipelineConfig) -> BatchOrchestrator {
    BatchOrchestrator::new(models, Arc::new(ResultStore::new()), Metrics::new(), base)
}
