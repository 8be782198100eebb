// Shared ONNX Runtime session construction and pooling
//
// Every ONNX-backed capability builds its sessions here so hardware
// acceleration is checked the same way for all of them.

use anyhow::{Context, Result};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::core::errors::ModelError;

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

/// Intra-op thread count for CPU inference.
///
/// Several sessions run side by side, so each gets a share of the cores
/// rather than all of them.
fn intra_op_threads(pool_size: usize) -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let per_session = std::cmp::min(6, total_cores / pool_size.max(1)).max(1);

    #[cfg(not(target_os = "windows"))]
    let per_session = (total_cores / pool_size.max(1)).max(1);

    debug!(
        "CPU threads: {} total cores, {} per session",
        total_cores, per_session
    );
    per_session
}

/// Fixed-size pool of sessions for one model. Sessions need `&mut` to run,
/// so each call borrows one exclusively.
pub struct SessionPool {
    name: String,
    sessions: Mutex<PoolState>,
    available: Condvar,
}

struct PoolState {
    idle: Vec<Session>,
    released: bool,
}

impl SessionPool {
    pub fn new(name: impl Into<String>, sessions: Vec<Session>) -> Self {
        Self {
            name: name.into(),
            sessions: Mutex::new(PoolState {
                idle: sessions,
                released: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Runs `f` with an exclusively borrowed session, blocking until one is
    /// idle.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Session) -> Result<T, ModelError>,
    ) -> Result<T, ModelError> {
        let mut session = {
            let mut state = self.sessions.lock();
            loop {
                if state.released {
                    return Err(ModelError::Unavailable(format!(
                        "{} sessions have been released",
                        self.name
                    )));
                }
                if let Some(session) = state.idle.pop() {
                    break session;
                }
                self.available.wait(&mut state);
            }
        };

        let result = f(&mut session);

        let mut state = self.sessions.lock();
        if !state.released {
            state.idle.push(session);
        }
        drop(state);
        self.available.notify_one();
        result
    }

    pub fn idle(&self) -> usize {
        self.sessions.lock().idle.len()
    }

    /// Drops every idle session and refuses further calls.
    pub fn release(&self) {
        let mut state = self.sessions.lock();
        state.released = true;
        state.idle.clear();
        drop(state);
        self.available.notify_all();
    }
}

/// Builds `count` sessions for the model at `path`. The first session
/// decides the execution provider.
pub fn build_pool(
    path: &str,
    model_name: &str,
    device: Option<&str>,
    count: usize,
) -> Result<(String, SessionPool)> {
    if !Path::new(path).exists() {
        anyhow::bail!("{} model not found at '{}'", model_name, path);
    }

    let count = count.max(1);
    let mut sessions = Vec::with_capacity(count);
    let (backend, first) = build_session(path, model_name, device, count)?;
    sessions.push(first);
    for i in 1..count {
        debug!("Creating {} session {} of {}", model_name, i + 1, count);
        let (_, session) = build_session(path, model_name, Some(&backend), count)?;
        sessions.push(session);
    }

    info!("✓ {}: {} ({} sessions)", model_name, backend, count);
    Ok((backend, SessionPool::new(model_name, sessions)))
}

/// Build one session, honouring a forced device or probing accelerators in
/// order of preference: TensorRT, CUDA, CoreML, DirectML, then CPU.
pub fn build_session(
    path: &str,
    model_name: &str,
    device: Option<&str>,
    pool_size: usize,
) -> Result<(String, Session)> {
    let threads = intra_op_threads(pool_size);

    if let Some(forced) = device {
        if !forced.eq_ignore_ascii_case("auto") {
            return try_forced_backend(forced, path, model_name, threads);
        }
    }

    #[cfg(feature = "tensorrt")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([TensorRTExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.commit_from_file(path))
        {
            return Ok(("TensorRT".to_string(), session));
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CUDAExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.commit_from_file(path))
        {
            return Ok(("CUDA".to_string(), session));
        }
    }

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CoreMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.commit_from_file(path))
        {
            return Ok(("CoreML".to_string(), session));
        }
    }

    #[cfg(all(target_os = "windows", feature = "directml"))]
    {
        // DirectML needs sequential execution and no memory pattern
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([DirectMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_parallel_execution(false))
            .and_then(|b| b.with_memory_pattern(false))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.commit_from_file(path))
        {
            return Ok(("DirectML".to_string(), session));
        }
    }

    let session = cpu_session(path, model_name, threads)?;
    warn!("Using CPU-only inference for {}", model_name);
    Ok(("CPU".to_string(), session))
}

fn cpu_session(path: &str, model_name: &str, threads: usize) -> Result<Session> {
    Session::builder()
        .context(format!("Failed to create ONNX session builder for {}", model_name))?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .context(format!("Failed to configure CPU execution provider for {}", model_name))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context(format!("Failed to set graph optimization level for {}", model_name))?
        .with_intra_threads(threads)
        .context(format!("Failed to configure intra-op threads for {}", model_name))?
        .commit_from_file(path)
        .context(format!(
            "Failed to load {} ONNX model from '{}'. Check the file and the ONNX opset version",
            model_name, path
        ))
}

fn try_forced_backend(
    backend: &str,
    path: &str,
    model_name: &str,
    threads: usize,
) -> Result<(String, Session)> {
    match backend.to_uppercase().as_str() {
        #[cfg(feature = "tensorrt")]
        "TENSORRT" => {
            let session = Session::builder()?
                .with_execution_providers([TensorRTExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(threads)?
                .commit_from_file(path)
                .context("Failed to load model with TensorRT")?;
            Ok(("TensorRT".to_string(), session))
        }

        #[cfg(feature = "cuda")]
        "CUDA" => {
            let session = Session::builder()?
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(threads)?
                .commit_from_file(path)
                .context("Failed to load model with CUDA")?;
            Ok(("CUDA".to_string(), session))
        }

        "CPU" => Ok(("CPU".to_string(), cpu_session(path, model_name, threads)?)),

        other => {
            warn!(
                "Inference backend '{}' not available in this build, probing for {}",
                other, model_name
            );
            build_session(path, model_name, None, 1)
        }
    }
}
