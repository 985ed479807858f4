//! Frame-scoped error taxonomy.
//!
//! Every variant describes the fate of a single frame. None of them leave the
//! pipeline in a broken state: counters, the active conversion profile and the
//! filter graph topology survive any of these.

use crate::filter::graph::GraphError;
use crate::gpu::GpuError;
use std::time::Duration;

/// Convenience result type for the ingestion and composition APIs.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why a frame was rejected or dropped.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Malformed or unsupported sample. Rejected before any state mutation.
    #[error("format error: {0}")]
    Format(String),

    /// GPU allocation or upload failed. The frame is dropped.
    #[error("resource error: {0}")]
    Resource(#[source] GpuError),

    /// The previous frame did not retire within the wait bound.
    #[error("timed out after {0:?} waiting for the in-flight frame")]
    Timeout(Duration),

    /// An internal filter stage failed; no output was produced for the frame.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// The render thread is gone.
    #[error("render thread is not running")]
    Disconnected,
}

impl PipelineError {
    /// Build a [`PipelineError::Format`] value.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Short machine-friendly label, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Format(_) => "format",
            PipelineError::Resource(_) => "resource",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Graph(_) => "graph",
            PipelineError::Disconnected => "disconnected",
        }
    }
}

impl From<GpuError> for PipelineError {
    fn from(err: GpuError) -> Self {
        PipelineError::Resource(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_errors_become_resource_errors() {
        let err: PipelineError = GpuError::OutOfMemory { requested: 64, available: 0 }.into();
        assert_eq!(err.kind(), "resource");
        assert!(err.to_string().contains("resource error"));
    }

    #[test]
    fn timeout_mentions_the_bound() {
        let err = PipelineError::Timeout(Duration::from_millis(40));
        assert!(err.to_string().contains("40ms"));
    }
}
