//! Veneer: real-time GPU beautify pipeline for camera frames.
//!
//! Raw samples go through a [`FrameSource`](ingest::FrameSource), which
//! converts them to RGB and runs the [`BeautifyFilter`](filter::BeautifyFilter)
//! graph on a dedicated render thread before handing the result to a
//! [`FrameSink`](output::FrameSink).

pub mod capture;
pub mod color;
pub mod config;
pub mod error;
pub mod filter;
pub mod frame;
pub mod gpu;
pub mod ingest;
pub mod output;

pub use error::{PipelineError, PipelineResult};
