//! Send the current 3D viewport (color, depth and normal buffers plus user parameters) to a
//! remote node-graph image generator and bring the stylized result back.
//!
//! [`session::Session`] is the entry point: it owns a [`capture::BufferCaptureController`]
//! driving the host viewport and a [`orchestrator::GenerationOrchestrator`] driving the
//! remote job through a [`backend::GenerationBackend`].

pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pixels;
pub mod protocol;
pub mod safety;
pub mod session;
pub mod template;
pub mod transfer;
pub mod ws;

pub use config::UpliftConfig;
pub use error::{UpliftError, UpliftResult};
pub use orchestrator::{GenerationOrchestrator, GenerationOutcome, GenerationState, PollSettings};
pub use session::{BatchItem, BatchReport, Session, load_batch_file};
