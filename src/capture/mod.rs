pub mod buffers;
pub mod controller;
pub mod host;
pub mod plan;
pub mod visibility;

pub use buffers::CapturedBufferMap;
pub use controller::{BufferCaptureController, CaptureSettings, FRAMES_TO_WAIT};
pub use host::{
    CaptureCallback, CaptureReceipt, NodeHandle, PreviewSink, SceneGraph, VariantSwitcher,
    ViewportRenderer, Visibility, capture_callback,
};
pub use plan::{BufferKind, CapturePlanEntry, plan_from_parameters};
pub use visibility::{VisibilityGuard, VisibilityPolicy};
