//! Host-side capabilities the capture controller depends on.
//!
//! The viewport, scene graph and variant sets belong to the host application. They are
//! passed in as trait objects so the controller can be driven by a real host or by fakes.

use async_trait::async_trait;
use image::DynamicImage;
use tokio::sync::oneshot;

use super::plan::BufferKind;
use crate::pixels::RawCapture;

/// Path-addressed handle to a scene node, e.g. `/World/Props/Chair`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(String);

impl NodeHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Inherited,
    Invisible,
}

pub trait SceneGraph: Send + Sync {
    fn node(&self, path: &str) -> Option<NodeHandle>;
    fn parent(&self, node: &NodeHandle) -> Option<NodeHandle>;
    fn children(&self, node: &NodeHandle) -> Vec<NodeHandle>;
    fn visibility(&self, node: &NodeHandle) -> anyhow::Result<Visibility>;
    fn set_visibility(&self, node: &NodeHandle, state: Visibility) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ViewportRenderer: Send + Sync {
    /// Names of the render variables currently registered on the render product.
    fn render_vars(&self) -> Vec<String>;

    fn add_render_var(&self, name: &str, data_type: &str) -> anyhow::Result<()>;

    /// Resolves once the viewport has presented `count` more frames.
    async fn next_frames(&self, count: u32);

    /// Capture one buffer of the active viewport.
    async fn capture(&self, kind: &BufferKind) -> anyhow::Result<RawCapture>;
}

/// Receives decoded buffers as they are captured.
pub trait PreviewSink: Send + Sync {
    fn preview(&self, control_name: &str, image: &DynamicImage);
}

/// Switches named variant sets on the host scene (used by batch runs).
#[async_trait]
pub trait VariantSwitcher: Send + Sync {
    async fn set_variant(&self, variant_set: &str, value: &str) -> anyhow::Result<()>;
}

/// Sending half of [`capture_callback`]; hand it to a callback-style capture API.
pub struct CaptureCallback(oneshot::Sender<RawCapture>);

/// Awaitable half of [`capture_callback`].
pub struct CaptureReceipt(oneshot::Receiver<RawCapture>);

/// Bridge a host's completion-callback capture API into an awaitable.
///
/// A callback dropped without completing makes the receipt fail rather than hang.
pub fn capture_callback() -> (CaptureCallback, CaptureReceipt) {
    let (tx, rx) = oneshot::channel();
    (CaptureCallback(tx), CaptureReceipt(rx))
}

impl CaptureCallback {
    pub fn complete(self, raw: RawCapture) {
        if self.0.send(raw).is_err() {
            tracing::debug!("capture completed after the receiver was dropped");
        }
    }
}

impl CaptureReceipt {
    pub async fn wait(self) -> anyhow::Result<RawCapture> {
        self.0
            .await
            .map_err(|_| anyhow::anyhow!("capture callback dropped without delivering a buffer"))
    }
}
