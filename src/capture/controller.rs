use std::{collections::BTreeSet, sync::Arc, time::Instant};

use anyhow::Context;
use image::DynamicImage;

use super::{
    buffers::CapturedBufferMap,
    host::{PreviewSink, SceneGraph, ViewportRenderer},
    plan::{BufferKind, CapturePlanEntry, plan_from_parameters},
    visibility::VisibilityGuard,
};
use crate::{
    error::UpliftResult,
    pixels::{EncodedImage, decode_capture, resize_to_target},
    template::spec::ParameterSpec,
};

/// Frames presented after a visibility change before the viewport is trusted to reflect it.
pub const FRAMES_TO_WAIT: u32 = 5;

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub frames_to_wait: u32,
    /// `[width, height]` to resize captures towards; `None` keeps the native size.
    pub target_size: Option<[u32; 2]>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frames_to_wait: FRAMES_TO_WAIT,
            target_size: None,
        }
    }
}

/// Runs a capture plan against the host viewport and keeps the resulting buffers.
pub struct BufferCaptureController {
    scene: Arc<dyn SceneGraph>,
    renderer: Arc<dyn ViewportRenderer>,
    settings: CaptureSettings,
    active: BTreeSet<BufferKind>,
    plan: Vec<CapturePlanEntry>,
    captured: CapturedBufferMap,
    preview: Option<Arc<dyn PreviewSink>>,
}

impl BufferCaptureController {
    pub fn new(
        scene: Arc<dyn SceneGraph>,
        renderer: Arc<dyn ViewportRenderer>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            scene,
            renderer,
            settings,
            active: BTreeSet::new(),
            plan: Vec::new(),
            captured: CapturedBufferMap::new(),
            preview: None,
        }
    }

    pub fn supported_buffer_kinds() -> Vec<BufferKind> {
        BufferKind::SUPPORTED.to_vec()
    }

    pub fn set_active_buffers(&mut self, kinds: impl IntoIterator<Item = BufferKind>) {
        self.active = kinds
            .into_iter()
            .filter(|k| {
                let ok = k.is_supported();
                if !ok {
                    tracing::error!(buffer = %k, "buffer kind is not supported");
                }
                ok
            })
            .collect();
    }

    pub fn active_buffers(&self) -> &BTreeSet<BufferKind> {
        &self.active
    }

    pub fn set_capture_plan(&mut self, plan: Vec<CapturePlanEntry>) {
        self.plan = plan;
    }

    pub fn capture_plan(&self) -> &[CapturePlanEntry] {
        &self.plan
    }

    /// Replace active kinds and plan with the ones implied by a template's parameters.
    pub fn configure_from_parameters(&mut self, specs: &[ParameterSpec]) {
        let (kinds, plan) = plan_from_parameters(specs);
        tracing::info!(
            buffers = kinds.len(),
            entries = plan.len(),
            "capture plan configured"
        );
        self.set_active_buffers(kinds);
        self.set_capture_plan(plan);
    }

    pub fn set_preview_sink(&mut self, sink: Option<Arc<dyn PreviewSink>>) {
        self.preview = sink;
    }

    pub fn get_captured(&self) -> &CapturedBufferMap {
        &self.captured
    }

    /// Wait for the viewport to present `count` frames.
    pub async fn wait_frames(&self, count: u32) {
        self.renderer.next_frames(count).await;
    }

    /// Execute the plan in order and replace the captured map.
    ///
    /// A failing capture or decode is logged and skipped. Visibility changes are always
    /// reverted; a failure to apply or revert them ends the pass and is returned. The map is
    /// replaced in every case, so after an error it only holds buffers from this pass.
    #[tracing::instrument(skip(self), fields(entries = self.plan.len()))]
    pub async fn capture_async(&mut self) -> UpliftResult<()> {
        let mut captured = CapturedBufferMap::new();
        let result = self.run_plan(&mut captured).await;
        match &result {
            Ok(()) => tracing::info!(captured = captured.len(), "capture finished"),
            Err(e) => tracing::error!(captured = captured.len(), error = %e, "capture pass aborted"),
        }
        self.captured = captured;
        result
    }

    async fn run_plan(&self, captured: &mut CapturedBufferMap) -> UpliftResult<()> {
        let wait = self.settings.frames_to_wait;

        for entry in &self.plan {
            if !self.active.contains(&entry.buffer_kind) {
                tracing::debug!(buffer = %entry.buffer_kind, "buffer kind not active; skipped");
                continue;
            }
            if let Err(e) = self.ensure_render_var(&entry.buffer_kind) {
                tracing::error!(buffer = %entry.buffer_kind, error = %format!("{e:#}"), "render var unavailable");
                continue;
            }

            let guard = VisibilityGuard::apply(
                self.scene.clone(),
                entry.scene_node_path.as_deref(),
                &entry.visibility_policy,
            )?;
            let mutated = guard.mutated();
            if mutated {
                self.wait_frames(wait).await;
            }

            match self.capture_entry(entry).await {
                Ok(image) => {
                    if let Some(sink) = &self.preview {
                        sink.preview(&entry.control_name, &image);
                    }
                    match EncodedImage::encode_png(&image) {
                        Ok(encoded) => captured.insert(entry.control_name.clone(), encoded),
                        Err(e) => {
                            tracing::error!(control = %entry.control_name, error = %e, "encode failed")
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(control = %entry.control_name, buffer = %entry.buffer_kind, error = %e, "capture failed");
                }
            }

            let reverted = guard.revert();
            if mutated {
                self.wait_frames(wait).await;
            }
            reverted?;
        }
        Ok(())
    }

    async fn capture_entry(&self, entry: &CapturePlanEntry) -> UpliftResult<DynamicImage> {
        let started = Instant::now();
        let raw = self
            .renderer
            .capture(&entry.buffer_kind)
            .await
            .with_context(|| format!("capture {}", entry.buffer_kind))?;
        tracing::debug!(
            width = raw.width,
            height = raw.height,
            format = ?raw.format,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "buffer received"
        );

        let image = decode_capture(&raw)?;
        let image = match self.settings.target_size {
            Some(target) => resize_to_target(image, target),
            None => image,
        };
        tracing::debug!(
            control = %entry.control_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "buffer decoded"
        );
        Ok(image)
    }

    fn ensure_render_var(&self, kind: &BufferKind) -> anyhow::Result<()> {
        let name = kind.aov_name();
        if self.renderer.render_vars().iter().any(|v| v == name) {
            return Ok(());
        }
        self.renderer
            .add_render_var(name, kind.render_var_type())
            .with_context(|| format!("add render var {name}"))?;
        tracing::info!(render_var = name, "render var added");
        Ok(())
    }
}
