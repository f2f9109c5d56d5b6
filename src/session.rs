use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{GenerationBackend, HttpBackend},
    capture::{BufferCaptureController, PreviewSink, SceneGraph, VariantSwitcher, ViewportRenderer},
    config::UpliftConfig,
    error::{UpliftError, UpliftResult},
    orchestrator::{GenerationOrchestrator, GenerationOutcome},
    template::{ParameterValues, TemplateModel},
    ws::{GenerateRequest, WsHub, spawn_transfer_server},
};

/// One entry of a batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Variant set name to selected variant.
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
    /// Parameter name to raw text value.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Where the generated PNG is written; a `.json` sidecar of this item lands next to it.
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub saved: Vec<PathBuf>,
    /// Index into the batch and the reason it failed.
    pub failed: Vec<(usize, String)>,
}

pub fn load_batch_file(path: &Path) -> UpliftResult<Vec<BatchItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read batch file at {}", path.display()))?;
    serde_json::from_str(&text)
        .map_err(|e| UpliftError::config(format!("invalid batch file {}: {e}", path.display())))
}

/// Wires capture, generation and the transfer hub for one host viewport.
pub struct Session {
    capture: BufferCaptureController,
    orchestrator: GenerationOrchestrator,
    hub: Option<WsHub>,
    variants: Option<Arc<dyn VariantSwitcher>>,
    requests: Option<Receiver<GenerateRequest>>,
    transfer_addr: Option<SocketAddr>,
}

impl Session {
    /// Configures the capture plan from the orchestrator's template.
    pub fn new(mut capture: BufferCaptureController, orchestrator: GenerationOrchestrator) -> Self {
        capture.configure_from_parameters(orchestrator.model().list_parameters());
        Self {
            capture,
            orchestrator,
            hub: None,
            variants: None,
            requests: None,
            transfer_addr: None,
        }
    }

    /// Build everything from configuration: template, safety screen, HTTP backend, capture.
    ///
    /// When `transfer.enabled` is set the transfer server is started on `transfer.listen_addr`.
    pub fn from_config(
        config: &UpliftConfig,
        scene: Arc<dyn SceneGraph>,
        renderer: Arc<dyn ViewportRenderer>,
    ) -> UpliftResult<Self> {
        let model = TemplateModel::open(
            &config.templates_dir,
            &config.annotation_tag,
            &config.default_template,
        )?;
        let screen = config.safety_screen()?;
        let backend: Arc<dyn GenerationBackend> =
            Arc::new(HttpBackend::new(&config.backend_address)?);
        let orchestrator =
            GenerationOrchestrator::new(model, backend, screen, config.poll_settings());
        let capture = BufferCaptureController::new(scene, renderer, config.capture_settings());

        let mut session = Self::new(capture, orchestrator);
        if config.transfer.enabled {
            session = session.serve_transfer(&config.transfer.listen_addr, config.transfer_hub())?;
        }
        tracing::info!(
            backend = %config.backend_address,
            template = %config.default_template,
            "session ready"
        );
        Ok(session)
    }

    /// Send results to `hub` and stream capture previews to it.
    pub fn with_transfer_hub(mut self, hub: WsHub) -> Self {
        let sink: Arc<dyn PreviewSink> = Arc::new(hub.clone());
        self.capture.set_preview_sink(Some(sink));
        self.hub = Some(hub);
        self
    }

    /// Start the transfer server on `addr` and attach `hub` to it.
    ///
    /// Inbound generate requests are picked up with [`Session::take_request`].
    pub fn serve_transfer(self, addr: &str, hub: WsHub) -> UpliftResult<Self> {
        let (request_tx, request_rx) = crossbeam_channel::bounded(1);
        let server = spawn_transfer_server(addr, request_tx, request_rx.clone(), hub.clone())?;

        let mut session = self.with_transfer_hub(hub);
        session.requests = Some(request_rx);
        session.transfer_addr = Some(server.local_addr);
        Ok(session)
    }

    /// Address the transfer server is bound to, if one was started.
    pub fn transfer_addr(&self) -> Option<SocketAddr> {
        self.transfer_addr
    }

    /// Latest pending generate request from a transfer client.
    pub fn take_request(&self) -> Option<GenerateRequest> {
        self.requests.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    pub fn with_variant_switcher(mut self, switcher: Arc<dyn VariantSwitcher>) -> Self {
        self.variants = Some(switcher);
        self
    }

    pub fn capture(&self) -> &BufferCaptureController {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut BufferCaptureController {
        &mut self.capture
    }

    pub fn orchestrator(&self) -> &GenerationOrchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut GenerationOrchestrator {
        &mut self.orchestrator
    }

    pub fn available_templates(&self) -> UpliftResult<Vec<String>> {
        self.orchestrator.model().available_templates()
    }

    /// Switch template and rebuild the capture plan for it.
    pub fn set_mode(&mut self, name: &str) -> UpliftResult<()> {
        self.orchestrator.model_mut().set_mode(name)?;
        self.configure_capture();
        Ok(())
    }

    pub fn configure_capture(&mut self) {
        self.capture
            .configure_from_parameters(self.orchestrator.model().list_parameters());
    }

    /// Apply text parameters, capture the viewport, generate and broadcast the result.
    ///
    /// Empty values leave the parameter untouched and parameter errors are logged. A failed
    /// capture ends the request as [`GenerationOutcome::Failed`] without contacting the backend.
    #[tracing::instrument(skip_all, fields(parameters = parameters.len()))]
    pub async fn capture_and_generate(
        &mut self,
        parameters: &BTreeMap<String, String>,
    ) -> GenerationOutcome {
        if self.orchestrator.is_busy() {
            tracing::warn!("generation already in flight; request dropped");
            return GenerationOutcome::Busy;
        }

        for (name, raw) in parameters.iter().filter(|(_, v)| !v.is_empty()) {
            if let Err(e) = self.orchestrator.model_mut().set_parameter_text(name, raw) {
                tracing::warn!(parameter = %name, error = %e, "parameter ignored");
            }
        }

        let captured = self.capture.capture_async().await;
        self.orchestrator
            .update_captured(self.capture.get_captured().clone());
        if let Err(e) = captured {
            tracing::error!(error = %e, "capture failed; generation skipped");
            return GenerationOutcome::Failed(format!("capture failed: {e}"));
        }

        let outcome = self.orchestrator.generate(&ParameterValues::new()).await;
        if let (Some(hub), Some(image)) = (&self.hub, outcome.image()) {
            match image.to_rgba_image() {
                Ok(rgba) => {
                    if let Err(e) = hub.send_image(&rgba, &hub.result_options()) {
                        tracing::error!(error = %e, "result transfer failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "result image is malformed"),
            }
        }
        outcome
    }

    pub async fn handle_request(&mut self, request: GenerateRequest) -> GenerationOutcome {
        tracing::debug!(request_id = ?request.request_id, "generate request");
        self.capture_and_generate(&request.parameters).await
    }

    /// Generate every item in order; failures are recorded and the batch continues.
    #[tracing::instrument(skip_all, fields(items = items.len()))]
    pub async fn generate_batch(&mut self, items: &[BatchItem]) -> BatchReport {
        let mut report = BatchReport::default();
        for (index, item) in items.iter().enumerate() {
            match self.generate_single(item).await {
                Ok(path) => {
                    tracing::info!(index, output = %path.display(), "batch item saved");
                    report.saved.push(path);
                }
                Err(e) => {
                    tracing::error!(index, error = %e, "batch item failed");
                    report.failed.push((index, e.to_string()));
                }
            }
        }
        report
    }

    async fn generate_single(&mut self, item: &BatchItem) -> UpliftResult<PathBuf> {
        if let Some(dir) = item.output.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let sidecar = item.output.with_extension("json");
        let json = serde_json::to_string_pretty(item).map_err(anyhow::Error::from)?;
        std::fs::write(&sidecar, json)
            .with_context(|| format!("failed to write {}", sidecar.display()))?;

        if !item.variants.is_empty() {
            let Some(switcher) = self.variants.clone() else {
                return Err(UpliftError::config(
                    "batch item sets variants but no variant switcher is configured",
                ));
            };
            for (set, value) in &item.variants {
                switcher
                    .set_variant(set, value)
                    .await
                    .with_context(|| format!("failed to set variant {set}={value}"))?;
            }
        }

        for (name, raw) in &item.parameters {
            self.orchestrator.model_mut().set_parameter_text(name, raw)?;
        }

        let captured = self.capture.capture_async().await;
        self.orchestrator
            .update_captured(self.capture.get_captured().clone());
        captured?;

        match self.orchestrator.generate(&ParameterValues::new()).await {
            GenerationOutcome::Completed(image) | GenerationOutcome::Screened(image) => {
                image.save_png(&item.output)?;
                Ok(item.output.clone())
            }
            GenerationOutcome::Busy => Err(UpliftError::backend("orchestrator busy")),
            GenerationOutcome::Failed(message) => Err(UpliftError::backend(message)),
        }
    }
}
