use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use tokio::sync::watch;

use crate::{
    backend::{GenerationBackend, JobRequest, select_artifact},
    capture::CapturedBufferMap,
    error::{UpliftError, UpliftResult},
    pixels::GeneratedImage,
    safety::SafetyScreen,
    template::{ParameterValue, ParameterValues, TemplateModel},
};

/// Size of the image returned when a prompt is screened out.
pub const PLACEHOLDER_SIZE: [u32; 2] = [1024, 1024];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
    /// Accept `temp` (preview) artifacts when a node has no `output` artifact.
    pub allow_preview: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(600),
            allow_preview: false,
        }
    }
}

impl PollSettings {
    pub fn attempts(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        (self.timeout.as_millis() / interval).clamp(1, u32::MAX as u128) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    Submitted,
    Polling,
    Completed,
    TimedOut,
    Failed,
}

impl GenerationState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Completed(GeneratedImage),
    /// The prompt was rejected before submission; carries the transparent placeholder.
    Screened(GeneratedImage),
    /// Another generation is in flight; nothing was submitted.
    Busy,
    Failed(String),
}

impl GenerationOutcome {
    pub fn image(&self) -> Option<&GeneratedImage> {
        match self {
            Self::Completed(img) | Self::Screened(img) => Some(img),
            Self::Busy | Self::Failed(_) => None,
        }
    }

    pub fn into_image(self) -> Option<GeneratedImage> {
        match self {
            Self::Completed(img) | Self::Screened(img) => Some(img),
            Self::Busy | Self::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StateTrack {
    current: GenerationState,
    last_terminal: Option<GenerationState>,
}

/// Clears the busy flag and returns the state machine to `Idle` however `generate` exits.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    state: &'a Mutex<StateTrack>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut s) = self.state.lock() {
            s.current = GenerationState::Idle;
        }
        self.busy.store(false, Ordering::Release);
    }
}

/// Single-flight driver of one generation job: merge, screen, submit, poll, decode.
pub struct GenerationOrchestrator {
    model: TemplateModel,
    backend: Arc<dyn GenerationBackend>,
    screen: SafetyScreen,
    poll: PollSettings,
    client_id: String,
    captured: CapturedBufferMap,
    busy: AtomicBool,
    state: Mutex<StateTrack>,
    progress: watch::Sender<f32>,
}

impl GenerationOrchestrator {
    pub fn new(
        model: TemplateModel,
        backend: Arc<dyn GenerationBackend>,
        screen: SafetyScreen,
        poll: PollSettings,
    ) -> Self {
        let (progress, _) = watch::channel(0.0);
        Self {
            model,
            backend,
            screen,
            poll,
            client_id: uuid::Uuid::new_v4().to_string(),
            captured: CapturedBufferMap::new(),
            busy: AtomicBool::new(false),
            state: Mutex::new(StateTrack {
                current: GenerationState::Idle,
                last_terminal: None,
            }),
            progress,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn model(&self) -> &TemplateModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut TemplateModel {
        &mut self.model
    }

    pub fn poll_settings(&self) -> &PollSettings {
        &self.poll
    }

    pub fn set_parameter(&mut self, name: &str, value: ParameterValue) -> UpliftResult<()> {
        self.model.set_parameter(name, value)
    }

    pub fn reset_parameters(&mut self) {
        self.model.reset_parameters();
    }

    /// Replace the buffers used by the next merge.
    pub fn update_captured(&mut self, buffers: CapturedBufferMap) {
        tracing::debug!(buffers = buffers.len(), "captured buffers updated");
        self.captured = buffers;
    }

    pub fn captured(&self) -> &CapturedBufferMap {
        &self.captured
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn state(&self) -> GenerationState {
        self.state
            .lock()
            .map(|s| s.current)
            .unwrap_or(GenerationState::Idle)
    }

    /// Terminal state reached by the most recent generation, if any.
    pub fn last_terminal_state(&self) -> Option<GenerationState> {
        self.state.lock().ok().and_then(|s| s.last_terminal)
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<f32> {
        self.progress.subscribe()
    }

    /// Run one generation. Never returns an error: failures become [`GenerationOutcome::Failed`].
    #[tracing::instrument(skip_all, fields(client_id = %self.client_id))]
    pub async fn generate(&self, overrides: &ParameterValues) -> GenerationOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("generation already in flight; request dropped");
            return GenerationOutcome::Busy;
        }
        let _guard = BusyGuard {
            busy: &self.busy,
            state: &self.state,
        };
        self.progress.send_replace(0.0);

        match self.run(overrides).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let state = match e {
                    UpliftError::GenerationTimeout { .. } => GenerationState::TimedOut,
                    _ => GenerationState::Failed,
                };
                self.set_state(state);
                tracing::error!(error = %e, "generation failed");
                GenerationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn run(&self, overrides: &ParameterValues) -> UpliftResult<GenerationOutcome> {
        let mut values = self.model.values().clone();
        for (name, value) in overrides {
            let value = self.model.checked_value(name, value.clone())?;
            values.insert(name.clone(), value);
        }

        let prompt_text = self.model.text_prompt(&values);
        if !prompt_text.is_empty() && !self.screen.is_safe(&prompt_text) {
            tracing::warn!("prompt rejected by safety screen; returning placeholder");
            self.set_state(GenerationState::Completed);
            self.progress.send_replace(1.0);
            let [w, h] = PLACEHOLDER_SIZE;
            return Ok(GenerationOutcome::Screened(GeneratedImage::transparent(w, h)));
        }

        let prompt = self.model.merge(&values, &self.captured)?;
        self.progress.send_replace(0.2);

        let request = JobRequest {
            prompt,
            client_id: self.client_id.clone(),
        };
        let job_id = self
            .backend
            .submit(&request)
            .await
            .map_err(|e| UpliftError::backend(format!("{e:#}")))?;
        self.set_state(GenerationState::Submitted);
        self.progress.send_replace(0.3);
        tracing::info!(job_id = %job_id, "job submitted");

        let artifacts = self.poll_artifacts(&job_id).await?;
        let first = artifacts.first().ok_or(UpliftError::NoOutput)?;
        let image = GeneratedImage::from_encoded(first)?;

        self.set_state(GenerationState::Completed);
        self.progress.send_replace(1.0);
        tracing::info!(job_id = %job_id, width = image.width, height = image.height, "generation completed");
        Ok(GenerationOutcome::Completed(image))
    }

    async fn poll_artifacts(&self, job_id: &str) -> UpliftResult<Vec<Vec<u8>>> {
        self.set_state(GenerationState::Polling);
        let attempts = self.poll.attempts();

        for attempt in 1..=attempts {
            match self.collect_once(job_id).await {
                Ok(images) if !images.is_empty() => {
                    tracing::info!(attempt, images = images.len(), "artifacts recovered");
                    return Ok(images);
                }
                Ok(_) => tracing::debug!(attempt, "job not ready"),
                Err(e) if attempt == attempts => {
                    return Err(UpliftError::GenerationTimeout {
                        attempts,
                        cause: format!("{e:#}"),
                    });
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %format!("{e:#}"), "poll attempt failed; retrying")
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }
        Err(UpliftError::NoOutput)
    }

    async fn collect_once(&self, job_id: &str) -> anyhow::Result<Vec<Vec<u8>>> {
        let Some(history) = self.backend.history(job_id).await? else {
            return Ok(Vec::new());
        };

        let mut images = Vec::new();
        for (node_id, output) in &history.outputs {
            let artifacts = output.artifacts();
            let Some(artifact) = select_artifact(&artifacts, self.poll.allow_preview) else {
                continue;
            };
            let bytes = self
                .backend
                .fetch_artifact(artifact)
                .await
                .with_context(|| format!("node {node_id}"))?;
            images.push(bytes);
        }
        Ok(images)
    }

    fn set_state(&self, state: GenerationState) {
        if let Ok(mut s) = self.state.lock() {
            tracing::debug!(from = ?s.current, to = ?state, "generation state");
            s.current = state;
            if state.is_terminal() {
                s.last_terminal = Some(state);
            }
        }
    }
}
