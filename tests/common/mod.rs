#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    io::Cursor,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::json;
use viewport_uplift::{
    backend::{ArtifactRef, GenerationBackend, JobHistory, JobRequest},
    capture::{BufferKind, NodeHandle, SceneGraph, ViewportRenderer, Visibility},
    pixels::{PixelFormat, RawCapture},
    template::JobTemplate,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn cases_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("cases")
}

/// Seed, prompt, and two capture-driven image slots.
pub fn annotated_template() -> JobTemplate {
    let text = json!({
        "3": {"class_type": "KSampler", "inputs": {"seed": 42, "cfg": 7.5}, "_meta": {"title": "CAVA(seed): Seed"}},
        "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "a cozy room"}, "_meta": {"title": "CAVA(text): Prompt"}},
        "9": {"class_type": "SaveImage", "inputs": {"images": ["8", 0]}, "_meta": {"title": "Save Image"}},
        "10": {"class_type": "LoadImageBase64", "inputs": {"image": ""}, "_meta": {"title": "CAVA(image): RGB"}},
        "11": {"class_type": "LoadImageBase64", "inputs": {"image": ""}, "_meta": {"title": "CAVA(image): Depth"}}
    })
    .to_string();
    JobTemplate::from_json_str(&text).expect("fixture template")
}

pub fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

pub fn rgba_capture(width: u32, height: u32, rgba: [u8; 4]) -> RawCapture {
    RawCapture {
        data: rgba.repeat((width * height) as usize),
        width,
        height,
        format: PixelFormat::Rgba8Unorm,
    }
}

pub fn depth_capture(width: u32, height: u32, value: f32) -> RawCapture {
    RawCapture {
        data: bytemuck::cast_slice(&vec![value; (width * height) as usize]).to_vec(),
        width,
        height,
        format: PixelFormat::R32Float,
    }
}

/// Path-addressed scene; a node's parent is its path minus the last segment.
#[derive(Default)]
pub struct FakeScene {
    nodes: Mutex<BTreeMap<String, Visibility>>,
    fail_restore: Mutex<Option<String>>,
    pub set_calls: Mutex<Vec<(String, Visibility)>>,
}

impl FakeScene {
    pub fn with_nodes(paths: &[&str]) -> Self {
        let scene = Self::default();
        {
            let mut nodes = scene.nodes.lock().unwrap();
            for p in paths {
                nodes.insert(p.to_string(), Visibility::Inherited);
            }
        }
        scene
    }

    pub fn visibility_of(&self, path: &str) -> Option<Visibility> {
        self.nodes.lock().unwrap().get(path).copied()
    }

    pub fn hidden(&self) -> Vec<String> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, v)| **v == Visibility::Invisible)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Make restoring `path` back to a visible state fail.
    pub fn fail_restore_of(&self, path: &str) {
        *self.fail_restore.lock().unwrap() = Some(path.to_string());
    }
}

fn parent_path(path: &str) -> Option<&str> {
    let (parent, _) = path.rsplit_once('/')?;
    (!parent.is_empty()).then_some(parent)
}

impl SceneGraph for FakeScene {
    fn node(&self, path: &str) -> Option<NodeHandle> {
        self.nodes
            .lock()
            .unwrap()
            .contains_key(path)
            .then(|| NodeHandle::new(path))
    }

    fn parent(&self, node: &NodeHandle) -> Option<NodeHandle> {
        let parent = parent_path(node.path())?;
        self.node(parent)
    }

    fn children(&self, node: &NodeHandle) -> Vec<NodeHandle> {
        self.nodes
            .lock()
            .unwrap()
            .keys()
            .filter(|p| parent_path(p) == Some(node.path()))
            .map(NodeHandle::new)
            .collect()
    }

    fn visibility(&self, node: &NodeHandle) -> Result<Visibility> {
        self.visibility_of(node.path())
            .ok_or_else(|| anyhow!("no node at {}", node.path()))
    }

    fn set_visibility(&self, node: &NodeHandle, state: Visibility) -> Result<()> {
        self.set_calls
            .lock()
            .unwrap()
            .push((node.path().to_string(), state));
        if state == Visibility::Inherited
            && self.fail_restore.lock().unwrap().as_deref() == Some(node.path())
        {
            bail!("visibility of {} is locked", node.path());
        }
        let mut nodes = self.nodes.lock().unwrap();
        let Some(v) = nodes.get_mut(node.path()) else {
            bail!("no node at {}", node.path());
        };
        *v = state;
        Ok(())
    }
}

/// Renderer returning canned buffers; records what was hidden at each capture.
pub struct FakeRenderer {
    scene: Arc<FakeScene>,
    render_vars: Mutex<Vec<String>>,
    captures: Mutex<BTreeMap<BufferKind, RawCapture>>,
    pub frames_waited: AtomicU32,
    pub hidden_at_capture: Mutex<Vec<(BufferKind, Vec<String>)>>,
    pub add_calls: Mutex<Vec<(String, String)>>,
}

impl FakeRenderer {
    pub fn new(scene: Arc<FakeScene>) -> Self {
        Self {
            scene,
            render_vars: Mutex::new(vec!["LdrColor".to_string()]),
            captures: Mutex::new(BTreeMap::new()),
            frames_waited: AtomicU32::new(0),
            hidden_at_capture: Mutex::new(Vec::new()),
            add_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn serve(&self, kind: BufferKind, raw: RawCapture) {
        self.captures.lock().unwrap().insert(kind, raw);
    }

    pub fn render_var_names(&self) -> Vec<String> {
        self.render_vars.lock().unwrap().clone()
    }
}

#[async_trait]
impl ViewportRenderer for FakeRenderer {
    fn render_vars(&self) -> Vec<String> {
        self.render_var_names()
    }

    fn add_render_var(&self, name: &str, data_type: &str) -> Result<()> {
        self.add_calls
            .lock()
            .unwrap()
            .push((name.to_string(), data_type.to_string()));
        self.render_vars.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn next_frames(&self, count: u32) {
        self.frames_waited.fetch_add(count, Ordering::SeqCst);
    }

    async fn capture(&self, kind: &BufferKind) -> Result<RawCapture> {
        self.hidden_at_capture
            .lock()
            .unwrap()
            .push((kind.clone(), self.scene.hidden()));
        self.captures
            .lock()
            .unwrap()
            .get(kind)
            .cloned()
            .ok_or_else(|| anyhow!("viewport produced no {kind} buffer"))
    }
}

/// One scripted answer to a history request.
#[derive(Clone)]
pub enum HistoryStep {
    NotFound,
    Error(String),
    Ready(JobHistory),
}

pub fn history(outputs: serde_json::Value) -> JobHistory {
    serde_json::from_value(json!({ "outputs": outputs })).expect("history fixture")
}

/// Backend replaying a history script; the last step repeats once the script runs out.
#[derive(Default)]
pub struct FakeBackend {
    script: Mutex<VecDeque<HistoryStep>>,
    artifacts: Mutex<BTreeMap<String, Vec<u8>>>,
    pub submitted: Mutex<Vec<JobRequest>>,
    pub history_calls: AtomicUsize,
    pub fetched: Mutex<Vec<ArtifactRef>>,
}

impl FakeBackend {
    pub fn with_script(steps: Vec<HistoryStep>) -> Self {
        let backend = Self::default();
        *backend.script.lock().unwrap() = steps.into();
        backend
    }

    pub fn serve_artifact(&self, filename: &str, bytes: Vec<u8>) {
        self.artifacts
            .lock()
            .unwrap()
            .insert(filename.to_string(), bytes);
    }

    pub fn request_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
            + self.history_calls.load(Ordering::SeqCst)
            + self.fetched.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn submit(&self, request: &JobRequest) -> Result<String> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(request.clone());
        Ok(format!("job-{}", submitted.len()))
    }

    async fn history(&self, _job_id: &str) -> Result<Option<JobHistory>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match step {
            None | Some(HistoryStep::NotFound) => Ok(None),
            Some(HistoryStep::Error(msg)) => Err(anyhow!(msg)),
            Some(HistoryStep::Ready(h)) => Ok(Some(h)),
        }
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        self.fetched.lock().unwrap().push(artifact.clone());
        self.artifacts
            .lock()
            .unwrap()
            .get(&artifact.filename)
            .cloned()
            .ok_or_else(|| anyhow!("no artifact named {}", artifact.filename))
    }
}
