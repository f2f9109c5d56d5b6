use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use super::visibility::VisibilityPolicy;
use crate::template::spec::{ParameterSpec, ValueType};

/// A category of render output the viewport can hand back.
///
/// Serialized as the renderer's AOV name (`LdrColor`, `DepthLinearized`, `SmoothNormal`).
/// Unknown names survive as [`BufferKind::Other`] so a sidecar can mention them; the
/// capture plan skips them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BufferKind {
    Color,
    Depth,
    Normal,
    Other(String),
}

impl BufferKind {
    pub const SUPPORTED: [BufferKind; 3] = [BufferKind::Color, BufferKind::Depth, BufferKind::Normal];

    pub fn aov_name(&self) -> &str {
        match self {
            Self::Color => "LdrColor",
            Self::Depth => "DepthLinearized",
            Self::Normal => "SmoothNormal",
            Self::Other(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Data type of the render variable backing this kind.
    pub fn render_var_type(&self) -> &'static str {
        match self {
            Self::Depth => "float",
            _ => "color3f",
        }
    }

    /// Naming convention used when specs are derived from template annotations.
    pub fn from_parameter_name(name: &str) -> Option<Self> {
        if name.contains("RGB") {
            Some(Self::Color)
        } else if name.contains("Depth") {
            Some(Self::Depth)
        } else if name.contains("Normal") {
            Some(Self::Normal)
        } else {
            None
        }
    }
}

impl From<String> for BufferKind {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "ldrcolor" | "color" | "rgb" => Self::Color,
            "depthlinearized" | "depth" => Self::Depth,
            "smoothnormal" | "normal" => Self::Normal,
            _ => Self::Other(s),
        }
    }
}

impl From<BufferKind> for String {
    fn from(kind: BufferKind) -> Self {
        kind.aov_name().to_string()
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.aov_name())
    }
}

/// One capture pass: which buffer, which control receives it, and what to hide meanwhile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturePlanEntry {
    pub buffer_kind: BufferKind,
    pub control_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_node_path: Option<String>,
    #[serde(default)]
    pub visibility_policy: VisibilityPolicy,
}

/// Derive the active buffer kinds and the ordered plan from a template's image parameters.
pub fn plan_from_parameters(
    specs: &[ParameterSpec],
) -> (BTreeSet<BufferKind>, Vec<CapturePlanEntry>) {
    let mut kinds = BTreeSet::new();
    let mut plan = Vec::new();

    for spec in specs
        .iter()
        .filter(|s| s.value_type == ValueType::ImageReference)
    {
        let Some(kind) = spec.buffer_kind.clone() else {
            tracing::debug!(parameter = %spec.name, "image parameter has no buffer kind; not captured");
            continue;
        };
        if !kind.is_supported() {
            tracing::error!(parameter = %spec.name, buffer = %kind, "buffer kind is not supported");
            continue;
        }

        kinds.insert(kind.clone());
        plan.push(CapturePlanEntry {
            buffer_kind: kind,
            control_name: spec.control_name.clone(),
            scene_node_path: spec.scene_node_path.clone(),
            visibility_policy: spec.visibility_policy.clone().unwrap_or_default(),
        });
    }

    (kinds, plan)
}
