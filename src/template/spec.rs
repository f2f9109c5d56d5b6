use std::{collections::BTreeMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::graph::JobTemplate;
use crate::{
    capture::{BufferKind, VisibilityPolicy},
    error::{UpliftError, UpliftResult},
};

pub const DEFAULT_ANNOTATION_TAG: &str = "CAVA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(rename = "float", alias = "scalar")]
    Scalar,
    #[serde(rename = "int", alias = "integer")]
    Integer,
    #[serde(rename = "string", alias = "text")]
    Text,
    #[serde(rename = "image", alias = "image_reference")]
    ImageReference,
}

/// One named, typed parameter mapped onto an input slot of a template node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    /// Title of the node this parameter binds to.
    pub control_name: String,
    pub input_name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub default_value: Value,
    #[serde(default, alias = "buffer_name", skip_serializing_if = "Option::is_none")]
    pub buffer_kind: Option<BufferKind>,
    #[serde(default, alias = "asset_path", skip_serializing_if = "Option::is_none")]
    pub scene_node_path: Option<String>,
    #[serde(default, alias = "visibility", skip_serializing_if = "Option::is_none")]
    pub visibility_policy: Option<VisibilityPolicy>,
    /// Node id, set by binding.
    #[serde(skip)]
    pub control_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Scalar(f64),
    Integer(i64),
    Text(String),
    /// Encoded image bytes (PNG/JPEG); sent as base64 text.
    ImageReference(Vec<u8>),
}

pub type ParameterValues = BTreeMap<String, ParameterValue>;

impl ParameterValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Scalar(_) => ValueType::Scalar,
            Self::Integer(_) => ValueType::Integer,
            Self::Text(_) => ValueType::Text,
            Self::ImageReference(_) => ValueType::ImageReference,
        }
    }

    /// Initial value for a spec.
    ///
    /// `None` when the default is not a value of the spec's type (a link, a numeric string,
    /// a missing input); such slots keep the template's own value at merge. Image parameters
    /// never have a stored default.
    pub fn from_default(ty: ValueType, default: &Value) -> Option<Self> {
        match (ty, default) {
            (ValueType::Scalar, Value::Number(n)) => n.as_f64().map(Self::Scalar),
            (ValueType::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|v| v.floor() as i64))
                .map(Self::Integer),
            (ValueType::Text, Value::String(s)) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn parse_text(ty: ValueType, raw: &str) -> UpliftResult<Self> {
        let raw_trimmed = raw.trim();
        match ty {
            ValueType::Scalar => raw_trimmed
                .parse::<f64>()
                .map(Self::Scalar)
                .map_err(|e| UpliftError::parameter(format!("'{raw}' is not a number: {e}"))),
            ValueType::Integer => raw_trimmed
                .parse::<i64>()
                .map(Self::Integer)
                .map_err(|e| UpliftError::parameter(format!("'{raw}' is not an integer: {e}"))),
            ValueType::Text => Ok(Self::Text(raw.to_string())),
            ValueType::ImageReference => Self::image_from_path(Path::new(raw_trimmed)),
        }
    }

    pub fn image_from_path(path: &Path) -> UpliftResult<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read image at {}", path.display()))
            .map_err(|e| UpliftError::parameter(format!("{e:#}")))?;
        image::guess_format(&bytes).map_err(|e| {
            UpliftError::parameter(format!("{} is not an image: {e}", path.display()))
        })?;
        Ok(Self::ImageReference(bytes))
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Scalar(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Integer(v) => Value::from(*v),
            Self::Text(s) => Value::String(s.clone()),
            Self::ImageReference(bytes) => {
                use base64::{Engine as _, engine::general_purpose};
                Value::String(general_purpose::STANDARD.encode(bytes))
            }
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether a value of this variant may be stored for a spec of type `ty`.
    pub fn fits(&self, ty: ValueType) -> bool {
        let own = self.value_type();
        own == ty || (own == ValueType::Integer && ty == ValueType::Scalar)
    }
}

/// Parsed `TAG(<slot-kind>): <name>` node title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub slot_kind: String,
    pub name: String,
}

/// Parse a node title of the form `TAG(<slot-kind>): <name>`.
///
/// Whitespace around the parentheses, the colon and the name is ignored. Slot kind and
/// name must be non-empty; the tag is matched case-sensitively.
pub fn parse_annotation(tag: &str, title: &str) -> Option<Annotation> {
    let rest = title.trim().strip_prefix(tag)?;
    let rest = rest.trim_start().strip_prefix('(')?;
    let (kind, rest) = rest.split_once(')')?;
    let name = rest.trim_start().strip_prefix(':')?.trim();
    let kind = kind.trim();
    if kind.is_empty() || name.is_empty() {
        return None;
    }
    Some(Annotation {
        slot_kind: kind.to_string(),
        name: name.to_string(),
    })
}

pub fn value_type_for_slot(slot_kind: &str, default: &Value) -> ValueType {
    let kind = slot_kind.to_ascii_lowercase();
    if kind.contains("image") {
        ValueType::ImageReference
    } else if kind.contains("text") {
        ValueType::Text
    } else if default.is_i64() || default.is_u64() {
        ValueType::Integer
    } else {
        ValueType::Scalar
    }
}

/// Derive parameter specs from annotated node titles, in numeric node order.
pub fn derive_specs(template: &JobTemplate, tag: &str) -> UpliftResult<Vec<ParameterSpec>> {
    let mut specs: Vec<ParameterSpec> = Vec::new();

    for id in template.node_ids() {
        let Some(node) = template.node(id) else {
            continue;
        };
        let Some(annotation) = parse_annotation(tag, node.title()) else {
            continue;
        };
        if let Some(existing) = specs.iter().find(|s| s.name == annotation.name) {
            return Err(UpliftError::spec_derivation(format!(
                "parameter '{}' is annotated on both '{}' and node {id}",
                annotation.name, existing.control_name
            )));
        }

        let default_value = match node.inputs.get(&annotation.slot_kind) {
            Some(v) => v.clone(),
            None => {
                tracing::warn!(node = id, input = %annotation.slot_kind, "annotated input missing on node");
                Value::Null
            }
        };
        let value_type = value_type_for_slot(&annotation.slot_kind, &default_value);
        let buffer_kind = (value_type == ValueType::ImageReference)
            .then(|| BufferKind::from_parameter_name(&annotation.name))
            .flatten();

        specs.push(ParameterSpec {
            name: annotation.name,
            control_name: node.title().to_string(),
            input_name: annotation.slot_kind,
            value_type,
            default_value,
            buffer_kind,
            scene_node_path: None,
            visibility_policy: None,
            control_id: None,
        });
    }

    if specs.is_empty() {
        return Err(UpliftError::spec_derivation(format!(
            "no node title carries a '{tag}(<slot>): <name>' annotation"
        )));
    }
    Ok(specs)
}

pub fn load_sidecar(path: &Path) -> UpliftResult<Vec<ParameterSpec>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read sidecar at {}", path.display()))
        .map_err(|e| UpliftError::template_load(format!("{e:#}")))?;
    let specs: Vec<ParameterSpec> = serde_json::from_str(&text).map_err(|e| {
        UpliftError::template_load(format!("invalid sidecar {}: {e}", path.display()))
    })?;

    if let Some(name) = duplicate_name(&specs) {
        return Err(UpliftError::template_load(format!(
            "sidecar {} declares '{name}' twice",
            path.display()
        )));
    }
    Ok(specs)
}

/// First parameter name declared more than once, if any.
pub fn duplicate_name(specs: &[ParameterSpec]) -> Option<&str> {
    specs.iter().enumerate().find_map(|(i, spec)| {
        specs[..i]
            .iter()
            .any(|s| s.name == spec.name)
            .then_some(spec.name.as_str())
    })
}
