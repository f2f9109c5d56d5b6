use std::{collections::BTreeMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{UpliftError, UpliftResult};

/// A job template: the backend's node-graph document, keyed by node id.
///
/// Everything the crate does not interpret is kept in `extra` / `inputs` so a template
/// written back out is the same graph the author saved.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct JobTemplate {
    pub nodes: BTreeMap<String, TemplateNode>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TemplateNode {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub class_type: String,
    #[serde(rename = "_meta", default)]
    pub meta: NodeMeta,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct NodeMeta {
    #[serde(default)]
    pub title: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TemplateNode {
    pub fn title(&self) -> &str {
        &self.meta.title
    }
}

pub fn load_template_from_path(path: impl AsRef<Path>) -> UpliftResult<JobTemplate> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read template at {}", path.display()))
        .map_err(|e| UpliftError::template_load(format!("{e:#}")))?;
    JobTemplate::from_json_str(&text)
        .map_err(|e| UpliftError::template_load(format!("{}: {e}", path.display())))
}

impl JobTemplate {
    pub fn from_json_str(text: &str) -> UpliftResult<Self> {
        let template: JobTemplate = serde_json::from_str(text)
            .map_err(|e| UpliftError::template_load(format!("invalid template json: {e}")))?;
        if template.nodes.is_empty() {
            return Err(UpliftError::template_load("template has no nodes"));
        }
        Ok(template)
    }

    /// Node ids in numeric order (`"2"` before `"10"`); non-numeric ids sort last.
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), *id));
        ids
    }

    pub fn node(&self, id: &str) -> Option<&TemplateNode> {
        self.nodes.get(id)
    }

    pub fn input(&self, node_id: &str, input: &str) -> Option<&Value> {
        self.nodes.get(node_id).and_then(|n| n.inputs.get(input))
    }

    pub fn set_input(&mut self, node_id: &str, input: &str, value: Value) -> UpliftResult<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| UpliftError::parameter(format!("node not found: {node_id}")))?;
        node.inputs.insert(input.to_string(), value);
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
