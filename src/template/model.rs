use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde_json::Value;

use super::{
    graph::{JobTemplate, load_template_from_path},
    spec::{
        ParameterSpec, ParameterValue, ParameterValues, ValueType, derive_specs, duplicate_name,
        load_sidecar,
    },
};
use crate::{
    capture::CapturedBufferMap,
    error::{UpliftError, UpliftResult},
};

/// A loaded job template together with its parameter specs and current values.
#[derive(Debug, Clone)]
pub struct TemplateModel {
    templates_dir: PathBuf,
    annotation_tag: String,
    name: Option<String>,
    template: JobTemplate,
    specs: Vec<ParameterSpec>,
    values: ParameterValues,
}

impl TemplateModel {
    /// An empty model; call [`TemplateModel::load`] before merging.
    pub fn new(templates_dir: impl Into<PathBuf>, annotation_tag: impl Into<String>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            annotation_tag: annotation_tag.into(),
            name: None,
            template: JobTemplate::default(),
            specs: Vec::new(),
            values: ParameterValues::new(),
        }
    }

    pub fn open(
        templates_dir: impl Into<PathBuf>,
        annotation_tag: impl Into<String>,
        name: &str,
    ) -> UpliftResult<Self> {
        let mut model = Self::new(templates_dir, annotation_tag);
        model.load(name)?;
        Ok(model)
    }

    /// Build a model around an in-memory template.
    ///
    /// Specs are derived from annotations when `specs` is `None`; explicit specs must have
    /// unique names, like a sidecar.
    pub fn from_template(
        template: JobTemplate,
        specs: Option<Vec<ParameterSpec>>,
        annotation_tag: impl Into<String>,
    ) -> UpliftResult<Self> {
        let annotation_tag = annotation_tag.into();
        let specs = match specs {
            Some(specs) => {
                if let Some(name) = duplicate_name(&specs) {
                    return Err(UpliftError::template_load(format!(
                        "parameter '{name}' is declared twice"
                    )));
                }
                specs
            }
            None => derive_specs(&template, &annotation_tag)?,
        };
        let mut model = Self {
            templates_dir: PathBuf::new(),
            annotation_tag,
            name: None,
            template,
            specs,
            values: ParameterValues::new(),
        };
        model.bind_controls();
        model.reset_parameters();
        Ok(model)
    }

    /// Load `<templates_dir>/<name>.json` and its optional `<name>.spec` sidecar.
    ///
    /// On error the previously loaded template stays in place.
    #[tracing::instrument(skip(self), fields(dir = %self.templates_dir.display()))]
    pub fn load(&mut self, name: &str) -> UpliftResult<()> {
        let template_path = self.templates_dir.join(format!("{name}.json"));
        let sidecar_path = self.templates_dir.join(format!("{name}.spec"));

        let template = load_template_from_path(&template_path)?;
        let specs = if sidecar_path.exists() {
            tracing::debug!(sidecar = %sidecar_path.display(), "using parameter sidecar");
            load_sidecar(&sidecar_path)?
        } else {
            derive_specs(&template, &self.annotation_tag)?
        };

        self.name = Some(name.to_string());
        self.template = template;
        self.specs = specs;
        let unresolved = self.bind_controls();
        self.reset_parameters();
        tracing::info!(
            template = name,
            parameters = self.specs.len(),
            unresolved = unresolved.len(),
            "template loaded"
        );
        Ok(())
    }

    pub fn set_mode(&mut self, name: &str) -> UpliftResult<()> {
        self.load(name)
    }

    /// Names of the templates (`*.json`) in the templates directory, sorted.
    pub fn available_templates(&self) -> UpliftResult<Vec<String>> {
        list_templates(&self.templates_dir)
    }

    /// Bind every unbound spec to the first unclaimed node whose title equals its
    /// `control_name`. Returns the names of specs that stay unresolved.
    pub fn bind_controls(&mut self) -> Vec<String> {
        let ids = self.template.node_ids();
        let mut claimed: HashSet<String> =
            self.specs.iter().filter_map(|s| s.control_id.clone()).collect();
        let mut unresolved = Vec::new();

        for spec in self.specs.iter_mut().filter(|s| s.control_id.is_none()) {
            let found = ids.iter().find(|id| {
                !claimed.contains(**id)
                    && self
                        .template
                        .node(id)
                        .is_some_and(|n| n.title() == spec.control_name)
            });
            match found {
                Some(id) => {
                    claimed.insert(id.to_string());
                    spec.control_id = Some(id.to_string());
                }
                None => {
                    tracing::warn!(parameter = %spec.name, control = %spec.control_name, "no node matches control name");
                    unresolved.push(spec.name.clone());
                }
            }
        }
        unresolved
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn template(&self) -> &JobTemplate {
        &self.template
    }

    pub fn list_parameters(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn values(&self) -> &ParameterValues {
        &self.values
    }

    /// Re-initialize every value to its spec default and drop user-set images.
    ///
    /// A default that is not a value of the spec's type is left out, so merge keeps the
    /// template's own input for that slot.
    pub fn reset_parameters(&mut self) {
        let mut values = ParameterValues::new();
        for spec in &self.specs {
            match ParameterValue::from_default(spec.value_type, &spec.default_value) {
                Some(v) => {
                    values.insert(spec.name.clone(), v);
                }
                None if spec.value_type != ValueType::ImageReference => {
                    tracing::warn!(
                        parameter = %spec.name,
                        default = %spec.default_value,
                        "default is not a {:?}; template value kept",
                        spec.value_type
                    );
                }
                None => {}
            }
        }
        self.values = values;
    }

    /// Type-check `value` against the named spec; `Integer` is widened for `Scalar` specs.
    pub fn checked_value(&self, name: &str, value: ParameterValue) -> UpliftResult<ParameterValue> {
        let spec = self
            .parameter(name)
            .ok_or_else(|| UpliftError::parameter(format!("unknown parameter '{name}'")))?;
        if !value.fits(spec.value_type) {
            return Err(UpliftError::parameter(format!(
                "parameter '{name}' expects {:?}, got {:?}",
                spec.value_type,
                value.value_type()
            )));
        }
        Ok(match (spec.value_type, value) {
            (ValueType::Scalar, ParameterValue::Integer(v)) => ParameterValue::Scalar(v as f64),
            (_, v) => v,
        })
    }

    pub fn set_parameter(&mut self, name: &str, value: ParameterValue) -> UpliftResult<()> {
        let value = self.checked_value(name, value)?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Parse `raw` according to the parameter's declared type and store it.
    pub fn set_parameter_text(&mut self, name: &str, raw: &str) -> UpliftResult<()> {
        let ty = self
            .parameter(name)
            .map(|s| s.value_type)
            .ok_or_else(|| UpliftError::parameter(format!("unknown parameter '{name}'")))?;
        let value = ParameterValue::parse_text(ty, raw)?;
        self.set_parameter(name, value)
    }

    /// Text values in spec order, newline separated. Used for prompt screening.
    pub fn text_prompt(&self, values: &ParameterValues) -> String {
        self.specs
            .iter()
            .filter(|s| s.value_type == ValueType::Text)
            .filter_map(|s| values.get(&s.name).and_then(ParameterValue::as_text))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Produce a fresh template instance with `values` and `buffers` written into bound slots.
    pub fn merge(
        &self,
        values: &ParameterValues,
        buffers: &CapturedBufferMap,
    ) -> UpliftResult<JobTemplate> {
        let mut out = self.template.clone();

        for spec in &self.specs {
            let Some(node_id) = spec.control_id.as_deref() else {
                tracing::debug!(parameter = %spec.name, "unbound parameter skipped at merge");
                continue;
            };

            let value = if spec.value_type == ValueType::ImageReference {
                if let Some(buffer) = buffers.get(&spec.control_name) {
                    Value::String(buffer.to_base64())
                } else if let Some(v) = values
                    .get(&spec.name)
                    .filter(|v| matches!(v, ParameterValue::ImageReference(_)))
                {
                    v.to_json()
                } else if spec.buffer_kind.is_some() {
                    return Err(UpliftError::MissingBuffer(spec.control_name.clone()));
                } else {
                    continue;
                }
            } else {
                match values.get(&spec.name) {
                    Some(v) => v.to_json(),
                    None => continue,
                }
            };

            out.set_input(node_id, &spec.input_name, value)?;
        }
        Ok(out)
    }
}

pub fn list_templates(dir: &Path) -> UpliftResult<Vec<String>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list templates in {}", dir.display()))?;
    let mut names = Vec::new();
    for entry in entries {
        let path = entry.context("failed to read templates directory entry")?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}
