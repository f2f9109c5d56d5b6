//! Job templates and their parameter model.
//!
//! A template is the backend's node graph; parameters are named, typed slots on its nodes,
//! declared either by a `<name>.spec` sidecar or by `TAG(<slot>): <name>` node titles.

pub mod graph;
pub mod model;
pub mod spec;

pub use graph::{JobTemplate, NodeMeta, TemplateNode, load_template_from_path};
pub use model::{TemplateModel, list_templates};
pub use spec::{
    Annotation, DEFAULT_ANNOTATION_TAG, ParameterSpec, ParameterValue, ParameterValues,
    ValueType, derive_specs, load_sidecar, parse_annotation,
};
