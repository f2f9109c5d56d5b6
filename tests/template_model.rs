mod common;

use std::collections::HashSet;

use base64::{Engine as _, engine::general_purpose};
use proptest::prelude::*;
use serde_json::{Value, json};
use viewport_uplift::{
    UpliftError,
    capture::{BufferKind, CapturedBufferMap, VisibilityPolicy},
    pixels::EncodedImage,
    template::{
        DEFAULT_ANNOTATION_TAG, JobTemplate, ParameterSpec, ParameterValue, TemplateModel,
        ValueType, derive_specs,
    },
};

fn annotated_model() -> TemplateModel {
    TemplateModel::open(
        common::cases_root().join("annotated-template"),
        DEFAULT_ANNOTATION_TAG,
        "template",
    )
    .expect("load annotated template")
}

fn sidecar_model() -> TemplateModel {
    TemplateModel::open(
        common::cases_root().join("sidecar-template"),
        DEFAULT_ANNOTATION_TAG,
        "template",
    )
    .expect("load sidecar template")
}

fn encoded(rgba: [u8; 4]) -> EncodedImage {
    let png = common::png_bytes(4, 2, rgba);
    EncodedImage {
        png,
        width: 4,
        height: 2,
    }
}

fn spec(name: &str, control: &str, input: &str) -> ParameterSpec {
    ParameterSpec {
        name: name.to_string(),
        control_name: control.to_string(),
        input_name: input.to_string(),
        value_type: ValueType::Scalar,
        default_value: json!(1.0),
        buffer_kind: None,
        scene_node_path: None,
        visibility_policy: None,
        control_id: None,
    }
}

#[test]
fn annotations_derive_specs_in_node_order() {
    let model = annotated_model();
    let names: Vec<&str> = model
        .list_parameters()
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["Seed", "Prompt", "Negative", "RGB", "Depth", "Depth Strength"]
    );

    let seed = model.parameter("Seed").unwrap();
    assert_eq!(seed.value_type, ValueType::Integer);
    assert_eq!(seed.input_name, "seed");
    assert_eq!(seed.control_id.as_deref(), Some("3"));

    let rgb = model.parameter("RGB").unwrap();
    assert_eq!(rgb.value_type, ValueType::ImageReference);
    assert_eq!(rgb.control_name, "CAVA(image): RGB");
    assert_eq!(rgb.buffer_kind, Some(BufferKind::Color));
    assert_eq!(model.parameter("Depth").unwrap().buffer_kind, Some(BufferKind::Depth));

    let strength = model.parameter("Depth Strength").unwrap();
    assert_eq!(strength.value_type, ValueType::Scalar);
    assert_eq!(strength.buffer_kind, None);

    assert_eq!(
        model.values().get("Prompt"),
        Some(&ParameterValue::Text("a cozy reading room, warm light".into()))
    );
    assert!(model.values().get("RGB").is_none());
}

#[test]
fn sidecar_takes_precedence_and_keeps_unresolved_specs() {
    let model = sidecar_model();
    assert_eq!(model.list_parameters().len(), 5);

    let normal = model.parameter("Normal").unwrap();
    assert_eq!(normal.buffer_kind, Some(BufferKind::Normal));
    assert_eq!(normal.control_id.as_deref(), Some("1"));

    let product = model.parameter("Product").unwrap();
    assert_eq!(product.scene_node_path.as_deref(), Some("/World/Product"));
    assert_eq!(
        product.visibility_policy,
        Some(VisibilityPolicy::HideSiblingsExcept(vec!["Floor".into()]))
    );

    let upscale = model.parameter("Upscale").unwrap();
    assert_eq!(upscale.control_id, None);

    let mut buffers = CapturedBufferMap::new();
    buffers.insert("Load Normal", encoded([0, 0, 255, 255]));
    buffers.insert("Load Product", encoded([255, 0, 0, 255]));
    let merged = model.merge(model.values(), &buffers).unwrap();
    assert_eq!(merged.nodes.len(), model.template().nodes.len());
    assert_eq!(merged.input("4", "denoise"), Some(&json!(0.65)));
    assert!(merged.input("4", "scale_by").is_none());
}

#[test]
fn duplicate_titles_bind_to_distinct_nodes() {
    let template = JobTemplate::from_json_str(
        &json!({
            "2": {"class_type": "Lora", "inputs": {"strength": 0.5}, "_meta": {"title": "Lora"}},
            "10": {"class_type": "Lora", "inputs": {"strength": 0.5}, "_meta": {"title": "Lora"}},
            "11": {"class_type": "Lora", "inputs": {"strength": 0.5}, "_meta": {"title": "Other"}}
        })
        .to_string(),
    )
    .unwrap();
    let specs = vec![
        spec("First", "Lora", "strength"),
        spec("Second", "Lora", "strength"),
        spec("Third", "Lora", "strength"),
    ];
    let model = TemplateModel::from_template(template, Some(specs), DEFAULT_ANNOTATION_TAG).unwrap();

    let ids: Vec<Option<&str>> = model
        .list_parameters()
        .iter()
        .map(|s| s.control_id.as_deref())
        .collect();
    assert_eq!(ids, vec![Some("2"), Some("10"), None]);
}

#[test]
fn rebinding_does_not_steal_claimed_nodes() {
    let mut model = annotated_model();
    let before: Vec<_> = model
        .list_parameters()
        .iter()
        .map(|s| s.control_id.clone())
        .collect();
    let unresolved = model.bind_controls();
    let after: Vec<_> = model
        .list_parameters()
        .iter()
        .map(|s| s.control_id.clone())
        .collect();
    assert!(unresolved.is_empty());
    assert_eq!(before, after);
}

#[test]
fn ambiguous_annotations_are_rejected() {
    let template = JobTemplate::from_json_str(
        &json!({
            "1": {"class_type": "CLIPTextEncode", "inputs": {"text": "a"}, "_meta": {"title": "CAVA(text): Prompt"}},
            "2": {"class_type": "CLIPTextEncode", "inputs": {"text": "b"}, "_meta": {"title": "CAVA(text):Prompt"}}
        })
        .to_string(),
    )
    .unwrap();
    let err = derive_specs(&template, DEFAULT_ANNOTATION_TAG).unwrap_err();
    assert!(matches!(err, UpliftError::SpecDerivation(_)), "{err}");
}

#[test]
fn template_without_annotations_or_sidecar_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("plain.json"),
        json!({"1": {"class_type": "SaveImage", "inputs": {}, "_meta": {"title": "Save"}}})
            .to_string(),
    )
    .unwrap();

    let mut model = TemplateModel::new(dir.path(), DEFAULT_ANNOTATION_TAG);
    assert!(matches!(
        model.load("plain"),
        Err(UpliftError::SpecDerivation(_))
    ));
}

#[test]
fn failed_load_keeps_previous_template() {
    let mut model = annotated_model();
    let err = model.load("does-not-exist").unwrap_err();
    assert!(matches!(err, UpliftError::TemplateLoad(_)), "{err}");
    assert_eq!(model.name(), Some("template"));
    assert_eq!(model.list_parameters().len(), 6);
}

#[test]
fn explicit_specs_need_unique_names() {
    let specs = vec![
        spec("Strength", "CAVA(seed): Seed", "seed"),
        spec("Strength", "CAVA(text): Prompt", "text"),
    ];
    let err = TemplateModel::from_template(
        common::annotated_template(),
        Some(specs),
        DEFAULT_ANNOTATION_TAG,
    )
    .unwrap_err();
    assert!(matches!(err, UpliftError::TemplateLoad(_)), "{err}");
}

#[test]
fn invalid_sidecar_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("broken.json"),
        json!({"1": {"class_type": "X", "inputs": {}, "_meta": {"title": "CAVA(text): A"}}})
            .to_string(),
    )
    .unwrap();
    std::fs::write(dir.path().join("broken.spec"), "[{\"name\": 3}]").unwrap();

    let mut model = TemplateModel::new(dir.path(), DEFAULT_ANNOTATION_TAG);
    assert!(matches!(model.load("broken"), Err(UpliftError::TemplateLoad(_))));
}

#[test]
fn available_templates_lists_json_files_sorted() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["studio.json", "exterior.json", "exterior.spec", "notes.txt"] {
        std::fs::write(dir.path().join(name), "{}").unwrap();
    }
    let model = TemplateModel::new(dir.path(), DEFAULT_ANNOTATION_TAG);
    assert_eq!(
        model.available_templates().unwrap(),
        vec!["exterior".to_string(), "studio".to_string()]
    );
}

#[test]
fn reset_restores_defaults_and_is_idempotent() {
    let mut model = annotated_model();
    let defaults = model.values().clone();

    model
        .set_parameter("Prompt", ParameterValue::Text("a castle".into()))
        .unwrap();
    model.set_parameter("Seed", ParameterValue::Integer(7)).unwrap();
    model
        .set_parameter("RGB", ParameterValue::ImageReference(common::png_bytes(1, 1, [1, 2, 3, 4])))
        .unwrap();
    assert_ne!(model.values(), &defaults);

    model.reset_parameters();
    let once = model.values().clone();
    model.reset_parameters();
    assert_eq!(model.values(), &once);
    assert_eq!(once, defaults);
    assert!(once.get("RGB").is_none());
}

#[test]
fn set_parameter_checks_names_and_types() {
    let mut model = annotated_model();
    assert!(matches!(
        model.set_parameter("Nope", ParameterValue::Scalar(1.0)),
        Err(UpliftError::Parameter(_))
    ));
    assert!(matches!(
        model.set_parameter("Seed", ParameterValue::Text("x".into())),
        Err(UpliftError::Parameter(_))
    ));

    model
        .set_parameter("Depth Strength", ParameterValue::Integer(1))
        .unwrap();
    assert_eq!(
        model.values().get("Depth Strength"),
        Some(&ParameterValue::Scalar(1.0))
    );

    model.set_parameter_text("Seed", " 1234 ").unwrap();
    assert_eq!(model.values().get("Seed"), Some(&ParameterValue::Integer(1234)));
    assert!(model.set_parameter_text("Seed", "twelve").is_err());
}

#[test]
fn captured_buffer_lands_in_its_slot_as_base64_png() {
    let model = annotated_model();
    let rgb = encoded([10, 20, 30, 255]);
    let depth = encoded([128, 128, 128, 255]);
    let mut buffers = CapturedBufferMap::new();
    buffers.insert("CAVA(image): RGB", rgb.clone());
    buffers.insert("CAVA(image): Depth", depth);

    let merged = model.merge(model.values(), &buffers).unwrap();
    let Some(Value::String(slot)) = merged.input("10", "image") else {
        panic!("image slot not a string");
    };
    let bytes = general_purpose::STANDARD.decode(slot).unwrap();
    assert_eq!(bytes, rgb.png);

    let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
    assert_eq!(decoded.dimensions(), (4, 2));
    assert_eq!(decoded.get_pixel(3, 1).0, [10, 20, 30, 255]);

    assert_eq!(merged.input("3", "seed"), Some(&json!(42)));
    assert_eq!(merged.input("13", "strength"), Some(&json!(0.8)));
    // The loaded template itself is untouched.
    assert_eq!(model.template().input("10", "image"), Some(&json!("")));
}

#[test]
fn merge_applies_value_overrides() {
    let model = annotated_model();
    let mut buffers = CapturedBufferMap::new();
    buffers.insert("CAVA(image): RGB", encoded([1, 1, 1, 255]));
    buffers.insert("CAVA(image): Depth", encoded([2, 2, 2, 255]));

    let mut values = model.values().clone();
    values.insert("Prompt".into(), ParameterValue::Text("a lighthouse".into()));
    values.insert("Seed".into(), ParameterValue::Integer(9));
    let merged = model.merge(&values, &buffers).unwrap();

    assert_eq!(merged.input("6", "text"), Some(&json!("a lighthouse")));
    assert_eq!(merged.input("3", "seed"), Some(&json!(9)));
    assert_eq!(merged.input("6", "clip"), Some(&json!(["4", 1])));
}

#[test]
fn default_of_another_type_leaves_the_template_value() {
    let template = JobTemplate::from_json_str(
        &json!({
            "5": {"class_type": "Blend", "inputs": {"strength": "0.5"}, "_meta": {"title": "CAVA(strength): Strength"}},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "a pier"}, "_meta": {"title": "CAVA(text): Prompt"}}
        })
        .to_string(),
    )
    .unwrap();
    let model = TemplateModel::from_template(template, None, DEFAULT_ANNOTATION_TAG).unwrap();

    assert_eq!(model.list_parameters()[0].value_type, ValueType::Scalar);
    assert!(model.values().get("Strength").is_none());
    let merged = model.merge(model.values(), &CapturedBufferMap::new()).unwrap();
    assert_eq!(merged.input("5", "strength"), Some(&json!("0.5")));
    assert_eq!(merged.input("6", "text"), Some(&json!("a pier")));
}

#[test]
fn missing_capture_buffer_fails_the_merge() {
    let model = annotated_model();
    let mut buffers = CapturedBufferMap::new();
    buffers.insert("CAVA(image): RGB", encoded([1, 1, 1, 255]));

    match model.merge(model.values(), &buffers) {
        Err(UpliftError::MissingBuffer(control)) => assert_eq!(control, "CAVA(image): Depth"),
        other => panic!("expected MissingBuffer, got {other:?}"),
    }
}

#[test]
fn user_image_fills_slot_without_capture() {
    let mut model = annotated_model();
    let png = common::png_bytes(2, 2, [9, 9, 9, 255]);
    model
        .set_parameter("Depth", ParameterValue::ImageReference(png.clone()))
        .unwrap();
    let mut buffers = CapturedBufferMap::new();
    buffers.insert("CAVA(image): RGB", encoded([1, 1, 1, 255]));

    let merged = model.merge(model.values(), &buffers).unwrap();
    assert_eq!(
        merged.input("12", "image"),
        Some(&json!(general_purpose::STANDARD.encode(&png)))
    );
}

#[test]
fn text_prompt_joins_text_values_in_spec_order() {
    let model = annotated_model();
    assert_eq!(
        model.text_prompt(model.values()),
        "a cozy reading room, warm light\nblurry, low quality"
    );
}

fn title_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Save Image".to_string()),
        Just("Load Checkpoint".to_string()),
        (prop_oneof![Just("text"), Just("image"), Just("cfg")], "[A-D]")
            .prop_map(|(kind, name)| format!("CAVA({kind}): {name}")),
    ]
}

proptest! {
    #[test]
    fn derived_names_are_unique_or_rejected(titles in prop::collection::vec(title_strategy(), 1..8)) {
        let nodes: serde_json::Map<String, Value> = titles
            .iter()
            .enumerate()
            .map(|(i, t)| {
                (
                    (i + 1).to_string(),
                    json!({"class_type": "Node", "inputs": {}, "_meta": {"title": t}}),
                )
            })
            .collect();
        let template = JobTemplate::from_json_str(&Value::Object(nodes).to_string()).unwrap();

        match derive_specs(&template, DEFAULT_ANNOTATION_TAG) {
            Ok(specs) => {
                let names: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
                prop_assert_eq!(names.len(), specs.len());
                prop_assert!(!specs.is_empty());
            }
            Err(e) => prop_assert!(matches!(e, UpliftError::SpecDerivation(_))),
        }
    }
}
