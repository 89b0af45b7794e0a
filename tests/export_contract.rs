// --- File: tests/export_contract.rs ---
//! End-to-end checks of the exported artifacts and the public naming contract.

use denoiseg_graph::asg::{AsgError, NodeType, Value, VariableCollection};
use denoiseg_graph::export::contract::{
    self, DENOISED, GRAPH_FILENAME, INPUT, PREDICTION_DIRECTORY, SEGMENTED,
};
use denoiseg_graph::export::{ExportError, GraphExporter, PublicPorts};
use denoiseg_graph::model::config::steps_per_epoch;
use denoiseg_graph::model::{DenoiSeg, DenoiSegConfig, ModelHandle};
use denoiseg_graph::serialization::signature::{
    DEFAULT_SERVING_SIGNATURE_KEY, PREDICT_METHOD_NAME, SERVING_TAG,
};
use denoiseg_graph::serialization::{load_bundle, read_graph_def, SerializationError};
use denoiseg_graph::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;
use std::path::Path;

fn small_config() -> DenoiSegConfig {
    DenoiSegConfig::from_data(&[4, 16, 16, 1])
        .with_unet_n_depth(2)
        .with_unet_n_first(4)
}

fn built_model() -> DenoiSeg {
    let context = GraphContext::shared();
    DenoiSeg::new(small_config(), "denoiseg_model", None, &context).unwrap()
}

fn prepared_model() -> DenoiSeg {
    let mut model = built_model();
    model.prepare_for_training();
    model.make_train_function().unwrap();
    model.make_test_function().unwrap();
    model.make_predict_function();
    model
}

fn graph_len(model: &DenoiSeg) -> usize {
    model.context().borrow().graph().len()
}

fn identity_source(graph: &denoiseg_graph::asg::Asg, name: &str) -> usize {
    match graph.node_by_name(name).map(|n| &n.node_type) {
        Some(NodeType::Identity(source)) => *source,
        other => panic!("{} is not an alias: {:?}", name, other),
    }
}

#[test]
fn test_artifacts_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let model = prepared_model();
    let summary = GraphExporter::new(dir.path()).with_seed(1).export(&model).unwrap();

    assert_eq!(summary.graph_path, dir.path().join(GRAPH_FILENAME));
    assert_eq!(summary.bundle_dir, dir.path().join(PREDICTION_DIRECTORY));
    assert!(summary.graph_path.is_file());
    assert!(summary.bundle_dir.join("saved_model.pb").is_file());
    assert!(summary.bundle_dir.join("variables").join("variables.safetensors").is_file());
}

#[test]
fn test_public_names_are_identical_across_runs() {
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();

    let first = GraphExporter::new(first_dir.path()).export(&prepared_model()).unwrap();
    let second = GraphExporter::new(second_dir.path()).export(&prepared_model()).unwrap();

    assert_eq!(first.public_names, second.public_names);
    assert_eq!(
        first.public_names,
        contract::public_names(&first.output_names, &first.metrics_names)
    );
    assert!(first.public_names.contains("out_denoise_tensor"));
    assert!(first.public_names.contains("out_segment_tensor"));
}

#[test]
fn test_every_public_name_resolves_in_training_graph() {
    let dir = tempfile::tempdir().unwrap();
    let model = prepared_model();
    let summary = GraphExporter::new(dir.path()).export(&model).unwrap();

    let graph = read_graph_def(&summary.graph_path).unwrap();
    let ports =
        PublicPorts::resolve(&graph, &summary.output_names, &summary.metrics_names).unwrap();
    assert_eq!(ports.losses.len(), summary.metrics_names.len());
    assert_eq!(ports.outputs.len(), summary.output_names.len());
    for name in &summary.public_names {
        assert!(graph.node_by_name(name).is_some(), "{} missing", name);
    }

    // переменные в файле графа не инициализированы, но инициализатор есть
    assert!(graph.get_operation_by_name(contract::INIT_OP_NAME).is_ok());
    assert!(graph.get_operation_by_name("save/restore_all").is_ok());
}

#[test]
fn test_loss_aliases_follow_index_law() {
    let dir = tempfile::tempdir().unwrap();
    let model = prepared_model();
    let summary = GraphExporter::new(dir.path()).export(&model).unwrap();
    let graph = read_graph_def(&summary.graph_path).unwrap();

    let names = model.metrics_names();
    let tensors = model.metrics_tensors();
    assert_eq!(names.len(), tensors.len() + 1);

    let total = model.total_loss().unwrap();
    assert_eq!(identity_source(&graph, &format!("{}_tensor", names[0])), total.node_id);
    for k in 1..names.len() {
        assert_eq!(
            identity_source(&graph, &format!("{}_tensor", names[k])),
            tensors[k - 1].node_id
        );
    }
}

#[test]
fn test_learning_rate_and_step_aliases() {
    let dir = tempfile::tempdir().unwrap();
    let model = prepared_model();
    let summary = GraphExporter::new(dir.path()).export(&model).unwrap();
    let graph = read_graph_def(&summary.graph_path).unwrap();

    let lr = model.learning_rate().unwrap();
    let read = graph.node_by_name("Adam/lr/read").unwrap();
    assert_eq!(read.node_type, NodeType::Read(lr.node_id));
    assert_eq!(identity_source(&graph, "read_learning_rate"), read.id);
    assert_eq!(identity_source(&graph, "write_learning_rate"), lr.node_id);

    let train = graph.node_by_name("train").unwrap();
    let train_step = graph.get_operation_by_name("training/group_deps").unwrap();
    assert_eq!(train.node_type, NodeType::Group(vec![train_step]));

    let validation = graph.node_by_name("validation").unwrap();
    let test_step = graph.get_operation_by_name("group_deps").unwrap();
    assert_eq!(validation.node_type, NodeType::Group(vec![test_step]));

    // segmented/denoised читают псевдонимы выходов, а не сами выходы
    let segmented_source = identity_source(&graph, SEGMENTED);
    assert_eq!(graph.get_node(segmented_source).unwrap().name, "out_segment_tensor");
    let denoised_source = identity_source(&graph, DENOISED);
    assert_eq!(graph.get_node(denoised_source).unwrap().name, "out_denoise_tensor");
}

#[test]
fn test_unprepared_model_fails_before_any_alias() {
    let dir = tempfile::tempdir().unwrap();
    let model = built_model();
    let before = graph_len(&model);

    let err = GraphExporter::new(dir.path()).export(&model).unwrap_err();
    assert!(matches!(err, ExportError::MissingPort(_)));
    assert_eq!(graph_len(&model), before);
    assert!(!dir.path().join(GRAPH_FILENAME).exists());

    let ctx = model.context().borrow();
    assert!(ctx.graph().get_operation_by_name("training/group_deps").is_err());
    assert!(ctx.graph().get_operation_by_name("group_deps").is_err());
    assert!(ctx.graph().get_tensor_by_name("Adam/lr:0").is_err());
}

#[test]
fn test_skipped_functions_fail_with_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = built_model();
    model.prepare_for_training();
    let before = graph_len(&model);

    let err = GraphExporter::new(dir.path()).export(&model).unwrap_err();
    assert!(matches!(
        err,
        ExportError::Graph(AsgError::OperationNotFound(ref name)) if name == "training/group_deps"
    ));
    assert_eq!(graph_len(&model), before);
    assert!(!dir.path().join(GRAPH_FILENAME).exists());
}

#[test]
fn test_existing_bundle_directory_is_not_modified() {
    let dir = tempfile::tempdir().unwrap();
    let bundle_dir = dir.path().join(PREDICTION_DIRECTORY);
    fs::create_dir(&bundle_dir).unwrap();
    fs::write(bundle_dir.join("saved_model.pb"), b"previous run").unwrap();

    let err = GraphExporter::new(dir.path()).export(&prepared_model()).unwrap_err();
    assert!(matches!(
        err,
        ExportError::Serialization(SerializationError::BundleExists(ref p)) if p == &bundle_dir
    ));
    assert_eq!(fs::read(bundle_dir.join("saved_model.pb")).unwrap(), b"previous run");
    assert_eq!(fs::read_dir(&bundle_dir).unwrap().count(), 1);
}

#[test]
fn test_second_export_of_same_model_fails_loudly() {
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let model = prepared_model();
    GraphExporter::new(first_dir.path()).export(&model).unwrap();

    let err = GraphExporter::new(second_dir.path()).export(&model).unwrap_err();
    assert!(matches!(err, ExportError::Graph(AsgError::NameAlreadyExists(_))));
}

#[test]
fn test_signature_roles_resolve_in_bundle_graph() {
    let dir = tempfile::tempdir().unwrap();
    let model = prepared_model();
    let summary = GraphExporter::new(dir.path()).with_seed(7).export(&model).unwrap();

    let bundle = load_bundle(&summary.bundle_dir).unwrap();
    assert_eq!(bundle.meta_graph.tags, vec![SERVING_TAG.to_string()]);
    assert_eq!(bundle.meta_graph.signature_def_map.len(), 1);
    let signature = &bundle.meta_graph.signature_def_map[DEFAULT_SERVING_SIGNATURE_KEY];
    assert_eq!(signature.method_name, PREDICT_METHOD_NAME);

    let mut roles: Vec<&str> = signature.roles().collect();
    roles.sort_unstable();
    assert_eq!(roles, vec![DENOISED, INPUT, SEGMENTED]);

    let graph = bundle.meta_graph.graph_def.clone().into_graph().unwrap();
    for info in signature.inputs.values().chain(signature.outputs.values()) {
        assert!(graph.get_tensor_by_name(&info.name).is_ok(), "{} missing", info.name);
    }
    assert_eq!(signature.inputs[INPUT].name, "input:0");
    assert_eq!(signature.outputs[SEGMENTED].dims.last(), Some(&Some(3)));
    assert_eq!(signature.outputs[DENOISED].dims.last(), Some(&Some(1)));
}

#[test]
fn test_bundle_holds_initialized_global_variables() {
    let dir = tempfile::tempdir().unwrap();
    let model = prepared_model();
    let summary = GraphExporter::new(dir.path()).with_seed(7).export(&model).unwrap();
    let bundle = load_bundle(Path::new(&summary.bundle_dir)).unwrap();

    let global = model
        .context()
        .borrow()
        .graph()
        .variables(VariableCollection::Global)
        .len();
    assert_eq!(bundle.variables.len(), global);
    assert_eq!(summary.variables, global);
    assert_eq!(bundle.variables["Adam/iterations"], Value::ScalarI64(0));
    match &bundle.variables["Adam/lr"] {
        Value::Tensor(lr) => assert!(lr.iter().all(|&x| (x - 4e-4).abs() < 1e-9)),
        other => panic!("unexpected learning rate value {:?}", other),
    }
    // локальные накопители метрик в пакет не попадают
    assert!(!bundle.variables.contains_key("metrics/loss/total"));
    assert!(bundle.meta_graph.saver_def.is_some());
}

/// Model whose first input is not the public `input` placeholder.
struct ShiftedInput(DenoiSeg);

impl ModelHandle for ShiftedInput {
    fn context(&self) -> &Rc<RefCell<GraphContext>> {
        self.0.context()
    }
    fn inputs(&self) -> Vec<Tensor> {
        self.0.targets()
    }
    fn outputs(&self) -> Vec<Tensor> {
        self.0.outputs()
    }
    fn output_names(&self) -> Vec<String> {
        self.0.output_names()
    }
    fn metrics_names(&self) -> Vec<String> {
        self.0.metrics_names()
    }
    fn total_loss(&self) -> Option<Tensor> {
        self.0.total_loss()
    }
    fn metrics_tensors(&self) -> Vec<Tensor> {
        self.0.metrics_tensors()
    }
    fn targets(&self) -> Vec<Tensor> {
        self.0.targets()
    }
    fn learning_rate(&self) -> Option<Tensor> {
        self.0.learning_rate()
    }
}

#[test]
fn test_model_without_input_port_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let model = ShiftedInput(prepared_model());
    let before = model.context().borrow().graph().len();

    let err = GraphExporter::new(dir.path()).export(&model).unwrap_err();
    assert!(matches!(err, ExportError::MissingPort("input")));
    assert_eq!(model.context().borrow().graph().len(), before);
}

/// The command-line build path on a tiny configuration: batch norm on,
/// config written to the model directory, seeded export.
#[test]
fn test_command_line_build_path() {
    let basedir = tempfile::tempdir().unwrap();
    let resources = tempfile::tempdir().unwrap();
    let samples = 8;
    let batch_size = 4;
    let config = DenoiSegConfig::from_data(&[samples, 16, 16, 1])
        .with_unet_kern_size(3)
        .with_relative_weights(vec![1.0, 1.0, 5.0])
        .with_train_batch_size(batch_size)
        .with_train_epochs(2)
        .with_train_steps_per_epoch(steps_per_epoch(samples, batch_size))
        .with_unet_n_first(4)
        .with_unet_n_depth(2)
        .with_denoiseg_alpha(0.5)
        .with_batch_norm(true);

    let context = GraphContext::shared();
    let mut model =
        DenoiSeg::new(config.clone(), "denoiseg_model", Some(basedir.path()), &context).unwrap();
    model.prepare_for_training();
    model.make_train_function().unwrap();
    model.make_test_function().unwrap();
    model.make_predict_function();

    let summary = GraphExporter::new(resources.path().join("resources"))
        .with_seed(42)
        .export(&model)
        .unwrap();
    assert!(summary.graph_path.is_file());
    assert!(summary.bundle_dir.is_dir());

    let saved =
        DenoiSegConfig::load_json(basedir.path().join("denoiseg_model").join("config.json")).unwrap();
    assert_eq!(saved, config);

    let graph = read_graph_def(&summary.graph_path).unwrap();
    assert!(graph
        .nodes()
        .iter()
        .any(|node| node.name.contains("batch_normalization") && node.name.ends_with("/AssignMovingAvg")));
}
