//! Graph export: public aliases, training graph file and prediction bundle.
//!
//! The exporter reads a prepared model through [`ModelHandle`], adds the public
//! aliases of [`contract`], then writes two artifacts into the resources
//! directory:
//!
//! 1. `denoiseg_graph_2d.pb`: the whole training graph, variables uninitialized;
//! 2. `denoiseg_prediction_2d/`: a serving bundle with initialized variables and
//!    the `input` / `denoised` / `segmented` signature.
//!
//! The graph file is written while no session exists. The bundle is written from
//! inside a session that borrows the finished graph, so no alias can be added
//! after variables were initialized.

pub mod contract;
pub mod ports;
pub mod rename;

pub use contract::PublicPorts;
pub use ports::PortCollections;
pub use rename::{learning_rate_port_names, Rename, RenameKind, RenameTable};

use crate::asg::{Asg, AsgError, VariableCollection};
use crate::model::{ModelError, ModelHandle};
use crate::runtime::{RuntimeError, Session};
use crate::serialization::signature::{DEFAULT_SERVING_SIGNATURE_KEY, SERVING_TAG};
use crate::serialization::{
    build_tensor_info, save_bundle, write_graph_def, GraphDef, MetaGraph, Saver, SaverDef,
    SerializationError, SignatureDef,
};
use crate::tensor::{GraphContext, Operation};
use contract::{DENOISED, GRAPH_FILENAME, INIT_OP_NAME, INPUT, PREDICTION_DIRECTORY, SEGMENTED};
use log::info;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("model port '{0}' not found; prepare the model and build its train/test/predict functions first")]
    MissingPort(&'static str),

    #[error("{names} metric names but {tensors} metric tensors; expected exactly one more name than tensors")]
    MetricsMismatch { names: usize, tensors: usize },

    #[error(transparent)]
    Graph(#[from] AsgError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExportResult<T> = std::result::Result<T, ExportError>;

/// What an export produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub public_names: BTreeSet<String>,
    pub output_names: Vec<String>,
    pub metrics_names: Vec<String>,
    pub graph_path: PathBuf,
    pub bundle_dir: PathBuf,
    pub variables: usize,
}

pub struct GraphExporter {
    resources: PathBuf,
    seed: Option<u64>,
}

impl GraphExporter {
    pub fn new(resources: impl Into<PathBuf>) -> Self {
        Self {
            resources: resources.into(),
            seed: None,
        }
    }

    /// Fixes the seed of the variable initializers in the bundle.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn resources(&self) -> &Path {
        &self.resources
    }

    pub fn graph_path(&self) -> PathBuf {
        self.resources.join(GRAPH_FILENAME)
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.resources.join(PREDICTION_DIRECTORY)
    }

    /// Runs the whole export on a model whose train, test and predict functions exist.
    pub fn export<M: ModelHandle + ?Sized>(&self, model: &M) -> ExportResult<ExportSummary> {
        let ports = PortCollections::resolve(model)?;
        let table = RenameTable::from_ports(&ports)?;
        let context = model.context();
        table.apply(context)?;

        add_init_op(context)?;
        let saver_def = Saver::build(context)?;

        let ctx = context.borrow();
        let graph = ctx.graph();
        fs::create_dir_all(&self.resources)?;
        write_graph_def(self.graph_path(), graph)?;
        info!("training graph written to {}", self.graph_path().display());

        let variables = self.write_bundle(graph, saver_def)?;

        let mut public_names: BTreeSet<String> = table.targets().map(str::to_string).collect();
        public_names.insert(INPUT.to_string());
        Ok(ExportSummary {
            public_names,
            output_names: ports.outputs.into_iter().map(|(name, _)| name).collect(),
            metrics_names: ports.metrics_names,
            graph_path: self.graph_path(),
            bundle_dir: self.bundle_dir(),
            variables,
        })
    }

    fn write_bundle(&self, graph: &Asg, saver_def: SaverDef) -> ExportResult<usize> {
        let mut session = match self.seed {
            Some(seed) => Session::seeded(graph, seed),
            None => Session::new(graph),
        };
        session.global_variables_initializer()?;
        session.local_variables_initializer()?;
        session.run(INIT_OP_NAME)?;

        let tensor_info = |role: &str| build_tensor_info(graph, &format!("{}:0", role));
        let signature = SignatureDef::predict(
            vec![(INPUT.to_string(), tensor_info(INPUT)?)],
            vec![
                (DENOISED.to_string(), tensor_info(DENOISED)?),
                (SEGMENTED.to_string(), tensor_info(SEGMENTED)?),
            ],
        );
        let variables = session.variable_values(VariableCollection::Global)?;

        let meta_graph = MetaGraph {
            tags: vec![SERVING_TAG.to_string()],
            graph_def: GraphDef::from_graph(graph),
            signature_def_map: BTreeMap::from([(
                DEFAULT_SERVING_SIGNATURE_KEY.to_string(),
                signature,
            )]),
            saver_def: Some(saver_def),
        };
        save_bundle(self.bundle_dir(), &meta_graph, &variables)?;
        Ok(variables.len())
    }
}

/// Adds `init`: one group over the initializers of all global variables.
pub fn add_init_op(context: &Rc<RefCell<GraphContext>>) -> ExportResult<Operation> {
    let initializers = {
        let ctx = context.borrow();
        let graph = ctx.graph();
        graph
            .variables(VariableCollection::Global)
            .into_iter()
            .filter_map(|var| graph.initializer_of(var))
            .collect::<Vec<_>>()
    };
    Ok(Operation::group_named(context, INIT_OP_NAME, initializers)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::{DType, Initializer};
    use crate::tensor::Variable;

    #[test]
    fn test_init_op_covers_global_variables_only() {
        let ctx = GraphContext::shared();
        let w = Variable::weight(&ctx, "w", &[2], Initializer::Ones);
        Variable::new(&ctx, "count", &[], DType::F32, Initializer::Zeros, VariableCollection::Local, false);
        let init = add_init_op(&ctx).unwrap();
        assert_eq!(init.name(), INIT_OP_NAME);

        let graph = ctx.borrow();
        let node = graph.graph().get_node(init.node_id).unwrap();
        assert_eq!(node.node_type, crate::asg::NodeType::Group(vec![w.initializer.node_id]));
        drop(graph);
        assert!(add_init_op(&ctx).is_err());
    }

    #[test]
    fn test_paths() {
        let exporter = GraphExporter::new("../resources").with_seed(3);
        assert_eq!(exporter.graph_path(), Path::new("../resources/denoiseg_graph_2d.pb"));
        assert_eq!(exporter.bundle_dir(), Path::new("../resources/denoiseg_prediction_2d"));
    }
}
