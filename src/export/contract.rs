//! Public naming contract of the exported graphs.
//!
//! Everything a consumer (the Java trainer, a serving runtime) may look up by
//! name is listed here. Internal names produced while building the model are
//! not part of the contract and may change.

use crate::asg::{Asg, AsgResult, NodeId};
use std::collections::BTreeSet;

pub const INPUT: &str = "input";
pub const SEGMENTED: &str = "segmented";
pub const DENOISED: &str = "denoised";
pub const READ_LEARNING_RATE: &str = "read_learning_rate";
pub const WRITE_LEARNING_RATE: &str = "write_learning_rate";
pub const TRAIN: &str = "train";
pub const VALIDATION: &str = "validation";

/// Suffix of the per-metric loss aliases and of the model output aliases.
pub const TENSOR_SUFFIX: &str = "_tensor";

/// Internal name of the grouped training step.
pub const TRAIN_OP_NAME: &str = "training/group_deps";
/// Internal name of the grouped validation step.
pub const TEST_OP_NAME: &str = "group_deps";
/// Group of all global variable initializers.
pub const INIT_OP_NAME: &str = "init";

pub const DENOISE_OUTPUT: &str = "out_denoise";
pub const SEGMENT_OUTPUT: &str = "out_segment";

pub const GRAPH_FILENAME: &str = "denoiseg_graph_2d.pb";
pub const PREDICTION_DIRECTORY: &str = "denoiseg_prediction_2d";

/// `<name>_tensor`
pub fn tensor_alias(name: &str) -> String {
    format!("{}{}", name, TENSOR_SUFFIX)
}

/// Every public name for a model with the given outputs and metrics, sorted.
///
/// Output aliases (`out_denoise_tensor`, ...) are listed too: `segmented` and
/// `denoised` read them, so they are part of what a consumer may look up.
pub fn public_names(output_names: &[String], metrics_names: &[String]) -> BTreeSet<String> {
    let fixed = [
        INPUT,
        SEGMENTED,
        DENOISED,
        READ_LEARNING_RATE,
        WRITE_LEARNING_RATE,
        TRAIN,
        VALIDATION,
    ];
    fixed
        .iter()
        .map(|s| s.to_string())
        .chain(output_names.iter().map(|o| tensor_alias(o)))
        .chain(metrics_names.iter().map(|m| tensor_alias(m)))
        .collect()
}

/// Public ports resolved in a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicPorts {
    pub input: NodeId,
    pub segmented: NodeId,
    pub denoised: NodeId,
    /// `(output name, node)` of the output aliases, in output order.
    pub outputs: Vec<(String, NodeId)>,
    /// `(metric name, node)` in metrics order; the first one is the total loss.
    pub losses: Vec<(String, NodeId)>,
    pub read_learning_rate: NodeId,
    pub write_learning_rate: NodeId,
    pub train: NodeId,
    pub validation: NodeId,
}

impl PublicPorts {
    /// Resolves the whole contract; the first missing name is returned as an error.
    pub fn resolve(
        graph: &Asg,
        output_names: &[String],
        metrics_names: &[String],
    ) -> AsgResult<Self> {
        let tensor = |name: &str| graph.get_tensor_by_name(&format!("{}:0", name));
        let aliases = |names: &[String]| {
            names
                .iter()
                .map(|n| tensor(&tensor_alias(n)).map(|id| (n.clone(), id)))
                .collect::<AsgResult<Vec<_>>>()
        };
        let outputs = aliases(output_names)?;
        let losses = aliases(metrics_names)?;

        Ok(Self {
            input: tensor(INPUT)?,
            segmented: tensor(SEGMENTED)?,
            denoised: tensor(DENOISED)?,
            outputs,
            losses,
            read_learning_rate: tensor(READ_LEARNING_RATE)?,
            write_learning_rate: tensor(WRITE_LEARNING_RATE)?,
            train: graph.get_operation_by_name(TRAIN)?,
            validation: graph.get_operation_by_name(VALIDATION)?,
        })
    }
}
