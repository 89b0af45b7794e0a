//! Public aliases over internal graph names.
//!
//! A rename never touches the source node. It adds a new node under the public
//! name: an `Identity` for tensors, a `Group` for operations. An alias whose
//! name is already taken is an error, so applying a table twice fails instead
//! of shadowing the first run.

use super::contract::{
    tensor_alias, DENOISED, DENOISE_OUTPUT, READ_LEARNING_RATE, SEGMENTED, SEGMENT_OUTPUT,
    TEST_OP_NAME, TRAIN, TRAIN_OP_NAME, VALIDATION, WRITE_LEARNING_RATE,
};
use super::ports::PortCollections;
use super::{ExportError, ExportResult};
use crate::asg::{split_tensor_name, Asg, AsgError, AsgResult, NodeId};
use crate::tensor::{GraphContext, Operation, Tensor};
use log::info;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RenameKind {
    Tensor,
    Operation,
}

/// One `source -> target` alias. Tensor sources are `<op>:0`, targets are bare node names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub source: String,
    pub target: String,
    pub kind: RenameKind,
}

impl Rename {
    pub fn tensor(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: RenameKind::Tensor,
        }
    }

    pub fn operation(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: RenameKind::Operation,
        }
    }
}

/// Adds `Identity` node `new_name` over tensor `existing`.
pub fn alias_tensor(
    context: &Rc<RefCell<GraphContext>>,
    existing: &str,
    new_name: &str,
) -> AsgResult<Tensor> {
    Tensor::lookup(context, existing)?.identity_named(new_name)
}

/// Adds `Group` node `new_name` depending on operation `existing`.
pub fn alias_operation(
    context: &Rc<RefCell<GraphContext>>,
    existing: &str,
    new_name: &str,
) -> AsgResult<Operation> {
    let op = Operation::lookup(context, existing)?;
    Operation::group_named(context, new_name, vec![op.node_id])
}

/// Loss aliases: slot 0 is the total loss, slot `i > 0` is metric tensor `i - 1`.
///
/// The metric-name list includes the total loss and the tensor list does not,
/// so the lists must differ in length by exactly one.
pub fn loss_renames(
    metrics_names: &[String],
    total_loss: &str,
    metrics_tensors: &[String],
) -> ExportResult<Vec<Rename>> {
    if metrics_names.len() != metrics_tensors.len() + 1 {
        return Err(ExportError::MetricsMismatch {
            names: metrics_names.len(),
            tensors: metrics_tensors.len(),
        });
    }
    let sources = std::iter::once(total_loss).chain(metrics_tensors.iter().map(String::as_str));
    Ok(metrics_names
        .iter()
        .zip(sources)
        .map(|(name, source)| Rename::tensor(source, tensor_alias(name)))
        .collect())
}

/// Read and write ports of a learning-rate variable from its tensor name.
///
/// `Adam/lr:0` gives `("Adam/lr/read:0", "Adam/lr:0")`: the read view lives in
/// the variable's own name scope, the write handle is the variable itself.
pub fn learning_rate_port_names(variable_tensor_name: &str) -> (String, String) {
    let variable = variable_tensor_name
        .strip_suffix(":0")
        .unwrap_or(variable_tensor_name);
    (format!("{}/read:0", variable), format!("{}:0", variable))
}

/// Ordered rename table producing the public contract.
#[derive(Debug, Clone, PartialEq)]
pub struct RenameTable {
    renames: Vec<Rename>,
}

impl RenameTable {
    pub fn new(renames: Vec<Rename>) -> Self {
        Self { renames }
    }

    /// Builds the table in its fixed order. Later entries read aliases made by earlier ones.
    pub fn from_ports(ports: &PortCollections) -> ExportResult<Self> {
        let mut renames = loss_renames(&ports.metrics_names, &ports.total_loss, &ports.metrics_tensors)?;

        for (name, tensor) in &ports.outputs {
            renames.push(Rename::tensor(tensor.as_str(), tensor_alias(name)));
        }

        let (read, write) = learning_rate_port_names(&ports.learning_rate);
        renames.push(Rename::tensor(read, READ_LEARNING_RATE));
        renames.push(Rename::tensor(write, WRITE_LEARNING_RATE));

        renames.push(Rename::operation(TRAIN_OP_NAME, TRAIN));
        renames.push(Rename::operation(TEST_OP_NAME, VALIDATION));

        renames.push(Rename::tensor(format!("{}:0", tensor_alias(SEGMENT_OUTPUT)), SEGMENTED));
        renames.push(Rename::tensor(format!("{}:0", tensor_alias(DENOISE_OUTPUT)), DENOISED));

        Ok(Self { renames })
    }

    pub fn renames(&self) -> &[Rename] {
        &self.renames
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.renames.iter().map(|r| r.target.as_str())
    }

    /// Checks the whole table against `graph` without changing it.
    ///
    /// Every source must exist in the graph or be made by an earlier entry;
    /// every target must be free and appear once.
    pub fn check(&self, graph: &Asg) -> ExportResult<()> {
        let mut made: HashSet<(&str, RenameKind)> = HashSet::new();
        for rename in &self.renames {
            match rename.kind {
                RenameKind::Tensor => {
                    let (op, _) = split_tensor_name(&rename.source)?;
                    let earlier = rename.source.ends_with(":0") && made.contains(&(op, RenameKind::Tensor));
                    if !earlier {
                        graph.get_tensor_by_name(&rename.source)?;
                    }
                }
                RenameKind::Operation => {
                    if !made.contains(&(rename.source.as_str(), RenameKind::Operation))
                        && !made.contains(&(rename.source.as_str(), RenameKind::Tensor))
                    {
                        graph.get_operation_by_name(&rename.source)?;
                    }
                }
            }

            let target = rename.target.as_str();
            let taken = graph.node_by_name(target).is_some()
                || made.contains(&(target, RenameKind::Tensor))
                || made.contains(&(target, RenameKind::Operation));
            if taken {
                return Err(AsgError::NameAlreadyExists(rename.target.clone()).into());
            }
            made.insert((target, rename.kind));
        }
        Ok(())
    }

    /// Checks, then creates every alias in order. Returns the alias node ids.
    ///
    /// A failing check leaves the graph without any of the aliases.
    pub fn apply(&self, context: &Rc<RefCell<GraphContext>>) -> ExportResult<Vec<NodeId>> {
        self.check(context.borrow().graph())?;
        info!("public names:");
        let mut ids = Vec::with_capacity(self.renames.len());
        for rename in &self.renames {
            let id = match rename.kind {
                RenameKind::Tensor => alias_tensor(context, &rename.source, &rename.target)?.node_id,
                RenameKind::Operation => {
                    alias_operation(context, &rename.source, &rename.target)?.node_id
                }
            };
            info!("  {} ({})", rename.target, rename.source);
            ids.push(id);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::{DType, Initializer};
    use crate::optimizers::{Adam, Optimizer};
    use crate::tensor::Variable;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_loss_index_law() {
        let renames = loss_renames(
            &names(&["loss", "denoiseg", "seg_loss", "denoise_loss"]),
            "loss/mul:0",
            &names(&["metrics/denoiseg/Mean:0", "metrics/seg_loss/Mean:0", "metrics/denoise_loss/Mean:0"]),
        )
        .unwrap();
        assert_eq!(renames.len(), 4);
        assert_eq!(renames[0], Rename::tensor("loss/mul:0", "loss_tensor"));
        assert_eq!(renames[1], Rename::tensor("metrics/denoiseg/Mean:0", "denoiseg_tensor"));
        assert_eq!(renames[3], Rename::tensor("metrics/denoise_loss/Mean:0", "denoise_loss_tensor"));
    }

    #[test]
    fn test_loss_length_mismatch_fails() {
        let err = loss_renames(&names(&["loss", "a"]), "loss:0", &names(&["a:0", "b:0"])).unwrap_err();
        assert!(matches!(err, ExportError::MetricsMismatch { names: 2, tensors: 2 }));
    }

    #[test]
    fn test_learning_rate_ports_match_adam_naming() {
        let ctx = GraphContext::shared();
        let adam = Adam::new(&ctx, 4e-4);
        let lr = adam.learning_rate();
        let (read, write) = learning_rate_port_names(&lr.var.name());
        assert_eq!(read, lr.read.name());
        assert_eq!(write, lr.var.name());
        assert_eq!((read.as_str(), write.as_str()), ("Adam/lr/read:0", "Adam/lr:0"));
        // one suffix only
        assert_eq!(learning_rate_port_names("lr:0:0").1, "lr:0:0");
    }

    #[test]
    fn test_alias_keeps_source_reachable() {
        let ctx = GraphContext::shared();
        let x = Tensor::placeholder(&ctx, "x", vec![Some(1)], DType::F32);
        let alias = alias_tensor(&ctx, "x:0", "public").unwrap();
        assert_eq!(alias.name(), "public:0");
        assert!(Tensor::lookup(&ctx, "x:0").is_ok());
        assert_eq!(x.node_id, Tensor::lookup(&ctx, "x:0").unwrap().node_id);
        assert!(matches!(alias_tensor(&ctx, "x:1", "other"), Err(AsgError::TensorNotFound(_))));
        assert!(matches!(
            alias_operation(&ctx, "step", "train"),
            Err(AsgError::OperationNotFound(_))
        ));
    }

    #[test]
    fn test_failed_check_creates_no_alias() {
        let ctx = GraphContext::shared();
        let w = Variable::weight(&ctx, "w", &[1], Initializer::Zeros);
        let table = RenameTable::new(vec![
            Rename::tensor(w.var.name(), "first"),
            Rename::tensor("first:0", "second"),
            Rename::operation("missing_step", "train"),
        ]);
        let before = ctx.borrow().graph().len();
        let err = table.apply(&ctx).unwrap_err();
        assert!(matches!(err, ExportError::Graph(AsgError::OperationNotFound(_))));
        assert_eq!(ctx.borrow().graph().len(), before);
    }

    #[test]
    fn test_applying_twice_fails_loudly() {
        let ctx = GraphContext::shared();
        Tensor::placeholder(&ctx, "x", vec![], DType::F32);
        let table = RenameTable::new(vec![Rename::tensor("x:0", "public"), Rename::tensor("public:0", "public_2")]);
        assert_eq!(table.apply(&ctx).unwrap().len(), 2);
        let err = table.apply(&ctx).unwrap_err();
        assert!(matches!(err, ExportError::Graph(AsgError::NameAlreadyExists(name)) if name == "public"));

        let duplicate = RenameTable::new(vec![Rename::tensor("x:0", "a"), Rename::tensor("x:0", "a")]);
        assert!(duplicate.check(ctx.borrow().graph()).is_err());
    }
}
