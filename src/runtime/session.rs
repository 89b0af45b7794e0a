//! Сессия: ограниченная областью видимости среда, владеющая значениями переменных.
//!
//! Сессия заимствует граф неизменяемо, поэтому пока она жива, в граф нельзя
//! добавить ни одного узла. Значения освобождаются в `Drop`.

use super::{RuntimeError, RuntimeResult};
use crate::asg::{Asg, DType, Initializer, NodeId, NodeType, Value, VariableCollection};
use log::debug;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};

pub struct Session<'g> {
    graph: &'g Asg,
    values: HashMap<NodeId, Value>,
    rng: StdRng,
}

impl<'g> Session<'g> {
    /// Открывает сессию со случайным зерном.
    pub fn new(graph: &'g Asg) -> Self {
        Self::with_rng(graph, StdRng::from_entropy())
    }

    /// Открывает сессию с фиксированным зерном для воспроизводимой инициализации.
    pub fn seeded(graph: &'g Asg, seed: u64) -> Self {
        Self::with_rng(graph, StdRng::seed_from_u64(seed))
    }

    fn with_rng(graph: &'g Asg, rng: StdRng) -> Self {
        debug!("сессия открыта: {} узлов в графе", graph.len());
        Self {
            graph,
            values: HashMap::new(),
            rng,
        }
    }

    pub fn graph(&self) -> &'g Asg {
        self.graph
    }

    pub fn global_variables_initializer(&mut self) -> RuntimeResult<()> {
        self.initialize_collection(VariableCollection::Global)
    }

    pub fn local_variables_initializer(&mut self) -> RuntimeResult<()> {
        self.initialize_collection(VariableCollection::Local)
    }

    fn initialize_collection(&mut self, collection: VariableCollection) -> RuntimeResult<()> {
        let variables = self.graph.variables(collection);
        for &var in &variables {
            self.initialize(var)?;
        }
        debug!("инициализировано переменных ({:?}): {}", collection, variables.len());
        Ok(())
    }

    /// Выполняет операцию `op_name` вместе со всеми её зависимостями.
    ///
    /// Сессия умеет выполнять только инициализацию переменных; любой другой
    /// вычислительный узел в замыкании зависимостей — `UnimplementedOperation`.
    pub fn run(&mut self, op_name: &str) -> RuntimeResult<()> {
        let graph = self.graph;
        let target = graph.get_operation_by_name(op_name)?;
        for id in graph.execution_order(target)? {
            let node = graph.get_node(id)?;
            match &node.node_type {
                NodeType::Initialize(var) => self.initialize(*var)?,
                NodeType::Group(_)
                | NodeType::Variable { .. }
                | NodeType::Const(_)
                | NodeType::Read(_)
                | NodeType::Identity(_) => {}
                NodeType::Placeholder => return Err(RuntimeError::MissingFeed(node.name.clone())),
                _ => return Err(RuntimeError::UnimplementedOperation(node.name.clone())),
            }
        }
        Ok(())
    }

    fn initialize(&mut self, var: NodeId) -> RuntimeResult<()> {
        let graph = self.graph;
        let node = graph.get_node(var)?;
        let NodeType::Variable { initializer, .. } = &node.node_type else {
            return Err(RuntimeError::UnimplementedOperation(node.name.clone()));
        };
        let initializer = *initializer;
        let shape = node
            .dims
            .as_ref()
            .map(|dims| dims.iter().copied().collect::<Option<Vec<usize>>>())
            .unwrap_or_default()
            .ok_or_else(|| {
                RuntimeError::ShapeError(format!("у переменной '{}' динамическая форма", node.name))
            })?;

        let value = match node.dtype {
            DType::F32 => Value::Tensor(self.sample(initializer, &shape)),
            DType::I64 if shape.is_empty() => Value::ScalarI64(match initializer {
                Initializer::Ones => 1,
                Initializer::Constant(c) => c as i64,
                _ => 0,
            }),
            other => {
                return Err(RuntimeError::ShapeError(format!(
                    "переменная '{}' типа {:?} с формой {:?} не поддерживается",
                    node.name, other, shape
                )))
            }
        };
        self.values.insert(var, value);
        Ok(())
    }

    fn sample(&mut self, initializer: Initializer, shape: &[usize]) -> ArrayD<f32> {
        let dim = IxDyn(shape);
        match initializer {
            Initializer::Zeros => ArrayD::zeros(dim),
            Initializer::Ones => ArrayD::ones(dim),
            Initializer::Constant(c) => ArrayD::from_elem(dim, c),
            Initializer::GlorotUniform => {
                let limit = glorot_limit(shape);
                ArrayD::random_using(dim, Uniform::new_inclusive(-limit, limit), &mut self.rng)
            }
        }
    }

    pub fn value(&self, var: NodeId) -> Option<&Value> {
        self.values.get(&var)
    }

    /// Значения всех переменных коллекции по их именам.
    pub fn variable_values(
        &self,
        collection: VariableCollection,
    ) -> RuntimeResult<BTreeMap<String, Value>> {
        self.graph
            .variables(collection)
            .into_iter()
            .map(|id| {
                let name = self.graph.get_node(id)?.name.clone();
                match self.values.get(&id) {
                    Some(value) => Ok((name, value.clone())),
                    None => Err(RuntimeError::Uninitialized(name)),
                }
            })
            .collect()
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        debug!("сессия закрыта: освобождено {} значений", self.values.len());
    }
}

/// Граница Glorot uniform: `sqrt(6 / (fan_in + fan_out))` для ядра `[..., in, out]`.
fn glorot_limit(shape: &[usize]) -> f32 {
    let (fan_in, fan_out) = match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [.., inp, out] => {
            let receptive: usize = shape[..shape.len() - 2].iter().product();
            (receptive * inp, receptive * out)
        }
    };
    (6.0 / (fan_in + fan_out).max(1) as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Operation, Tensor, Variable};

    fn graph_with_variables() -> (Asg, NodeId, NodeId) {
        let ctx = GraphContext::shared();
        let kernel = Variable::weight(&ctx, "kernel", &[3, 3, 1, 4], Initializer::GlorotUniform);
        let lr = Variable::state(&ctx, "lr", &[], DType::F32, Initializer::Constant(4e-4));
        let it = Variable::state(&ctx, "iterations", &[], DType::I64, Initializer::Zeros);
        Operation::group(
            &ctx,
            "init",
            vec![kernel.initializer.node_id, lr.initializer.node_id, it.initializer.node_id],
        );
        let graph = ctx.borrow().graph().clone();
        (graph, kernel.var.node_id, lr.var.node_id)
    }

    #[test]
    fn test_uninitialized_values_are_an_error() {
        let (graph, _, _) = graph_with_variables();
        let session = Session::seeded(&graph, 0);
        assert!(matches!(
            session.variable_values(VariableCollection::Global),
            Err(RuntimeError::Uninitialized(_))
        ));
    }

    #[test]
    fn test_init_op_initializes_everything() {
        let (graph, kernel, lr) = graph_with_variables();
        let mut session = Session::seeded(&graph, 0);
        session.run("init").unwrap();
        let values = session.variable_values(VariableCollection::Global).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values["iterations"], Value::ScalarI64(0));
        assert_eq!(session.value(lr), Some(&Value::Tensor(ArrayD::from_elem(IxDyn(&[]), 4e-4))));

        let limit = glorot_limit(&[3, 3, 1, 4]);
        match session.value(kernel) {
            Some(Value::Tensor(arr)) => {
                assert_eq!(arr.shape(), &[3, 3, 1, 4]);
                assert!(arr.iter().all(|x| x.abs() <= limit));
            }
            other => panic!("expected tensor, got {:?}", other),
        }
    }

    #[test]
    fn test_run_rejects_placeholders_and_compute() {
        let ctx = GraphContext::shared();
        let x = Tensor::placeholder(&ctx, "x", vec![Some(2)], DType::F32);
        let y = x.square();
        Operation::group(&ctx, "needs_feed", vec![x.node_id]);
        Operation::group(&ctx, "needs_compute", vec![y.node_id]);
        let graph = ctx.borrow().graph().clone();

        let mut session = Session::new(&graph);
        assert_eq!(session.run("needs_feed"), Err(RuntimeError::MissingFeed("x".to_string())));
        assert_eq!(
            session.run("needs_compute"),
            Err(RuntimeError::MissingFeed("x".to_string()))
        );
        assert!(matches!(
            session.run("missing"),
            Err(RuntimeError::Graph(crate::asg::AsgError::OperationNotFound(_)))
        ));
    }

    #[test]
    fn test_compute_nodes_are_not_executed() {
        let ctx = GraphContext::shared();
        let c = Tensor::constant(&ctx, "c", Value::ScalarF32(2.0));
        let y = c.square();
        Operation::group(&ctx, "compute", vec![y.node_id]);
        let graph = ctx.borrow().graph().clone();

        let mut session = Session::new(&graph);
        assert_eq!(
            session.run("compute"),
            Err(RuntimeError::UnimplementedOperation("Square".to_string()))
        );
    }
}
