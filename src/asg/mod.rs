//! ASG: Абстрактный семантический граф
//!
//! Каждый узел графа имеет уникальное строковое имя (области имён разделяются `/`).
//! Узел, производящий данные, имеет ровно один выходной тензор `<имя>:0`.
//! Управляющие узлы (`Group`, `SaveV2`, `RestoreV2`) тензоров не производят.
//!
//! Узлы никогда не переименовываются и не удаляются: публичные имена
//! создаются как новые узлы-псевдонимы поверх существующих.

use ndarray::ArrayD;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed, Topo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Идентификатор узла (совпадает с его позицией в `Asg::nodes`)
pub type NodeId = usize;
/// Размерности тензора; `None` означает динамическую ось
pub type Dims = Vec<Option<usize>>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Узел с ID {0} не найден")]
    NodeNotFound(NodeId),
    #[error("Тензор '{0}' не найден в графе")]
    TensorNotFound(String),
    #[error("Операция '{0}' не найдена в графе")]
    OperationNotFound(String),
    #[error("Имя '{0}' уже занято в графе")]
    NameAlreadyExists(String),
    #[error("Неверное имя тензора '{0}': ожидалось '<операция>:<индекс>'")]
    InvalidTensorName(String),
    #[error("Узел {id} ссылается на несуществующий вход {input}")]
    DanglingInput { id: NodeId, input: NodeId },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
    I64,
    Bool,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
    ScalarI64(i64),
    ScalarBool(bool),
    Text(String),
}

/// Способ получения начального значения переменной.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Zeros,
    Ones,
    Constant(f32),
    /// Glorot/Xavier uniform; fan-in/fan-out считаются по форме ядра `[kh, kw, in, out]`.
    GlorotUniform,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableCollection {
    Global,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Данные
    Placeholder,
    Const(Value),
    Variable {
        initializer: Initializer,
        collection: VariableCollection,
        trainable: bool,
    },
    /// Текущее значение переменной (`<var>/read`)
    Read(NodeId),
    /// Присваивание начального значения (`<var>/Assign`)
    Initialize(NodeId),
    Identity(NodeId),

    // Слои (NHWC)
    Conv2d { input: NodeId, kernel: NodeId, bias: Option<NodeId> },
    BatchNorm {
        input: NodeId,
        gamma: NodeId,
        beta: NodeId,
        moving_mean: NodeId,
        moving_variance: NodeId,
        batch_mean: NodeId,
        batch_variance: NodeId,
        learning_phase: NodeId,
        epsilon: f32,
    },
    MaxPool2d { input: NodeId, pool: (usize, usize) },
    UpSampling2d { input: NodeId, size: (usize, usize) },
    Concat { inputs: Vec<NodeId> },
    SliceChannels { input: NodeId, start: usize, end: usize },

    // Поэлементные
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    Square(NodeId),
    Log(NodeId),
    ReLU(NodeId),
    Softmax(NodeId),

    // Редукции
    Mean(NodeId),
    SumChannels(NodeId),
    /// Среднее по осям N, H, W (по каналам)
    BatchMean(NodeId),
    BatchVariance(NodeId),

    // Обучение
    Gradient { y: NodeId, x: NodeId },
    ApplyAdam {
        variable: NodeId,
        m: NodeId,
        v: NodeId,
        gradient: NodeId,
        learning_rate: NodeId,
        beta_1: NodeId,
        beta_2: NodeId,
        iterations: NodeId,
        epsilon: f32,
    },
    AssignAdd { variable: NodeId, value: NodeId },
    AssignMovingAverage { variable: NodeId, value: NodeId, momentum: f32 },

    // Сохранение
    SaveV2 { filename: NodeId, variables: Vec<NodeId> },
    RestoreV2 { filename: NodeId, variables: Vec<NodeId> },

    // Управляющие
    Group(Vec<NodeId>),
}

impl NodeType {
    /// Входы узла (без управляющих зависимостей).
    pub fn inputs(&self) -> Vec<NodeId> {
        use NodeType::*;
        match self {
            Placeholder | Const(_) | Variable { .. } => vec![],
            Read(a) | Initialize(a) | Identity(a) | Square(a) | Log(a) | ReLU(a) | Softmax(a)
            | Mean(a) | SumChannels(a) | BatchMean(a) | BatchVariance(a) => vec![*a],
            Conv2d { input, kernel, bias } => {
                let mut ids = vec![*input, *kernel];
                ids.extend(bias);
                ids
            }
            BatchNorm {
                input,
                gamma,
                beta,
                moving_mean,
                moving_variance,
                batch_mean,
                batch_variance,
                learning_phase,
                ..
            } => vec![
                *input,
                *gamma,
                *beta,
                *moving_mean,
                *moving_variance,
                *batch_mean,
                *batch_variance,
                *learning_phase,
            ],
            MaxPool2d { input, .. } | UpSampling2d { input, .. } | SliceChannels { input, .. } => {
                vec![*input]
            }
            Concat { inputs } | Group(inputs) => inputs.clone(),
            Add(a, b) | Subtract(a, b) | Multiply(a, b) | Divide(a, b) => vec![*a, *b],
            Gradient { y, x } => vec![*y, *x],
            ApplyAdam {
                variable,
                m,
                v,
                gradient,
                learning_rate,
                beta_1,
                beta_2,
                iterations,
                ..
            } => vec![*variable, *m, *v, *gradient, *learning_rate, *beta_1, *beta_2, *iterations],
            AssignAdd { variable, value } | AssignMovingAverage { variable, value, .. } => {
                vec![*variable, *value]
            }
            SaveV2 { filename, variables } | RestoreV2 { filename, variables } => {
                let mut ids = vec![*filename];
                ids.extend(variables.iter().copied());
                ids
            }
        }
    }

    /// Производит ли узел выходной тензор `<имя>:0`.
    pub fn produces_tensor(&self) -> bool {
        !matches!(
            self,
            NodeType::Group(_) | NodeType::SaveV2 { .. } | NodeType::RestoreV2 { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    /// Узлы, которые должны выполниться раньше, не передавая данных
    pub control_inputs: Vec<NodeId>,
    /// `None` у управляющих узлов
    pub dims: Option<Dims>,
    pub dtype: DType,
}

impl Node {
    /// Все зависимости узла: входы данных и управляющие.
    pub fn dependencies(&self) -> Vec<NodeId> {
        let mut ids = self.node_type.inputs();
        ids.extend(self.control_inputs.iter().copied());
        ids
    }
}

/// Разбирает имя тензора `<операция>:<индекс>`.
pub fn split_tensor_name(name: &str) -> AsgResult<(&str, usize)> {
    let (op, index) = name
        .rsplit_once(':')
        .ok_or_else(|| AsgError::InvalidTensorName(name.to_string()))?;
    let index = index
        .parse::<usize>()
        .map_err(|_| AsgError::InvalidTensorName(name.to_string()))?;
    Ok((op, index))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Asg {
    nodes: Vec<Node>,
    names: BTreeMap<String, NodeId>,
}

impl Asg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Занято ли имя узлом или областью имён (`<name>/...`).
    pub fn is_name_used(&self, name: &str) -> bool {
        if self.names.contains_key(name) {
            return true;
        }
        let prefix = format!("{}/", name);
        self.names
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    /// Добавляет узел с точным именем. Занятое имя — ошибка, а не затенение.
    pub fn add_node(
        &mut self,
        name: &str,
        node_type: NodeType,
        dims: Option<Dims>,
        dtype: DType,
    ) -> AsgResult<NodeId> {
        if self.names.contains_key(name) {
            return Err(AsgError::NameAlreadyExists(name.to_string()));
        }
        let id = self.nodes.len();
        for input in node_type.inputs() {
            if input >= id {
                return Err(AsgError::DanglingInput { id, input });
            }
        }
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            node_type,
            control_inputs: vec![],
            dims,
            dtype,
        });
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Добавляет узел без проверок; вызывающий гарантирует уникальность имени и входы.
    pub(crate) fn push_node(
        &mut self,
        name: String,
        node_type: NodeType,
        dims: Option<Dims>,
        dtype: DType,
    ) -> NodeId {
        let id = self.nodes.len();
        self.names.insert(name.clone(), id);
        self.nodes.push(Node {
            id,
            name,
            node_type,
            control_inputs: vec![],
            dims,
            dtype,
        });
        id
    }

    /// Восстанавливает узел из сериализованного описания, проверяя ID, имя и входы.
    pub fn insert_node(&mut self, node: Node) -> AsgResult<NodeId> {
        let id = self.nodes.len();
        if node.id != id {
            return Err(AsgError::NodeNotFound(node.id));
        }
        for dep in node.control_inputs.iter().copied() {
            if dep >= id {
                return Err(AsgError::DanglingInput { id, input: dep });
            }
        }
        let Node {
            name,
            node_type,
            control_inputs,
            dims,
            dtype,
            ..
        } = node;
        self.add_node(&name, node_type, dims, dtype)?;
        self.nodes[id].control_inputs = control_inputs;
        Ok(id)
    }

    pub fn add_control_input(&mut self, id: NodeId, dependency: NodeId) -> AsgResult<()> {
        if dependency >= id {
            return Err(AsgError::DanglingInput { id, input: dependency });
        }
        let node = self.get_node_mut(id)?;
        node.control_inputs.push(dependency);
        Ok(())
    }

    /// Свободное имя на основе `base`: `base`, `base_1`, `base_2`, ...
    pub fn unique_name(&self, base: &str) -> String {
        if !self.is_name_used(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{}_{}", base, i))
            .find(|candidate| !self.is_name_used(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.names.get(name).map(|&id| &self.nodes[id])
    }

    pub fn get_operation_by_name(&self, name: &str) -> AsgResult<NodeId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| AsgError::OperationNotFound(name.to_string()))
    }

    pub fn get_tensor_by_name(&self, name: &str) -> AsgResult<NodeId> {
        let (op, index) = split_tensor_name(name)?;
        match self.node_by_name(op) {
            Some(node) if index == 0 && node.node_type.produces_tensor() => Ok(node.id),
            _ => Err(AsgError::TensorNotFound(name.to_string())),
        }
    }

    /// Имя выходного тензора узла (`<имя>:0`).
    pub fn tensor_name(&self, id: NodeId) -> AsgResult<String> {
        let node = self.get_node(id)?;
        if !node.node_type.produces_tensor() {
            return Err(AsgError::TensorNotFound(format!("{}:0", node.name)));
        }
        Ok(format!("{}:0", node.name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    pub fn variables(&self, collection: VariableCollection) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| {
                matches!(node.node_type, NodeType::Variable { collection: c, .. } if c == collection)
            })
            .map(|node| node.id)
            .collect()
    }

    /// Узел-инициализатор переменной (`Initialize(var)`).
    pub fn initializer_of(&self, variable: NodeId) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|node| node.node_type == NodeType::Initialize(variable))
            .map(|node| node.id)
    }

    fn dependency_graph(&self) -> DiGraph<NodeId, ()> {
        let mut graph = DiGraph::<NodeId, ()>::with_capacity(self.nodes.len(), self.nodes.len());
        for node in &self.nodes {
            graph.add_node(node.id);
        }
        for node in &self.nodes {
            for dep in node.dependencies() {
                graph.add_edge(NodeIndex::new(dep), NodeIndex::new(node.id), ());
            }
        }
        graph
    }

    /// Транзитивное замыкание зависимостей узла (включая сам узел).
    pub fn dependencies(&self, id: NodeId) -> AsgResult<HashSet<NodeId>> {
        self.get_node(id)?;
        let graph = self.dependency_graph();
        let reversed = Reversed(&graph);
        let mut dfs = Dfs::new(reversed, NodeIndex::new(id));
        let mut reached = HashSet::new();
        while let Some(nx) = dfs.next(reversed) {
            reached.insert(graph[nx]);
        }
        Ok(reached)
    }

    /// Топологический порядок выполнения всех зависимостей узла.
    pub fn execution_order(&self, id: NodeId) -> AsgResult<Vec<NodeId>> {
        let needed = self.dependencies(id)?;
        let graph = self.dependency_graph();
        let mut topo = Topo::new(&graph);
        let mut order = Vec::with_capacity(needed.len());
        while let Some(nx) = topo.next(&graph) {
            if needed.contains(&graph[nx]) {
                order.push(graph[nx]);
            }
        }
        Ok(order)
    }
}
