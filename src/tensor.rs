//! Модуль, определяющий `GraphContext`, `Tensor`, `Operation` и `Variable`.
//!
//! `Tensor` — это легковесный дескриптор узла графа, а не контейнер данных.
//! Все операции над тензорами добавляют узлы в граф, которым владеет
//! `GraphContext`. Контекст передаётся явно (`Rc<RefCell<GraphContext>>`),
//! глобального графа "по умолчанию" нет.
//!
//! Узлы, созданные построителями, получают уникальные имена внутри текущей
//! области имён. Псевдонимы (`identity_named`, `Operation::group_named`)
//! создаются строго: занятое имя — ошибка.

use crate::asg::{
    Asg, AsgResult, DType, Dims, Initializer, NodeId, NodeType, Value, VariableCollection,
};
use std::cell::RefCell;
use std::collections::HashSet;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

/// Контекст, который владеет графом и стеком областей имён.
#[derive(Debug, Clone, Default)]
pub struct GraphContext {
    graph: Asg,
    scopes: Vec<String>,
    reserved: HashSet<String>,
}

impl GraphContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Удобный конструктор разделяемого контекста.
    pub fn shared() -> Rc<RefCell<GraphContext>> {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn graph(&self) -> &Asg {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Asg {
        &mut self.graph
    }

    pub fn into_graph(self) -> Asg {
        self.graph
    }

    pub fn push_scope(&mut self, scope: &str) {
        let full = self.scoped_name(scope);
        self.scopes.push(full);
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Имя с префиксом текущей области (`training/Adam/...`).
    pub fn scoped_name(&self, base: &str) -> String {
        match self.scopes.last() {
            Some(scope) => format!("{}/{}", scope, base),
            None => base.to_string(),
        }
    }

    fn is_taken(&self, name: &str) -> bool {
        self.reserved.contains(name) || self.graph.is_name_used(name)
    }

    /// Уникальное имя в текущей области, не занятое ни узлом, ни зарезервированным слоем.
    pub fn unique_name(&self, base: &str) -> String {
        let scoped = self.scoped_name(base);
        if !self.is_taken(&scoped) {
            return scoped;
        }
        let found = (1..)
            .map(|i| format!("{}_{}", scoped, i))
            .find(|candidate| !self.is_taken(candidate));
        found.unwrap_or(scoped)
    }

    /// Резервирует уникальное имя слоя до того, как в его области появятся узлы.
    pub fn reserve_name(&mut self, base: &str) -> String {
        let name = self.unique_name(base);
        self.reserved.insert(name.clone());
        name
    }

    /// Добавляет узел с уникальным именем на основе `base`.
    pub(crate) fn add_unique(
        &mut self,
        base: &str,
        node_type: NodeType,
        dims: Option<Dims>,
        dtype: DType,
    ) -> NodeId {
        let name = self.unique_name(base);
        // имя свободно, а входы взяты из дескрипторов этого же контекста
        self.graph.push_node(name, node_type, dims, dtype)
    }
}

/// Выполняет `f` внутри области имён `scope`.
pub fn name_scope<T>(context: &Rc<RefCell<GraphContext>>, scope: &str, f: impl FnOnce() -> T) -> T {
    context.borrow_mut().push_scope(scope);
    let result = f();
    context.borrow_mut().pop_scope();
    result
}

/// Символьный дескриптор узла, производящего тензор.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    fn from_node(context: &Rc<RefCell<GraphContext>>, node_id: NodeId) -> Self {
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Создает входной узел, в который данные подаются во время выполнения.
    pub fn placeholder(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        dims: Dims,
        dtype: DType,
    ) -> Self {
        let node_id = context
            .borrow_mut()
            .add_unique(name, NodeType::Placeholder, Some(dims), dtype);
        Self::from_node(context, node_id)
    }

    /// Входной узел с точным именем на корневом уровне; занятое имя — ошибка.
    pub fn placeholder_named(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        dims: Dims,
        dtype: DType,
    ) -> AsgResult<Self> {
        let node_id = context.borrow_mut().graph_mut().add_node(
            name,
            NodeType::Placeholder,
            Some(dims),
            dtype,
        )?;
        Ok(Self::from_node(context, node_id))
    }

    /// Создает константу, встроенную в граф.
    pub fn constant(context: &Rc<RefCell<GraphContext>>, name: &str, value: Value) -> Self {
        let (dims, dtype) = match &value {
            Value::Tensor(arr) => (arr.shape().iter().map(|&d| Some(d)).collect(), DType::F32),
            Value::ScalarF32(_) => (vec![], DType::F32),
            Value::ScalarI64(_) => (vec![], DType::I64),
            Value::ScalarBool(_) => (vec![], DType::Bool),
            Value::Text(_) => (vec![], DType::String),
        };
        let node_id = context
            .borrow_mut()
            .add_unique(name, NodeType::Const(value), Some(dims), dtype);
        Self::from_node(context, node_id)
    }

    /// Находит уже существующий тензор по имени `<операция>:0`.
    pub fn lookup(context: &Rc<RefCell<GraphContext>>, tensor_name: &str) -> AsgResult<Self> {
        let node_id = context.borrow().graph().get_tensor_by_name(tensor_name)?;
        Ok(Self::from_node(context, node_id))
    }

    /// Имя выходного тензора: `<операция>:0`.
    pub fn name(&self) -> String {
        format!("{}:0", self.op_name())
    }

    /// Имя узла, производящего тензор.
    pub fn op_name(&self) -> String {
        let ctx = self.context.borrow();
        ctx.graph()
            .get_node(self.node_id)
            .map(|node| node.name.clone())
            .unwrap_or_default()
    }

    pub fn dims(&self) -> Dims {
        let ctx = self.context.borrow();
        ctx.graph()
            .get_node(self.node_id)
            .ok()
            .and_then(|node| node.dims.clone())
            .unwrap_or_default()
    }

    pub fn dtype(&self) -> DType {
        let ctx = self.context.borrow();
        ctx.graph()
            .get_node(self.node_id)
            .map(|node| node.dtype)
            .unwrap_or(DType::F32)
    }

    fn derive(&self, base: &str, node_type: NodeType, dims: Dims) -> Tensor {
        let dtype = self.dtype();
        let node_id = self
            .context
            .borrow_mut()
            .add_unique(base, node_type, Some(dims), dtype);
        Tensor::from_node(&self.context, node_id)
    }

    /// Узел-псевдоним с точным именем на корневом уровне графа.
    ///
    /// Исходный тензор остаётся в графе. Если имя уже занято, возвращается
    /// `AsgError::NameAlreadyExists`.
    pub fn identity_named(&self, name: &str) -> AsgResult<Tensor> {
        let dims = self.dims();
        let dtype = self.dtype();
        let node_id = self.context.borrow_mut().graph_mut().add_node(
            name,
            NodeType::Identity(self.node_id),
            Some(dims),
            dtype,
        )?;
        Ok(Tensor::from_node(&self.context, node_id))
    }

    pub fn identity(&self) -> Tensor {
        self.derive("Identity", NodeType::Identity(self.node_id), self.dims())
    }

    // --- Слои ---

    /// Свертка с паддингом "same" и шагом 1; меняется только число каналов.
    pub fn conv2d(&self, kernel: &Tensor, bias: Option<&Tensor>, filters: usize) -> Tensor {
        let mut dims = self.dims();
        if let Some(channels) = dims.last_mut() {
            *channels = Some(filters);
        }
        self.derive(
            "Conv2D",
            NodeType::Conv2d {
                input: self.node_id,
                kernel: kernel.node_id,
                bias: bias.map(|b| b.node_id),
            },
            dims,
        )
    }

    pub fn max_pool2d(&self, pool: (usize, usize)) -> Tensor {
        let dims = resize_spatial(self.dims(), |d, axis| d / axis_factor(pool, axis));
        self.derive("MaxPool", NodeType::MaxPool2d { input: self.node_id, pool }, dims)
    }

    pub fn upsample2d(&self, size: (usize, usize)) -> Tensor {
        let dims = resize_spatial(self.dims(), |d, axis| d * axis_factor(size, axis));
        self.derive("UpSampling2D", NodeType::UpSampling2d { input: self.node_id, size }, dims)
    }

    /// Конкатенация по оси каналов.
    pub fn concat(tensors: &[&Tensor]) -> Tensor {
        let first = tensors[0];
        let mut dims = first.dims();
        let channels: Option<usize> = tensors
            .iter()
            .map(|t| t.dims().last().copied().flatten())
            .sum();
        if let Some(last) = dims.last_mut() {
            *last = channels;
        }
        first.derive(
            "concat",
            NodeType::Concat {
                inputs: tensors.iter().map(|t| t.node_id).collect(),
            },
            dims,
        )
    }

    /// Каналы `[start, end)`.
    pub fn slice_channels(&self, start: usize, end: usize) -> Tensor {
        let mut dims = self.dims();
        if let Some(last) = dims.last_mut() {
            *last = Some(end - start);
        }
        self.derive(
            "strided_slice",
            NodeType::SliceChannels { input: self.node_id, start, end },
            dims,
        )
    }

    // --- Поэлементные ---

    pub fn relu(&self) -> Tensor {
        self.derive("Relu", NodeType::ReLU(self.node_id), self.dims())
    }

    /// Softmax по оси каналов.
    pub fn softmax(&self) -> Tensor {
        self.derive("Softmax", NodeType::Softmax(self.node_id), self.dims())
    }

    pub fn square(&self) -> Tensor {
        self.derive("Square", NodeType::Square(self.node_id), self.dims())
    }

    pub fn log(&self) -> Tensor {
        self.derive("Log", NodeType::Log(self.node_id), self.dims())
    }

    /// Умножение на скалярную константу.
    pub fn scale(&self, factor: f32) -> Tensor {
        let factor = Tensor::constant(&self.context, "Const", Value::ScalarF32(factor));
        self * &factor
    }

    // --- Редукции ---

    /// Среднее по всем осям (скаляр).
    pub fn mean(&self) -> Tensor {
        self.derive("Mean", NodeType::Mean(self.node_id), vec![])
    }

    /// Сумма по оси каналов (ось удаляется).
    pub fn sum_channels(&self) -> Tensor {
        let mut dims = self.dims();
        dims.pop();
        self.derive("Sum", NodeType::SumChannels(self.node_id), dims)
    }

    pub fn batch_mean(&self) -> Tensor {
        let dims = self.dims().last().copied().into_iter().collect();
        self.derive("moments/mean", NodeType::BatchMean(self.node_id), dims)
    }

    pub fn batch_variance(&self) -> Tensor {
        let dims = self.dims().last().copied().into_iter().collect();
        self.derive("moments/variance", NodeType::BatchVariance(self.node_id), dims)
    }

    fn binary(&self, rhs: &Tensor, base: &str, node_type: NodeType) -> Tensor {
        let dims = broadcast_dims(self.dims(), rhs.dims());
        self.derive(base, node_type, dims)
    }
}

fn axis_factor(pair: (usize, usize), axis: usize) -> usize {
    if axis == 0 {
        pair.0.max(1)
    } else {
        pair.1.max(1)
    }
}

/// Пересчитывает пространственные оси NHWC, оставляя динамические оси динамическими.
fn resize_spatial(mut dims: Dims, f: impl Fn(usize, usize) -> usize) -> Dims {
    if dims.len() == 4 {
        for axis in 0..2 {
            dims[axis + 1] = dims[axis + 1].map(|d| f(d, axis));
        }
    }
    dims
}

/// Форма результата бинарной операции: скаляры и векторы каналов транслируются.
fn broadcast_dims(lhs: Dims, rhs: Dims) -> Dims {
    if lhs.len() >= rhs.len() {
        lhs
    } else {
        rhs
    }
}

impl Add<&Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        self.binary(rhs, "add", NodeType::Add(self.node_id, rhs.node_id))
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        self.binary(rhs, "sub", NodeType::Subtract(self.node_id, rhs.node_id))
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        self.binary(rhs, "mul", NodeType::Multiply(self.node_id, rhs.node_id))
    }
}

impl Div<&Tensor> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: &Tensor) -> Self::Output {
        self.binary(rhs, "truediv", NodeType::Divide(self.node_id, rhs.node_id))
    }
}

/// Дескриптор управляющего узла (без выходного тензора).
#[derive(Debug, Clone)]
pub struct Operation {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Operation {
    pub fn from_node(context: &Rc<RefCell<GraphContext>>, node_id: NodeId) -> Self {
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    pub fn lookup(context: &Rc<RefCell<GraphContext>>, name: &str) -> AsgResult<Self> {
        let node_id = context.borrow().graph().get_operation_by_name(name)?;
        Ok(Self::from_node(context, node_id))
    }

    pub fn name(&self) -> String {
        let ctx = self.context.borrow();
        ctx.graph()
            .get_node(self.node_id)
            .map(|node| node.name.clone())
            .unwrap_or_default()
    }

    /// Группа зависимостей с уникальным именем в текущей области.
    pub fn group(context: &Rc<RefCell<GraphContext>>, base: &str, deps: Vec<NodeId>) -> Self {
        let node_id = context
            .borrow_mut()
            .add_unique(base, NodeType::Group(deps), None, DType::F32);
        Self::from_node(context, node_id)
    }

    /// Группа с точным именем на корневом уровне; занятое имя — ошибка.
    pub fn group_named(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        deps: Vec<NodeId>,
    ) -> AsgResult<Self> {
        let node_id = context.borrow_mut().graph_mut().add_node(
            name,
            NodeType::Group(deps),
            None,
            DType::F32,
        )?;
        Ok(Self::from_node(context, node_id))
    }
}

/// Переменная: узел `<v>`, его чтение `<v>/read` и инициализатор `<v>/Assign`.
#[derive(Debug, Clone)]
pub struct Variable {
    pub var: Tensor,
    pub read: Tensor,
    pub initializer: Operation,
}

impl Variable {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: &[usize],
        dtype: DType,
        initializer: Initializer,
        collection: VariableCollection,
        trainable: bool,
    ) -> Self {
        let dims: Dims = shape.iter().map(|&d| Some(d)).collect();
        let mut ctx = context.borrow_mut();
        let var_id = ctx.add_unique(
            name,
            NodeType::Variable {
                initializer,
                collection,
                trainable,
            },
            Some(dims.clone()),
            dtype,
        );
        let var_name = ctx.graph().get_node(var_id).map(|n| n.name.clone()).unwrap_or_default();

        // дочерние узлы живут в области самой переменной
        ctx.scopes.push(var_name);
        let read_id = ctx.add_unique("read", NodeType::Read(var_id), Some(dims.clone()), dtype);
        let init_id = ctx.add_unique("Assign", NodeType::Initialize(var_id), Some(dims), dtype);
        ctx.scopes.pop();
        drop(ctx);

        Self {
            var: Tensor::from_node(context, var_id),
            read: Tensor::from_node(context, read_id),
            initializer: Operation::from_node(context, init_id),
        }
    }

    /// Обучаемый вес float32.
    pub fn weight(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: &[usize],
        initializer: Initializer,
    ) -> Self {
        Self::new(context, name, shape, DType::F32, initializer, VariableCollection::Global, true)
    }

    /// Необучаемое глобальное состояние (скользящие средние, счётчики, слоты оптимизатора).
    pub fn state(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: &[usize],
        dtype: DType,
        initializer: Initializer,
    ) -> Self {
        Self::new(context, name, shape, dtype, initializer, VariableCollection::Global, false)
    }

    pub fn name(&self) -> String {
        self.var.op_name()
    }
}
