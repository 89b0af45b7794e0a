//! Модуль, содержащий оптимизаторы.
//!
//! Оптимизатор здесь не обновляет веса сам: он добавляет в граф переменные
//! своих гиперпараметров и узлы обновления, которые выполнит среда исполнения.

use crate::asg::{DType, Initializer, NodeId, NodeType};
use crate::tensor::{name_scope, GraphContext, Tensor, Variable};
use std::cell::RefCell;
use std::rc::Rc;

/// Трейт, определяющий общий интерфейс для всех оптимизаторов.
pub trait Optimizer {
    /// Переменная скорости обучения (`<opt>/lr`).
    fn learning_rate(&self) -> &Variable;

    /// Строит узлы обновления весов для минимизации `loss`.
    ///
    /// # Аргументы
    ///
    /// * `loss` - Скалярный тензор потерь.
    /// * `params` - Обучаемые переменные модели.
    fn get_updates(&self, loss: &Tensor, params: &[Variable]) -> Vec<NodeId>;
}

/// Adam с гиперпараметрами в виде переменных графа (`Adam/lr`, `Adam/beta_1`, ...).
pub struct Adam {
    pub iterations: Variable,
    pub lr: Variable,
    pub beta_1: Variable,
    pub beta_2: Variable,
    pub decay: Variable,
    pub epsilon: f32,
    context: Rc<RefCell<GraphContext>>,
}

impl Adam {
    /// Создает Adam со стандартными beta_1 = 0.9, beta_2 = 0.999.
    pub fn new(context: &Rc<RefCell<GraphContext>>, learning_rate: f32) -> Self {
        let scope = context.borrow_mut().reserve_name("Adam");
        let (iterations, lr, beta_1, beta_2, decay) = name_scope(context, &scope, || {
            let hyper = |name: &str, value: f32| {
                Variable::state(context, name, &[], DType::F32, Initializer::Constant(value))
            };
            (
                Variable::state(context, "iterations", &[], DType::I64, Initializer::Zeros),
                hyper("lr", learning_rate),
                hyper("beta_1", 0.9),
                hyper("beta_2", 0.999),
                hyper("decay", 0.0),
            )
        });
        Self {
            iterations,
            lr,
            beta_1,
            beta_2,
            decay,
            epsilon: 1e-7,
            context: Rc::clone(context),
        }
    }
}

impl Optimizer for Adam {
    fn learning_rate(&self) -> &Variable {
        &self.lr
    }

    fn get_updates(&self, loss: &Tensor, params: &[Variable]) -> Vec<NodeId> {
        let ctx = &self.context;
        name_scope(ctx, "Adam", || {
            let one = Tensor::constant(ctx, "Const", crate::asg::Value::ScalarF32(1.0));
            let mut updates = Vec::with_capacity(params.len() + 1);
            updates.push(ctx.borrow_mut().add_unique(
                "AssignAdd",
                NodeType::AssignAdd {
                    variable: self.iterations.var.node_id,
                    value: one.node_id,
                },
                Some(vec![]),
                DType::I64,
            ));

            for param in params {
                let dims = param.var.dims();
                let grad_name = format!("{}_grad", param.name().replace('/', "_"));
                let shape: Vec<usize> = dims.iter().map(|d| d.unwrap_or(1)).collect();
                let m = Variable::state(ctx, "Variable", &shape, DType::F32, Initializer::Zeros);
                let v = Variable::state(ctx, "Variable", &shape, DType::F32, Initializer::Zeros);
                let gradient = name_scope(ctx, "gradients", || {
                    ctx.borrow_mut().add_unique(
                        &grad_name,
                        NodeType::Gradient {
                            y: loss.node_id,
                            x: param.read.node_id,
                        },
                        Some(dims.clone()),
                        DType::F32,
                    )
                });
                updates.push(ctx.borrow_mut().add_unique(
                    "ApplyAdam",
                    NodeType::ApplyAdam {
                        variable: param.var.node_id,
                        m: m.var.node_id,
                        v: v.var.node_id,
                        gradient,
                        learning_rate: self.lr.read.node_id,
                        beta_1: self.beta_1.read.node_id,
                        beta_2: self.beta_2.read.node_id,
                        iterations: self.iterations.read.node_id,
                        epsilon: self.epsilon,
                    },
                    Some(dims),
                    DType::F32,
                ));
            }
            updates
        })
    }
}
