//! BatchNormalization слой для графовой архитектуры.
//!
//! Нормализует вход по осям N, H, W. В фазе обучения (`keras_learning_phase = true`)
//! используются статистики батча, в фазе inference — скользящие средние.
//! Обновления скользящих средних строятся отдельно, функцией обучения модели.

use crate::asg::{DType, Initializer, NodeId, NodeType};
use crate::nn::Module;
use crate::tensor::{name_scope, GraphContext, Tensor, Variable};
use std::cell::RefCell;
use std::rc::Rc;

/// Малая константа для численной стабильности.
const EPSILON: f32 = 1e-3;

/// Momentum для обновления скользящих статистик (как в Keras).
const DEFAULT_MOMENTUM: f32 = 0.99;

/// Слой Batch Normalization.
pub struct BatchNormalization {
    pub name: String,
    /// Обучаемый масштаб (scale)
    pub gamma: Variable,
    /// Обучаемый сдвиг (shift)
    pub beta: Variable,
    pub moving_mean: Variable,
    pub moving_variance: Variable,
    pub momentum: f32,
    learning_phase: Tensor,
    /// Статистики батча, появляются после `forward`
    moments: RefCell<Option<(Tensor, Tensor)>>,
}

impl BatchNormalization {
    /// Создаёт слой для `channels` каналов.
    ///
    /// # Аргументы
    /// * `ctx` - Контекст графа для регистрации переменных
    /// * `channels` - Число каналов входа
    /// * `learning_phase` - Булев placeholder фазы обучения
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, channels: usize, learning_phase: &Tensor) -> Self {
        let name = ctx.borrow_mut().reserve_name("batch_normalization");
        let (gamma, beta, moving_mean, moving_variance) = name_scope(ctx, &name, || {
            (
                Variable::weight(ctx, "gamma", &[channels], Initializer::Ones),
                Variable::weight(ctx, "beta", &[channels], Initializer::Zeros),
                Variable::state(ctx, "moving_mean", &[channels], DType::F32, Initializer::Zeros),
                Variable::state(ctx, "moving_variance", &[channels], DType::F32, Initializer::Ones),
            )
        });

        Self {
            name,
            gamma,
            beta,
            moving_mean,
            moving_variance,
            momentum: DEFAULT_MOMENTUM,
            learning_phase: learning_phase.clone(),
            moments: RefCell::new(None),
        }
    }

    /// Создаёт слой с указанным momentum.
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// Узлы обновления скользящих средних (`<bn>/AssignMovingAvg`, `<bn>/AssignMovingAvg_1`).
    ///
    /// Пусто, если слой ещё не применялся.
    pub fn build_updates(&self) -> Vec<NodeId> {
        let moments = self.moments.borrow();
        let Some((mean, variance)) = moments.as_ref() else {
            return Vec::new();
        };
        let ctx = &mean.context;
        name_scope(ctx, &self.name, || {
            [(&self.moving_mean, mean), (&self.moving_variance, variance)]
                .into_iter()
                .map(|(moving, batch)| {
                    let dims = moving.var.dims();
                    ctx.borrow_mut().add_unique(
                        "AssignMovingAvg",
                        NodeType::AssignMovingAverage {
                            variable: moving.var.node_id,
                            value: batch.node_id,
                            momentum: self.momentum,
                        },
                        Some(dims),
                        DType::F32,
                    )
                })
                .collect()
        })
    }
}

impl Module for BatchNormalization {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, inputs: &Tensor) -> Tensor {
        let ctx = &inputs.context;
        name_scope(ctx, &self.name, || {
            let mean = inputs.batch_mean();
            let variance = inputs.batch_variance();
            let dims = inputs.dims();
            let node_id = ctx.borrow_mut().add_unique(
                "FusedBatchNorm",
                NodeType::BatchNorm {
                    input: inputs.node_id,
                    gamma: self.gamma.read.node_id,
                    beta: self.beta.read.node_id,
                    moving_mean: self.moving_mean.read.node_id,
                    moving_variance: self.moving_variance.read.node_id,
                    batch_mean: mean.node_id,
                    batch_variance: variance.node_id,
                    learning_phase: self.learning_phase.node_id,
                    epsilon: EPSILON,
                },
                Some(dims),
                DType::F32,
            );
            *self.moments.borrow_mut() = Some((mean, variance));
            Tensor {
                node_id,
                context: Rc::clone(ctx),
            }
        })
    }

    fn parameters(&self) -> Vec<Variable> {
        vec![self.gamma.clone(), self.beta.clone()]
    }
}
