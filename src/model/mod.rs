//! Модель DenoiSeg: совместное шумоподавление (Noise2Void) и сегментация на U-Net.
//!
//! Модель строится в явном `GraphContext`. Подграфы обучения появляются только
//! после `prepare_for_training` и `make_*_function`; до этого потери, метрики,
//! оптимизатор и управляющие операции в графе отсутствуют.
//!
//! Остальная часть крейта читает модель только через трейт [`ModelHandle`].

pub mod config;
pub mod unet;

pub use config::DenoiSegConfig;
pub use unet::UNet;

use crate::asg::{AsgError, DType, Initializer, NodeId, NodeType, VariableCollection};
use crate::losses::{denoiseg_loss, N_CLASSES};
use crate::optimizers::{Adam, Optimizer};
use crate::tensor::{name_scope, GraphContext, Operation, Tensor, Variable};
use log::{debug, info};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Некорректная конфигурация, поля: {0:?}")]
    InvalidConfig(Vec<String>),

    #[error("Модель не подготовлена: вызовите {0} перед этим шагом")]
    NotPrepared(&'static str),

    #[error("Ошибка ввода/вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ошибка JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Graph(#[from] AsgError),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Имена метрик в порядке, в котором их отдаёт модель; первая — суммарная потеря.
pub const METRICS_NAMES: [&str; 4] = ["loss", "denoiseg", "seg_loss", "denoise_loss"];

/// Имя входного узла; его тензор `input:0` виден потребителям графа.
pub const INPUT_NAME: &str = "input";

/// Логические имена выходов модели.
pub const OUTPUT_NAMES: [&str; 2] = ["out_denoise", "out_segment"];

/// Порты построенной модели, доступные для чтения.
///
/// Коллекции обучения пусты (или `None`), пока модель не подготовлена.
pub trait ModelHandle {
    fn context(&self) -> &Rc<RefCell<GraphContext>>;
    fn inputs(&self) -> Vec<Tensor>;
    fn outputs(&self) -> Vec<Tensor>;
    fn output_names(&self) -> Vec<String>;
    /// Имена метрик; включают суммарную потерю первым элементом.
    fn metrics_names(&self) -> Vec<String>;
    fn total_loss(&self) -> Option<Tensor>;
    /// Тензоры метрик; суммарной потери среди них нет.
    fn metrics_tensors(&self) -> Vec<Tensor>;
    fn targets(&self) -> Vec<Tensor>;
    /// Переменная скорости обучения оптимизатора.
    fn learning_rate(&self) -> Option<Tensor>;
}

/// Скомпилированная функция модели: что подаётся, что забирается, что обновляется.
#[derive(Debug, Clone)]
pub struct Function {
    pub inputs: Vec<Tensor>,
    pub outputs: Vec<Tensor>,
    pub updates: Option<Operation>,
}

struct TrainingGraph {
    optimizer: Adam,
    targets: Vec<Tensor>,
    sample_weights: Vec<Tensor>,
    total_loss: Tensor,
    metrics_tensors: Vec<Tensor>,
}

pub struct DenoiSeg {
    pub config: DenoiSegConfig,
    pub name: String,
    pub logdir: Option<PathBuf>,
    context: Rc<RefCell<GraphContext>>,
    input: Tensor,
    learning_phase: Tensor,
    unet: UNet,
    outputs: Vec<Tensor>,
    training: Option<TrainingGraph>,
    train_function: Option<Function>,
    test_function: Option<Function>,
    predict_function: Option<Function>,
}

impl DenoiSeg {
    /// Строит сеть в `context`. С `basedir` конфигурация пишется в `<basedir>/<name>/config.json`.
    pub fn new(
        config: DenoiSegConfig,
        name: &str,
        basedir: Option<&Path>,
        context: &Rc<RefCell<GraphContext>>,
    ) -> ModelResult<Self> {
        config.validate()?;

        let logdir = match basedir {
            Some(dir) => {
                let logdir = dir.join(name);
                fs::create_dir_all(&logdir)?;
                config.save_json(logdir.join("config.json"))?;
                debug!("конфигурация сохранена в {}", logdir.display());
                Some(logdir)
            }
            None => None,
        };

        let c = config.n_channel_in;
        let input =
            Tensor::placeholder_named(context, INPUT_NAME, vec![None, None, None, Some(c)], DType::F32)?;
        let learning_phase =
            Tensor::placeholder(context, "keras_learning_phase", vec![], DType::Bool);
        let unet = UNet::build(&input, &learning_phase, &config);

        let head = &unet.head;
        let out_denoise = name_scope(context, OUTPUT_NAMES[0], || head.slice_channels(0, c));
        let out_segment = name_scope(context, OUTPUT_NAMES[1], || {
            head.slice_channels(c, c + N_CLASSES).softmax()
        });

        info!(
            "модель '{}' построена: {} узлов графа",
            name,
            context.borrow().graph().len()
        );

        Ok(Self {
            config,
            name: name.to_string(),
            logdir,
            context: Rc::clone(context),
            input,
            learning_phase,
            unet,
            outputs: vec![out_denoise, out_segment],
            training: None,
            train_function: None,
            test_function: None,
            predict_function: None,
        })
    }

    pub fn head(&self) -> &Tensor {
        &self.unet.head
    }

    pub fn is_prepared(&self) -> bool {
        self.training.is_some()
    }

    /// Создаёт оптимизатор, цели обучения, потери и метрики. Повторный вызов ничего не делает.
    pub fn prepare_for_training(&mut self) {
        if self.training.is_some() {
            return;
        }
        let ctx = &self.context;
        let head = &self.unet.head;
        let c = self.config.n_channel_in;
        let head_name = head.op_name();
        let layer = head_name.split('/').next().unwrap_or("output").to_string();

        let optimizer = Adam::new(ctx, self.config.train_learning_rate);
        let target = Tensor::placeholder(
            ctx,
            &format!("{}_target", layer),
            vec![None, None, None, Some(2 * c + N_CLASSES)],
            DType::F32,
        );
        let sample_weights =
            Tensor::placeholder(ctx, &format!("{}_sample_weights", layer), vec![None], DType::F32);

        let losses = name_scope(ctx, "loss", || {
            let terms = denoiseg_loss(
                &target,
                head,
                c,
                self.config.denoiseg_alpha,
                &self.config.relative_weights,
            );
            let weighted = &terms.denoiseg * &sample_weights.mean();
            let loss_weight = Tensor::constant(ctx, "loss_weight", crate::asg::Value::ScalarF32(1.0));
            (terms, &loss_weight * &weighted)
        });
        let (terms, total_loss) = losses;

        let metrics_tensors = name_scope(ctx, "metrics", || {
            [&terms.denoiseg, &terms.seg, &terms.denoise]
                .into_iter()
                .zip(&METRICS_NAMES[1..])
                .map(|(term, name)| name_scope(ctx, name, || term.mean()))
                .collect::<Vec<_>>()
        });

        info!("модель подготовлена к обучению: {} метрик", METRICS_NAMES.len());
        self.training = Some(TrainingGraph {
            optimizer,
            targets: vec![target],
            sample_weights: vec![sample_weights],
            total_loss,
            metrics_tensors,
        });
    }

    fn training_graph(&self) -> ModelResult<&TrainingGraph> {
        self.training
            .as_ref()
            .ok_or(ModelError::NotPrepared("prepare_for_training"))
    }

    /// Функция обучения: шаг Adam, счётчик итераций и скользящие средние BatchNorm,
    /// собранные в `training/group_deps`.
    pub fn make_train_function(&mut self) -> ModelResult<&Function> {
        if self.train_function.is_none() {
            let training = self.training_graph()?;
            let ctx = &self.context;
            let params = self.unet.parameters();
            let (updates, group) = name_scope(ctx, "training", || {
                let mut updates = training.optimizer.get_updates(&training.total_loss, &params);
                for bn in &self.unet.batch_norms {
                    updates.extend(bn.build_updates());
                }
                let mut deps: Vec<NodeId> = updates.clone();
                deps.push(training.total_loss.node_id);
                deps.extend(training.metrics_tensors.iter().map(|t| t.node_id));
                (updates, Operation::group(ctx, "group_deps", deps))
            });
            debug!("функция обучения: {} обновлений", updates.len());

            let function = Function {
                inputs: self.feeds(training),
                outputs: self.fetches(training),
                updates: Some(group),
            };
            self.train_function = Some(function);
        }
        self.train_function
            .as_ref()
            .ok_or(ModelError::NotPrepared("make_train_function"))
    }

    /// Функция валидации: локальные накопители среднего по каждой метрике,
    /// собранные в `group_deps`.
    pub fn make_test_function(&mut self) -> ModelResult<&Function> {
        if self.test_function.is_none() {
            let training = self.training_graph()?;
            let ctx = &self.context;
            let fetches = self.fetches(training);
            let mut deps = Vec::new();
            for (tensor, name) in fetches.iter().zip(METRICS_NAMES) {
                name_scope(ctx, &format!("metrics/{}", name), || {
                    let total = Variable::new(
                        ctx,
                        "total",
                        &[],
                        DType::F32,
                        Initializer::Zeros,
                        VariableCollection::Local,
                        false,
                    );
                    let count = Variable::new(
                        ctx,
                        "count",
                        &[],
                        DType::F32,
                        Initializer::Zeros,
                        VariableCollection::Local,
                        false,
                    );
                    let one = Tensor::constant(ctx, "Const", crate::asg::Value::ScalarF32(1.0));
                    for (variable, value) in [(&total, tensor), (&count, &one)] {
                        deps.push(ctx.borrow_mut().add_unique(
                            "AssignAdd",
                            NodeType::AssignAdd {
                                variable: variable.var.node_id,
                                value: value.node_id,
                            },
                            Some(vec![]),
                            DType::F32,
                        ));
                    }
                });
            }
            let group = Operation::group(ctx, "group_deps", deps);

            let function = Function {
                inputs: self.feeds(training),
                outputs: fetches,
                updates: Some(group),
            };
            self.test_function = Some(function);
        }
        self.test_function
            .as_ref()
            .ok_or(ModelError::NotPrepared("make_test_function"))
    }

    /// Функция предсказания: вход и фаза обучения подаются, выходы модели забираются.
    pub fn make_predict_function(&mut self) -> &Function {
        let inputs = vec![self.input.clone(), self.learning_phase.clone()];
        let outputs = self.outputs.clone();
        self.predict_function.get_or_insert_with(|| Function {
            inputs,
            outputs,
            updates: None,
        })
    }

    fn feeds(&self, training: &TrainingGraph) -> Vec<Tensor> {
        let mut feeds = vec![self.input.clone(), self.learning_phase.clone()];
        feeds.extend(training.targets.iter().cloned());
        feeds.extend(training.sample_weights.iter().cloned());
        feeds
    }

    fn fetches(&self, training: &TrainingGraph) -> Vec<Tensor> {
        let mut fetches = vec![training.total_loss.clone()];
        fetches.extend(training.metrics_tensors.iter().cloned());
        fetches
    }
}

impl ModelHandle for DenoiSeg {
    fn context(&self) -> &Rc<RefCell<GraphContext>> {
        &self.context
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.outputs.clone()
    }

    fn output_names(&self) -> Vec<String> {
        OUTPUT_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn metrics_names(&self) -> Vec<String> {
        match self.training {
            Some(_) => METRICS_NAMES.iter().map(|s| s.to_string()).collect(),
            None => Vec::new(),
        }
    }

    fn total_loss(&self) -> Option<Tensor> {
        self.training.as_ref().map(|t| t.total_loss.clone())
    }

    fn metrics_tensors(&self) -> Vec<Tensor> {
        self.training
            .as_ref()
            .map(|t| t.metrics_tensors.clone())
            .unwrap_or_default()
    }

    fn targets(&self) -> Vec<Tensor> {
        self.training
            .as_ref()
            .map(|t| t.targets.clone())
            .unwrap_or_default()
    }

    fn learning_rate(&self) -> Option<Tensor> {
        self.training
            .as_ref()
            .map(|t| t.optimizer.learning_rate().var.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_model() -> DenoiSeg {
        let ctx = GraphContext::shared();
        let config = DenoiSegConfig::from_data(&[4, 16, 16, 1])
            .with_unet_n_depth(2)
            .with_unet_n_first(4);
        DenoiSeg::new(config, "denoiseg_model", None, &ctx).unwrap()
    }

    #[test]
    fn test_unprepared_model_exposes_no_training_ports() {
        let mut model = small_model();
        assert!(model.metrics_names().is_empty());
        assert!(model.total_loss().is_none());
        assert!(model.learning_rate().is_none());
        assert!(matches!(
            model.make_train_function(),
            Err(ModelError::NotPrepared("prepare_for_training"))
        ));
        assert!(model.make_test_function().is_err());
        assert_eq!(model.inputs()[0].name(), "input:0");
    }

    #[test]
    fn test_metrics_collections_are_offset_by_one() {
        let mut model = small_model();
        model.prepare_for_training();
        assert_eq!(model.metrics_names().len(), model.metrics_tensors().len() + 1);
        assert_eq!(model.learning_rate().unwrap().name(), "Adam/lr:0");
        assert!(model.targets()[0].op_name().ends_with("_target"));
        assert!(model.total_loss().unwrap().op_name().starts_with("loss/"));
    }

    #[test]
    fn test_function_ops_and_idempotence() {
        let mut model = small_model();
        model.prepare_for_training();
        let train = model.make_train_function().unwrap().updates.clone().unwrap();
        assert_eq!(train.name(), "training/group_deps");
        let again = model.make_train_function().unwrap().updates.clone().unwrap();
        assert_eq!(train.node_id, again.node_id);

        let test = model.make_test_function().unwrap().updates.clone().unwrap();
        assert_eq!(test.name(), "group_deps");
        assert_eq!(model.make_predict_function().outputs.len(), 2);

        let ctx = model.context().borrow();
        let graph = ctx.graph();
        assert!(graph.node_by_name("metrics/loss/total").is_some());
        assert_eq!(graph.variables(VariableCollection::Local).len(), 2 * METRICS_NAMES.len());
    }

    #[test]
    fn test_batch_norm_model_builds_train_function() {
        let ctx = GraphContext::shared();
        let config = DenoiSegConfig::from_data(&[4, 16, 16, 1])
            .with_unet_n_depth(1)
            .with_unet_n_first(2)
            .with_batch_norm(true);
        let mut model = DenoiSeg::new(config, "denoiseg_model", None, &ctx).unwrap();
        model.prepare_for_training();
        let train = model.make_train_function().unwrap().updates.clone().unwrap();

        let graph = ctx.borrow();
        let deps = match &graph.graph().get_node(train.node_id).unwrap().node_type {
            NodeType::Group(deps) => deps.clone(),
            other => panic!("train step is not a group: {:?}", other),
        };
        let dep_names: Vec<&str> = deps
            .iter()
            .map(|&id| graph.graph().get_node(id).unwrap().name.as_str())
            .collect();
        assert!(dep_names.iter().any(|n| n.ends_with("/ApplyAdam")));
        assert!(dep_names.iter().any(|n| n.contains("batch_normalization") && n.ends_with("/AssignMovingAvg")));
    }

    #[test]
    fn test_taken_input_name_is_an_error() {
        let ctx = GraphContext::shared();
        Tensor::placeholder(&ctx, INPUT_NAME, vec![None], DType::F32);
        let config = DenoiSegConfig::from_data(&[4, 16, 16, 1]).with_unet_n_depth(1).with_unet_n_first(2);
        assert!(matches!(
            DenoiSeg::new(config, "denoiseg_model", None, &ctx),
            Err(ModelError::Graph(AsgError::NameAlreadyExists(ref name))) if name == INPUT_NAME
        ));
    }

    #[test]
    fn test_basedir_receives_config() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = GraphContext::shared();
        let config = DenoiSegConfig::new().with_unet_n_depth(1).with_unet_n_first(2);
        let model = DenoiSeg::new(config.clone(), "m", Some(dir.path()), &ctx).unwrap();
        let saved = DenoiSegConfig::load_json(dir.path().join("m").join("config.json")).unwrap();
        assert_eq!(saved, config);
        assert_eq!(model.logdir.as_deref(), Some(dir.path().join("m").as_path()));
    }
}
