//! Подграф сохранения/восстановления переменных (`save/...`).
//!
//! Граф получает узлы, через которые внешняя среда может записать и прочитать
//! чекпоинт глобальных переменных:
//!
//! - `save/Const` — имя файла чекпоинта
//! - `save/SaveV2` и `save/control_dependency` — запись
//! - `save/RestoreV2` и `save/restore_all` — восстановление

use crate::asg::{AsgResult, DType, NodeType, Value, VariableCollection};
use crate::tensor::{name_scope, GraphContext, Operation, Tensor};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// Имена узлов подграфа сохранения, записываемые в метаданные пакета.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaverDef {
    pub filename_tensor_name: String,
    pub save_tensor_name: String,
    pub restore_op_name: String,
    pub version: u32,
}

pub struct Saver;

impl Saver {
    /// Добавляет подграф сохранения для всех глобальных переменных контекста.
    pub fn build(context: &Rc<RefCell<GraphContext>>) -> AsgResult<SaverDef> {
        let scope = context.borrow_mut().reserve_name("save");
        let variables = context.borrow().graph().variables(VariableCollection::Global);

        name_scope(context, &scope, || -> AsgResult<SaverDef> {
            let filename =
                Tensor::constant(context, "Const", Value::Text("model".to_string()));

            let mut ctx = context.borrow_mut();
            let save = ctx.add_unique(
                "SaveV2",
                NodeType::SaveV2 {
                    filename: filename.node_id,
                    variables: variables.clone(),
                },
                None,
                DType::String,
            );
            let control = ctx.add_unique(
                "control_dependency",
                NodeType::Identity(filename.node_id),
                Some(vec![]),
                DType::String,
            );
            ctx.graph_mut().add_control_input(control, save)?;
            let restore = ctx.add_unique(
                "RestoreV2",
                NodeType::RestoreV2 {
                    filename: filename.node_id,
                    variables,
                },
                None,
                DType::String,
            );
            drop(ctx);
            let restore_all = Operation::group(context, "restore_all", vec![restore]);

            let graph = context.borrow();
            Ok(SaverDef {
                filename_tensor_name: filename.name(),
                save_tensor_name: graph.graph().tensor_name(control)?,
                restore_op_name: restore_all.name(),
                version: 2,
            })
        })
    }
}
