//! Сигнатура обслуживания: логические роли -> тензоры графа.

use crate::asg::{Asg, AsgResult, DType, Dims};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SERVING_TAG: &str = "serve";
pub const DEFAULT_SERVING_SIGNATURE_KEY: &str = "serving_default";
pub const PREDICT_METHOD_NAME: &str = "tensorflow/serving/predict";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    pub dims: Dims,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureDef {
    pub method_name: String,
    pub inputs: BTreeMap<String, TensorInfo>,
    pub outputs: BTreeMap<String, TensorInfo>,
}

impl SignatureDef {
    /// Сигнатура предсказания; созданная однажды, не меняется.
    pub fn predict(
        inputs: impl IntoIterator<Item = (String, TensorInfo)>,
        outputs: impl IntoIterator<Item = (String, TensorInfo)>,
    ) -> Self {
        Self {
            method_name: PREDICT_METHOD_NAME.to_string(),
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
        }
    }

    /// Все роли сигнатуры: входы, затем выходы.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().chain(self.outputs.keys()).map(String::as_str)
    }
}

/// Описание тензора `<операция>:0`; отсутствующий тензор — ошибка.
pub fn build_tensor_info(graph: &Asg, tensor_name: &str) -> AsgResult<TensorInfo> {
    let id = graph.get_tensor_by_name(tensor_name)?;
    let node = graph.get_node(id)?;
    Ok(TensorInfo {
        name: tensor_name.to_string(),
        dtype: node.dtype,
        dims: node.dims.clone().unwrap_or_default(),
    })
}
