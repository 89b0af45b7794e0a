//! Port collections read from a built model.

use super::contract::INPUT;
use super::{ExportError, ExportResult};
use crate::model::ModelHandle;
use log::info;

/// Tensor names of every port the exporter needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PortCollections {
    pub inputs: Vec<String>,
    /// `(logical output name, tensor name)`
    pub outputs: Vec<(String, String)>,
    pub metrics_names: Vec<String>,
    pub total_loss: String,
    pub metrics_tensors: Vec<String>,
    pub targets: Vec<String>,
    /// Tensor name of the optimizer's learning-rate variable.
    pub learning_rate: String,
}

impl PortCollections {
    /// Reads the port collections of `model`.
    ///
    /// Fails with `MissingPort` when the model was never prepared for training,
    /// since the loss, metrics and optimizer ports do not exist yet.
    pub fn resolve<M: ModelHandle + ?Sized>(model: &M) -> ExportResult<Self> {
        let total_loss = model
            .total_loss()
            .ok_or(ExportError::MissingPort("total_loss"))?;
        let learning_rate = model
            .learning_rate()
            .ok_or(ExportError::MissingPort("learning_rate"))?;
        let metrics_names = model.metrics_names();
        if metrics_names.is_empty() {
            return Err(ExportError::MissingPort("metrics_names"));
        }
        let targets = model.targets();
        if targets.is_empty() {
            return Err(ExportError::MissingPort("targets"));
        }
        let output_names = model.output_names();
        let outputs = model.outputs();
        if output_names.len() != outputs.len() {
            return Err(ExportError::MissingPort("outputs"));
        }

        let inputs: Vec<String> = model.inputs().iter().map(|t| t.name()).collect();
        if !inputs.iter().any(|name| *name == format!("{}:0", INPUT)) {
            return Err(ExportError::MissingPort("input"));
        }

        let ports = Self {
            inputs,
            outputs: output_names
                .into_iter()
                .zip(outputs.iter().map(|t| t.name()))
                .collect(),
            metrics_names,
            total_loss: total_loss.name(),
            metrics_tensors: model.metrics_tensors().iter().map(|t| t.name()).collect(),
            targets: targets.iter().map(|t| t.name()).collect(),
            learning_rate: learning_rate.name(),
        };
        ports.log();
        Ok(ports)
    }

    fn log(&self) {
        info!("inputs:");
        for name in &self.inputs {
            info!("  {}", name);
        }
        info!("outputs:");
        for (name, tensor) in &self.outputs {
            info!("  {} ({})", name, tensor);
        }
        info!("losses: {:?}", self.metrics_names);
        info!("  total: {}", self.total_loss);
        for tensor in &self.metrics_tensors {
            info!("  {}", tensor);
        }
        info!("targets: {:?}", self.targets);
        info!("learning rate: {}", self.learning_rate);
    }
}
