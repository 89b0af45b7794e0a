//! Конфигурация модели DenoiSeg.
//!
//! Все гиперпараметры собраны в одной serde-структуре, которая сохраняется
//! в `<basedir>/<name>/config.json` рядом с моделью.

use crate::losses::N_CLASSES;
use crate::model::{ModelError, ModelResult};
use crate::nn::ActivationKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Гиперпараметры сети и обучения.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiSegConfig {
    /// Число пространственных осей
    pub n_dim: usize,
    /// Оси входа, например `YXC`
    pub axes: String,
    pub n_channel_in: usize,
    /// `n_channel_in` каналов шумоподавления + 3 класса сегментации
    pub n_channel_out: usize,
    pub unet_kern_size: usize,
    pub unet_n_depth: usize,
    pub unet_n_first: usize,
    pub unet_last_activation: ActivationKind,
    pub batch_norm: bool,
    /// Веса классов: фон, объект, граница
    pub relative_weights: Vec<f32>,
    /// Баланс между шумоподавлением и сегментацией
    pub denoiseg_alpha: f32,
    pub train_epochs: usize,
    pub train_steps_per_epoch: usize,
    pub train_batch_size: usize,
    pub train_learning_rate: f32,
    pub train_tensorboard: bool,
    /// Процент пикселей, маскируемых Noise2Void
    pub n2v_perc_pix: f32,
}

impl Default for DenoiSegConfig {
    fn default() -> Self {
        Self {
            n_dim: 2,
            axes: "YXC".to_string(),
            n_channel_in: 1,
            n_channel_out: 1 + N_CLASSES,
            unet_kern_size: 3,
            unet_n_depth: 4,
            unet_n_first: 32,
            unet_last_activation: ActivationKind::Linear,
            batch_norm: true,
            relative_weights: vec![1.0, 1.0, 5.0],
            denoiseg_alpha: 0.5,
            train_epochs: 200,
            train_steps_per_epoch: 100,
            train_batch_size: 128,
            train_learning_rate: 0.0004,
            train_tensorboard: false,
            n2v_perc_pix: 1.5,
        }
    }
}

impl DenoiSegConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Выводит размерность и число каналов из формы данных `(samples, [Z,] Y, X, C)`.
    pub fn from_data(shape: &[usize]) -> Self {
        let n_dim = shape.len().saturating_sub(2);
        let n_channel_in = shape.last().copied().unwrap_or(1);
        let axes = match n_dim {
            3 => "ZYXC",
            _ => "YXC",
        };
        Self {
            n_dim,
            axes: axes.to_string(),
            n_channel_in,
            n_channel_out: n_channel_in + N_CLASSES,
            ..Self::default()
        }
    }

    pub fn with_unet_kern_size(mut self, size: usize) -> Self {
        self.unet_kern_size = size;
        self
    }

    pub fn with_unet_n_depth(mut self, depth: usize) -> Self {
        self.unet_n_depth = depth;
        self
    }

    pub fn with_unet_n_first(mut self, n_first: usize) -> Self {
        self.unet_n_first = n_first;
        self
    }

    pub fn with_batch_norm(mut self, batch_norm: bool) -> Self {
        self.batch_norm = batch_norm;
        self
    }

    pub fn with_relative_weights(mut self, weights: Vec<f32>) -> Self {
        self.relative_weights = weights;
        self
    }

    pub fn with_denoiseg_alpha(mut self, alpha: f32) -> Self {
        self.denoiseg_alpha = alpha;
        self
    }

    pub fn with_train_epochs(mut self, epochs: usize) -> Self {
        self.train_epochs = epochs;
        self
    }

    pub fn with_train_steps_per_epoch(mut self, steps: usize) -> Self {
        self.train_steps_per_epoch = steps;
        self
    }

    pub fn with_train_batch_size(mut self, batch_size: usize) -> Self {
        self.train_batch_size = batch_size;
        self
    }

    pub fn with_train_learning_rate(mut self, lr: f32) -> Self {
        self.train_learning_rate = lr;
        self
    }

    /// Проверяет конфигурацию и перечисляет все некорректные поля.
    pub fn validate(&self) -> ModelResult<()> {
        let mut invalid = Vec::new();
        if self.n_dim != 2 {
            invalid.push("n_dim");
        }
        if self.axes.len() != self.n_dim + 1 {
            invalid.push("axes");
        }
        if self.n_channel_in == 0 {
            invalid.push("n_channel_in");
        }
        if self.n_channel_out != self.n_channel_in + N_CLASSES {
            invalid.push("n_channel_out");
        }
        if self.unet_kern_size == 0 || self.unet_kern_size % 2 == 0 {
            invalid.push("unet_kern_size");
        }
        if self.unet_n_depth == 0 {
            invalid.push("unet_n_depth");
        }
        if self.unet_n_first == 0 {
            invalid.push("unet_n_first");
        }
        if self.unet_last_activation == ActivationKind::Softmax {
            invalid.push("unet_last_activation");
        }
        if self.relative_weights.len() != N_CLASSES || self.relative_weights.iter().any(|&w| w <= 0.0) {
            invalid.push("relative_weights");
        }
        if !(0.0..=1.0).contains(&self.denoiseg_alpha) {
            invalid.push("denoiseg_alpha");
        }
        if self.train_epochs == 0 {
            invalid.push("train_epochs");
        }
        if self.train_steps_per_epoch == 0 {
            invalid.push("train_steps_per_epoch");
        }
        if self.train_batch_size == 0 {
            invalid.push("train_batch_size");
        }
        if self.train_learning_rate <= 0.0 {
            invalid.push("train_learning_rate");
        }
        if !(0.0..=100.0).contains(&self.n2v_perc_pix) {
            invalid.push("n2v_perc_pix");
        }

        if invalid.is_empty() {
            Ok(())
        } else {
            Err(ModelError::InvalidConfig(
                invalid.into_iter().map(str::to_string).collect(),
            ))
        }
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> ModelResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> ModelResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

/// Шагов за эпоху: `max(100, min(samples / batch_size, 400))`.
pub fn steps_per_epoch(samples: usize, batch_size: usize) -> usize {
    let batches = samples / batch_size.max(1);
    batches.min(400).max(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_data() {
        let config = DenoiSegConfig::from_data(&[10, 96, 96, 1]);
        assert_eq!(config.n_dim, 2);
        assert_eq!(config.axes, "YXC");
        assert_eq!(config.n_channel_in, 1);
        assert_eq!(config.n_channel_out, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_lists_every_invalid_field() {
        let config = DenoiSegConfig::new()
            .with_unet_kern_size(4)
            .with_relative_weights(vec![1.0, 1.0])
            .with_denoiseg_alpha(1.5);
        match config.validate() {
            Err(ModelError::InvalidConfig(fields)) => {
                assert_eq!(fields, vec!["unet_kern_size", "relative_weights", "denoiseg_alpha"]);
            }
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_steps_per_epoch_bounds() {
        assert_eq!(steps_per_epoch(10, 128), 100);
        assert_eq!(steps_per_epoch(128 * 250, 128), 250);
        assert_eq!(steps_per_epoch(128 * 1000, 128), 400);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DenoiSegConfig =
            serde_json::from_str(r#"{"unet_n_depth": 2, "unet_last_activation": "relu"}"#).unwrap();
        assert_eq!(config.unet_n_depth, 2);
        assert_eq!(config.unet_last_activation, ActivationKind::Relu);
        assert_eq!(config.unet_n_first, 32);
    }
}
