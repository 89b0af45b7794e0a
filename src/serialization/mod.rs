// --- Файл: src/serialization/mod.rs ---

//! Модуль для сериализации графа и значений переменных.
//!
//! Поддерживает несколько форматов:
//! - **GraphDef**: бинарное (`bincode`) описание графа обучения
//! - **Bundle**: каталог для обслуживания (граф + сигнатура + переменные)
//! - **SafeTensors**: значения переменных внутри пакета
//!
//! # Примеры
//!
//! ```rust,ignore
//! use denoiseg_graph::serialization::{read_graph_def, write_graph_def};
//!
//! write_graph_def("denoiseg_graph_2d.pb", &graph)?;
//! let loaded = read_graph_def("denoiseg_graph_2d.pb")?;
//! ```

pub mod bundle;
pub mod graph_def;
pub mod safetensors_io;
pub mod saver;
pub mod signature;

pub use bundle::{load_bundle, save_bundle, Bundle, MetaGraph};
pub use graph_def::{read_graph_def, write_graph_def, GraphDef};
pub use safetensors_io::{load_safetensors, save_safetensors, SafeTensorsError};
pub use saver::{Saver, SaverDef};
pub use signature::{build_tensor_info, SignatureDef, TensorInfo};

use crate::asg::AsgError;
use std::path::PathBuf;
use thiserror::Error;

/// Ошибки сериализации
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Ошибка ввода/вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ошибка кодирования: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Ошибка SafeTensors: {0}")]
    SafeTensors(#[from] SafeTensorsError),

    #[error(transparent)]
    Graph(#[from] AsgError),

    #[error("Каталог пакета уже существует: {0}. Удалите его перед повторным экспортом.")]
    BundleExists(PathBuf),

    #[error("Файл не найден: {0}")]
    MissingFile(PathBuf),
}

pub type Result<T> = std::result::Result<T, SerializationError>;
