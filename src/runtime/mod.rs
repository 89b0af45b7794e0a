//! Исполнительная среда для ASG.
//!
//! Здесь живёт только `Session`: она инициализирует переменные графа и
//! хранит их значения. Полное выполнение графа (прямой проход, градиенты)
//! остаётся за средой, которая загрузит экспортированные артефакты.

pub mod session;

pub use session::Session;

use crate::asg::AsgError;
use thiserror::Error;

/// Ошибки, которые могут возникнуть во время выполнения графа в сессии.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error(transparent)]
    Graph(#[from] AsgError),

    #[error("Переменная '{0}' не инициализирована. Запустите инициализаторы перед чтением значений.")]
    Uninitialized(String),

    #[error("Отсутствует значение для входа '{0}'. Сессия не принимает входных данных.")]
    MissingFeed(String),

    #[error("Операция '{0}' не реализована в сессии.")]
    UnimplementedOperation(String),

    #[error("Ошибка формы тензора: {0}")]
    ShapeError(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
