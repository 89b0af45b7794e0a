// --- Файл: src/serialization/safetensors_io.rs ---

//! Значения переменных в формате SafeTensors.
//!
//! Тензоры `f32` пишутся как `F32`, целочисленные скаляры (счётчик итераций
//! оптимизатора) как нульмерные `I64`. Имена тензоров совпадают с именами
//! узлов-переменных графа.

use crate::asg::Value;
use ndarray::{ArrayD, IxDyn};
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use safetensors::Dtype;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Ошибки при работе с SafeTensors
#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("Ошибка ввода/вывода: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Ошибка SafeTensors: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("Неподдерживаемый тип данных у '{name}': {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("Ошибка формы тензора: ожидалось {expected:?}, получено {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Байтовое представление одного значения.
fn encode(name: &str, value: &Value) -> Result<(Dtype, Vec<usize>, Vec<u8>)> {
    match value {
        Value::Tensor(arr) => Ok((
            Dtype::F32,
            arr.shape().to_vec(),
            arr.iter().flat_map(|&x| x.to_le_bytes()).collect(),
        )),
        Value::ScalarF32(x) => Ok((Dtype::F32, vec![], x.to_le_bytes().to_vec())),
        Value::ScalarI64(x) => Ok((Dtype::I64, vec![], x.to_le_bytes().to_vec())),
        other => Err(SafeTensorsError::UnsupportedDtype {
            name: name.to_string(),
            dtype: format!("{:?}", other),
        }),
    }
}

/// Сохраняет значения переменных в файл SafeTensors.
///
/// # Аргументы
///
/// * `path` - Путь к файлу для сохранения
/// * `tensors` - Имена переменных и их значения
pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &BTreeMap<String, Value>) -> Result<()> {
    // Сначала все данные в байты, затем представления, которые на них ссылаются
    let encoded = tensors
        .iter()
        .map(|(name, value)| encode(name, value).map(|e| (name.as_str(), e)))
        .collect::<Result<Vec<_>>>()?;

    let mut views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(encoded.len());
    for (name, (dtype, shape, data)) in &encoded {
        views.push((*name, TensorView::new(*dtype, shape.clone(), data)?));
    }

    serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

/// Загружает значения переменных из файла SafeTensors.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, Value>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut result = BTreeMap::new();
    for (name, tensor) in tensors.tensors() {
        let shape = tensor.shape().to_vec();
        let data = tensor.data();
        let value = match tensor.dtype() {
            Dtype::F32 => {
                let floats: Vec<f32> = data
                    .chunks_exact(4)
                    .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect();
                let floats_len = floats.len();
                let arr = ArrayD::from_shape_vec(IxDyn(&shape), floats).map_err(|_| {
                    SafeTensorsError::ShapeMismatch {
                        expected: shape.clone(),
                        actual: vec![floats_len],
                    }
                })?;
                Value::Tensor(arr)
            }
            Dtype::I64 if shape.is_empty() && data.len() == 8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(data);
                Value::ScalarI64(i64::from_le_bytes(bytes))
            }
            other => {
                return Err(SafeTensorsError::UnsupportedDtype {
                    name,
                    dtype: format!("{:?}", other),
                })
            }
        };
        result.insert(name, value);
    }

    Ok(result)
}

/// Возвращает список имен тензоров в файле SafeTensors.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = tensors.names().iter().map(|s| s.to_string()).collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_variables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.safetensors");

        let mut values = BTreeMap::new();
        values.insert(
            "conv2d/kernel".to_string(),
            Value::Tensor(
                ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
                    .unwrap(),
            ),
        );
        values.insert("Adam/iterations".to_string(), Value::ScalarI64(7));
        values.insert(
            "Adam/lr".to_string(),
            Value::Tensor(ArrayD::from_elem(IxDyn(&[]), 4e-4)),
        );

        save_safetensors(&path, &values).unwrap();
        let loaded = load_safetensors(&path).unwrap();
        assert_eq!(loaded, values);
        assert_eq!(
            list_tensors(&path).unwrap(),
            vec!["Adam/iterations", "Adam/lr", "conv2d/kernel"]
        );
    }

    #[test]
    fn test_text_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), Value::Text("model".to_string()));
        let err = save_safetensors(dir.path().join("x.safetensors"), &values).unwrap_err();
        assert!(matches!(err, SafeTensorsError::UnsupportedDtype { .. }));
    }
}
