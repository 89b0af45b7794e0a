// --- Файл: src/serialization/bundle.rs ---

//! Пакет для обслуживания: каталог с графом, значениями переменных и сигнатурой.
//!
//! Структура каталога:
//! ```text
//! <dir>/
//! ├── saved_model.pb                  # MetaGraph (bincode)
//! └── variables/
//!     └── variables.safetensors       # значения переменных
//! ```
//!
//! Пакет пишется один раз: существующий каталог не перезаписывается.

use super::graph_def::GraphDef;
use super::safetensors_io::{load_safetensors, save_safetensors};
use super::saver::SaverDef;
use super::signature::SignatureDef;
use super::{Result, SerializationError};
use crate::asg::Value;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const SAVED_MODEL_FILENAME: &str = "saved_model.pb";
pub const VARIABLES_DIRECTORY: &str = "variables";
pub const VARIABLES_FILENAME: &str = "variables.safetensors";

/// Метаданные пакета.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaGraph {
    pub tags: Vec<String>,
    pub graph_def: GraphDef,
    pub signature_def_map: BTreeMap<String, SignatureDef>,
    pub saver_def: Option<SaverDef>,
}

/// Загруженный пакет.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub meta_graph: MetaGraph,
    pub variables: BTreeMap<String, Value>,
}

/// Записывает пакет в `dir`.
///
/// Если каталог уже существует, возвращает `SerializationError::BundleExists`
/// и не трогает его содержимое. Файлы сначала пишутся в соседний каталог
/// `.<имя>.partial`, который переименовывается в `dir` только целиком; при
/// ошибке записи `dir` не появляется.
pub fn save_bundle<P: AsRef<Path>>(
    dir: P,
    meta_graph: &MetaGraph,
    variables: &BTreeMap<String, Value>,
) -> Result<()> {
    let dir = dir.as_ref();
    if dir.exists() {
        return Err(SerializationError::BundleExists(dir.to_path_buf()));
    }
    let staging = staging_dir(dir)?;
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent)?;
    }
    // остаток прерванного запуска
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir(&staging)?;

    if let Err(e) = write_contents(&staging, meta_graph, variables) {
        discard(&staging);
        return Err(e);
    }
    if let Err(e) = fs::rename(&staging, dir) {
        discard(&staging);
        return Err(if dir.exists() {
            SerializationError::BundleExists(dir.to_path_buf())
        } else {
            SerializationError::Io(e)
        });
    }

    info!(
        "пакет сохранён в {}: {} узлов, {} переменных",
        dir.display(),
        meta_graph.graph_def.nodes.len(),
        variables.len()
    );
    Ok(())
}

/// `<родитель>/.<имя>.partial`
fn staging_dir(dir: &Path) -> Result<PathBuf> {
    let name = dir.file_name().ok_or_else(|| {
        SerializationError::Io(io::Error::new(
            ErrorKind::InvalidInput,
            format!("у пути пакета нет имени: {}", dir.display()),
        ))
    })?;
    Ok(dir.with_file_name(format!(".{}.partial", name.to_string_lossy())))
}

fn write_contents(
    dir: &Path,
    meta_graph: &MetaGraph,
    variables: &BTreeMap<String, Value>,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(dir.join(SAVED_MODEL_FILENAME))?);
    bincode::serialize_into(&mut writer, meta_graph)?;
    writer.flush()?;

    let variables_dir = dir.join(VARIABLES_DIRECTORY);
    fs::create_dir(&variables_dir)?;
    save_safetensors(variables_dir.join(VARIABLES_FILENAME), variables)?;
    Ok(())
}

fn discard(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging) {
        warn!("не удалось удалить {}: {}", staging.display(), e);
    }
}

pub fn load_bundle<P: AsRef<Path>>(dir: P) -> Result<Bundle> {
    let dir = dir.as_ref();
    let meta_path = dir.join(SAVED_MODEL_FILENAME);
    let variables_path = dir.join(VARIABLES_DIRECTORY).join(VARIABLES_FILENAME);
    for path in [&meta_path, &variables_path] {
        if !path.exists() {
            return Err(SerializationError::MissingFile(path.clone()));
        }
    }

    let reader = BufReader::new(File::open(&meta_path)?);
    let meta_graph: MetaGraph = bincode::deserialize_from(reader)?;
    let variables = load_safetensors(&variables_path)?;
    Ok(Bundle {
        meta_graph,
        variables,
    })
}
