//! Бинарное описание графа (`GraphDef`), записываемое через `bincode`.
//!
//! Файл содержит все узлы в порядке их ID: псевдонимы, переменные и
//! инициализаторы, но не значения переменных.

use super::Result;
use crate::asg::{Asg, AsgResult, Node};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    pub nodes: Vec<Node>,
}

impl GraphDef {
    pub fn from_graph(graph: &Asg) -> Self {
        Self {
            nodes: graph.nodes().to_vec(),
        }
    }

    /// Восстанавливает граф, заново проверяя имена и входы каждого узла.
    pub fn into_graph(self) -> AsgResult<Asg> {
        let mut graph = Asg::new();
        for node in self.nodes {
            graph.insert_node(node)?;
        }
        Ok(graph)
    }
}

pub fn write_graph_def<P: AsRef<Path>>(path: P, graph: &Asg) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, &GraphDef::from_graph(graph))?;
    writer.flush()?;
    Ok(())
}

pub fn read_graph_def<P: AsRef<Path>>(path: P) -> Result<Asg> {
    let reader = BufReader::new(File::open(path)?);
    let graph_def: GraphDef = bincode::deserialize_from(reader)?;
    Ok(graph_def.into_graph()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::{AsgError, DType, Initializer};
    use crate::tensor::{GraphContext, Operation, Tensor, Variable};

    #[test]
    fn test_graph_def_preserves_names_and_structure() {
        let ctx = GraphContext::shared();
        let x = Tensor::placeholder(&ctx, "input", vec![None, Some(4)], DType::F32);
        let w = Variable::weight(&ctx, "w", &[4], Initializer::GlorotUniform);
        let y = &x * &w.read;
        y.identity_named("output").unwrap();
        Operation::group_named(&ctx, "init", vec![w.initializer.node_id]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.pb");
        let graph = ctx.borrow().graph().clone();
        write_graph_def(&path, &graph).unwrap();

        let loaded = read_graph_def(&path).unwrap();
        assert_eq!(loaded, graph);
        assert!(loaded.get_tensor_by_name("output:0").is_ok());
        assert!(loaded.get_operation_by_name("init").is_ok());
    }

    #[test]
    fn test_duplicate_names_are_rejected_on_load() {
        let mut graph = Asg::new();
        graph
            .add_node("x", crate::asg::NodeType::Placeholder, None, DType::F32)
            .unwrap();
        let mut graph_def = GraphDef::from_graph(&graph);
        let mut twin = graph_def.nodes[0].clone();
        twin.id = 1;
        graph_def.nodes.push(twin);
        assert_eq!(
            graph_def.into_graph().unwrap_err(),
            AsgError::NameAlreadyExists("x".to_string())
        );
    }
}
