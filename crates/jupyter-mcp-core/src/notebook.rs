//! nbformat 4.5 documents as the backends exchange them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::output::{multiline, CellOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl CellType {
    pub fn as_str(self) -> &'static str {
        match self {
            CellType::Code => "code",
            CellType::Markdown => "markdown",
            CellType::Raw => "raw",
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "code" => Ok(CellType::Code),
            "markdown" => Ok(CellType::Markdown),
            "raw" => Ok(CellType::Raw),
            other => Err(Error::validation(format!(
                "invalid cell type '{other}', expected code, markdown or raw"
            ))),
        }
    }
}

fn new_cell_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "lowercase")]
pub enum Cell {
    Code {
        #[serde(default = "new_cell_id")]
        id: String,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default)]
        execution_count: Option<i64>,
        #[serde(deserialize_with = "multiline")]
        source: String,
        #[serde(default)]
        outputs: Vec<CellOutput>,
    },
    Markdown {
        #[serde(default = "new_cell_id")]
        id: String,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(deserialize_with = "multiline")]
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<Value>,
    },
    Raw {
        #[serde(default = "new_cell_id")]
        id: String,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(deserialize_with = "multiline")]
        source: String,
    },
}

impl Cell {
    pub fn new(cell_type: CellType, source: impl Into<String>) -> Self {
        let (id, metadata, source) = (new_cell_id(), Map::new(), source.into());
        match cell_type {
            CellType::Code => Cell::Code {
                id,
                metadata,
                execution_count: None,
                source,
                outputs: Vec::new(),
            },
            CellType::Markdown => Cell::Markdown {
                id,
                metadata,
                source,
                attachments: None,
            },
            CellType::Raw => Cell::Raw { id, metadata, source },
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Cell::Code { id, .. } | Cell::Markdown { id, .. } | Cell::Raw { id, .. } => id,
        }
    }

    pub fn cell_type(&self) -> CellType {
        match self {
            Cell::Code { .. } => CellType::Code,
            Cell::Markdown { .. } => CellType::Markdown,
            Cell::Raw { .. } => CellType::Raw,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Cell::Code { source, .. } | Cell::Markdown { source, .. } | Cell::Raw { source, .. } => {
                source
            }
        }
    }

    pub fn set_source(&mut self, new_source: impl Into<String>) {
        match self {
            Cell::Code { source, .. } | Cell::Markdown { source, .. } | Cell::Raw { source, .. } => {
                *source = new_source.into()
            }
        }
    }

    pub fn execution_count(&self) -> Option<i64> {
        match self {
            Cell::Code { execution_count, .. } => *execution_count,
            _ => None,
        }
    }

    pub fn outputs(&self) -> &[CellOutput] {
        match self {
            Cell::Code { outputs, .. } => outputs,
            _ => &[],
        }
    }

    /// Replaces outputs and execution count together; a no-op for
    /// non-code cells.
    pub fn set_outputs(&mut self, new_outputs: Vec<CellOutput>, count: Option<i64>) {
        if let Cell::Code {
            outputs,
            execution_count,
            ..
        } = self
        {
            *outputs = new_outputs;
            *execution_count = count;
        }
    }

    pub fn first_line(&self) -> &str {
        self.source().lines().next().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub nbformat: i32,
    pub nbformat_minor: i32,
}

impl Default for Notebook {
    fn default() -> Self {
        Self {
            cells: Vec::new(),
            metadata: Map::new(),
            nbformat: 4,
            nbformat_minor: 5,
        }
    }
}

impl Notebook {
    pub fn from_value(value: Value) -> Result<Self> {
        let nbformat = value.get("nbformat").and_then(Value::as_i64).unwrap_or(0);
        if nbformat != 4 {
            return Err(Error::Protocol(format!(
                "unsupported notebook format version {nbformat}"
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// On-disk form: one-space indent and a trailing newline, as nbformat
    /// writes it.
    pub fn to_pretty_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        buf.push(b'\n');
        String::from_utf8(buf).map_err(|e| Error::Protocol(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell(&self, index: usize) -> Result<&Cell> {
        let len = self.cells.len();
        self.cells.get(index).ok_or_else(|| out_of_range(index as i64, len))
    }

    pub fn cell_mut(&mut self, index: usize) -> Result<&mut Cell> {
        let len = self.cells.len();
        self.cells.get_mut(index).ok_or_else(|| out_of_range(index as i64, len))
    }

    /// Counts per cell type, in code/markdown/raw order.
    pub fn type_counts(&self) -> [(CellType, usize); 3] {
        let count = |t| self.cells.iter().filter(|c| c.cell_type() == t).count();
        [
            (CellType::Code, count(CellType::Code)),
            (CellType::Markdown, count(CellType::Markdown)),
            (CellType::Raw, count(CellType::Raw)),
        ]
    }
}

pub fn out_of_range(index: i64, len: usize) -> Error {
    Error::validation(format!(
        "Cell index {index} is out of range. Notebook has {len} cells."
    ))
}

/// Position for an insert: `-1` appends, anything else must lie in `0..=len`.
pub fn insert_position(index: i64, len: usize) -> Result<usize> {
    match index {
        -1 => Ok(len),
        i if i >= 0 && (i as usize) <= len => Ok(i as usize),
        i => Err(out_of_range(i, len)),
    }
}

/// Position of an existing cell.
pub fn cell_position(index: i64, len: usize) -> Result<usize> {
    match index {
        i if i >= 0 && (i as usize) < len => Ok(i as usize),
        i => Err(out_of_range(i, len)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "cells": [
                {"cell_type": "markdown", "id": "m1", "metadata": {}, "source": ["# Title\n", "intro"]},
                {"cell_type": "code", "id": "c1", "metadata": {}, "execution_count": 3,
                 "source": "x = 1\nx", "outputs": [
                    {"output_type": "execute_result", "execution_count": 3,
                     "data": {"text/plain": "1"}, "metadata": {}}
                 ]},
                {"cell_type": "raw", "metadata": {}, "source": ""}
            ],
            "metadata": {"kernelspec": {"name": "python3"}},
            "nbformat": 4,
            "nbformat_minor": 5
        })
    }

    #[test]
    fn test_parse_nbformat4() {
        let nb = Notebook::from_value(sample()).unwrap();
        assert_eq!(nb.len(), 3);
        assert_eq!(nb.cells[0].source(), "# Title\nintro");
        assert_eq!(nb.cells[0].first_line(), "# Title");
        assert_eq!(nb.cells[1].execution_count(), Some(3));
        assert_eq!(nb.cells[1].outputs().len(), 1);
        assert!(!nb.cells[2].id().is_empty());
        assert_eq!(nb.type_counts()[0], (CellType::Code, 1));
    }

    #[test]
    fn test_rejects_other_major_versions() {
        let err = Notebook::from_value(json!({"cells": [], "nbformat": 3, "nbformat_minor": 0}))
            .unwrap_err();
        assert!(err.to_string().contains("version 3"));
    }

    #[test]
    fn test_code_cells_serialize_outputs_and_count() {
        let cell = Cell::new(CellType::Code, "print(1)");
        let value = serde_json::to_value(&cell).unwrap();
        assert_eq!(value["cell_type"], "code");
        assert_eq!(value["execution_count"], Value::Null);
        assert_eq!(value["outputs"], json!([]));

        let md = serde_json::to_value(Cell::new(CellType::Markdown, "hi")).unwrap();
        assert!(md.get("outputs").is_none());
    }

    #[test]
    fn test_pretty_string_matches_nbformat_layout() {
        let text = Notebook::default().to_pretty_string().unwrap();
        assert!(text.starts_with("{\n \"cells\": []"));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn test_positions() {
        assert_eq!(insert_position(-1, 3).unwrap(), 3);
        assert_eq!(insert_position(3, 3).unwrap(), 3);
        assert_eq!(
            insert_position(5, 3).unwrap_err().to_string(),
            "Cell index 5 is out of range. Notebook has 3 cells."
        );
        assert!(insert_position(-2, 3).is_err());
        assert!(cell_position(3, 3).is_err());
        assert_eq!(cell_position(0, 3).unwrap(), 0);
    }

    #[test]
    fn test_cell_type_parse() {
        assert_eq!("markdown".parse::<CellType>().unwrap(), CellType::Markdown);
        assert!("sql".parse::<CellType>().is_err());
    }
}
