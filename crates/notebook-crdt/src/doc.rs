use std::collections::HashMap;

use serde_json::{json, Map as JsonMap, Value};
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn,
    StateVector, Text, TextPrelim, Transact, TransactionMut, Update, WriteTxn,
};

use crate::convert::{any_to_json, json_to_any, out_to_json, source_text};
use crate::error::{DocError, Result};

/// Shared-type keys of the jupyter_ydoc notebook schema.
pub mod keys {
    pub const CELLS: &str = "cells";
    pub const METADATA: &str = "metadata";

    pub const ID: &str = "id";
    pub const CELL_TYPE: &str = "cell_type";
    pub const SOURCE: &str = "source";
    pub const CELL_METADATA: &str = "metadata";
    pub const OUTPUTS: &str = "outputs";
    pub const EXECUTION_COUNT: &str = "execution_count";
    pub const ATTACHMENTS: &str = "attachments";
}

pub mod cell_types {
    pub const CODE: &str = "code";
    pub const MARKDOWN: &str = "markdown";
    pub const RAW: &str = "raw";
}

/// A notebook held as a Y.Doc, laid out the way JupyterLab expects:
///
/// ```text
/// cells: Y.Array<Y.Map {
///     id, cell_type,
///     source: Y.Text,
///     metadata: Y.Map,
///     outputs: Y.Array,          code cells only
///     execution_count,           code cells only
/// }>
/// metadata: Y.Map
/// ```
///
/// Every mutating method runs in a single transaction, so peers observe each
/// edit as one update.
#[derive(Debug)]
pub struct NotebookDoc {
    doc: Doc,
}

fn index_error(index: u32, len: u32) -> DocError {
    DocError::IndexOutOfRange { index, len }
}

impl NotebookDoc {
    pub fn new() -> Self {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.get_or_insert_array(keys::CELLS);
            txn.get_or_insert_map(keys::METADATA);
        }
        Self { doc }
    }

    /// Builds a document from nbformat v4 JSON.
    pub fn from_notebook_json(notebook: &Value) -> Result<Self> {
        let nb = Self::new();
        {
            let mut txn = nb.doc.transact_mut();
            let metadata = txn.get_or_insert_map(keys::METADATA);
            if let Some(Value::Object(entries)) = notebook.get("metadata") {
                for (key, value) in entries {
                    metadata.insert(&mut txn, key.as_str(), json_to_any(value));
                }
            }
        }
        let cells = notebook
            .get("cells")
            .and_then(Value::as_array)
            .ok_or_else(|| DocError::MissingField("cells".into()))?;
        for cell in cells {
            nb.insert_cell(None, cell)?;
        }
        Ok(nb)
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    fn cells<T: ReadTxn>(&self, txn: &T) -> Result<ArrayRef> {
        txn.get_array(keys::CELLS)
            .ok_or_else(|| DocError::MissingField(keys::CELLS.into()))
    }

    fn cell_map<T: ReadTxn>(&self, txn: &T, index: u32) -> Result<MapRef> {
        let cells = self.cells(txn)?;
        let len = cells.len(txn);
        match cells.get(txn, index) {
            Some(Out::YMap(map)) => Ok(map),
            Some(_) => Err(DocError::Conversion(format!("cell {index} is not a map"))),
            None => Err(index_error(index, len)),
        }
    }

    pub fn cell_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.cells(&txn).map(|cells| cells.len(&txn)).unwrap_or(0)
    }

    /// Inserts an nbformat cell (JSON) at `index`, or appends when `None`.
    /// Returns the index it landed at.
    pub fn insert_cell(&self, index: Option<u32>, cell: &Value) -> Result<u32> {
        let cell_type = cell
            .get(keys::CELL_TYPE)
            .and_then(Value::as_str)
            .ok_or_else(|| DocError::MissingField(keys::CELL_TYPE.into()))?;
        if ![cell_types::CODE, cell_types::MARKDOWN, cell_types::RAW].contains(&cell_type) {
            return Err(DocError::InvalidCellType(cell_type.to_string()));
        }
        let is_code = cell_type == cell_types::CODE;

        let mut txn = self.doc.transact_mut();
        let cells = self.cells(&txn)?;
        let len = cells.len(&txn);
        let at = index.unwrap_or(len);
        if at > len {
            return Err(index_error(at, len));
        }

        let mut scalars: HashMap<String, Any> = HashMap::new();
        let id = cell
            .get(keys::ID)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("cell-{}-{at}", self.doc.client_id()));
        scalars.insert(keys::ID.into(), Any::String(id.into()));
        scalars.insert(keys::CELL_TYPE.into(), Any::String(cell_type.into()));
        if is_code {
            let count = cell.get(keys::EXECUTION_COUNT).unwrap_or(&Value::Null);
            scalars.insert(keys::EXECUTION_COUNT.into(), json_to_any(count));
        }
        if let Some(attachments) = cell.get(keys::ATTACHMENTS) {
            scalars.insert(keys::ATTACHMENTS.into(), json_to_any(attachments));
        }
        cells.insert(&mut txn, at, MapPrelim::from_iter(scalars));

        let Some(Out::YMap(cell_map)) = cells.get(&txn, at) else {
            return Err(DocError::Conversion(format!("cell {at} vanished during insert")));
        };

        let source = source_text(cell.get(keys::SOURCE));
        cell_map.insert(&mut txn, keys::SOURCE, TextPrelim::new(source.as_str()));

        let metadata: HashMap<String, Any> = match cell.get(keys::CELL_METADATA) {
            Some(Value::Object(entries)) => entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect(),
            _ => HashMap::new(),
        };
        cell_map.insert(&mut txn, keys::CELL_METADATA, MapPrelim::from_iter(metadata));

        if is_code {
            cell_map.insert(&mut txn, keys::OUTPUTS, ArrayPrelim::default());
            let outputs = cell.get(keys::OUTPUTS).and_then(Value::as_array);
            if let (Some(outputs), Some(Out::YArray(array))) = (outputs, cell_map.get(&txn, keys::OUTPUTS)) {
                for output in outputs {
                    array.push_back(&mut txn, json_to_any(output));
                }
            }
        }

        Ok(at)
    }

    /// Convenience over [`insert_cell`](Self::insert_cell) for a fresh cell.
    pub fn add_cell(&self, id: &str, cell_type: &str, source: &str, index: Option<u32>) -> Result<u32> {
        let mut cell = json!({
            "id": id,
            "cell_type": cell_type,
            "source": source,
            "metadata": {},
        });
        if cell_type == cell_types::CODE {
            cell["outputs"] = json!([]);
            cell["execution_count"] = Value::Null;
        }
        self.insert_cell(index, &cell)
    }

    pub fn cell_source(&self, index: u32) -> Result<String> {
        let txn = self.doc.transact();
        let cell = self.cell_map(&txn, index)?;
        match cell.get(&txn, keys::SOURCE) {
            Some(Out::YText(text)) => Ok(text.get_string(&txn)),
            Some(Out::Any(Any::String(s))) => Ok(s.to_string()),
            _ => Err(DocError::MissingField(keys::SOURCE.into())),
        }
    }

    /// Replaces the whole source of a cell.
    pub fn set_cell_source(&self, index: u32, source: &str) -> Result<()> {
        let mut txn = self.doc.transact_mut();
        let cell = self.cell_map(&txn, index)?;
        match cell.get(&txn, keys::SOURCE) {
            Some(Out::YText(text)) => {
                let len = text.len(&txn);
                if len > 0 {
                    text.remove_range(&mut txn, 0, len);
                }
                text.insert(&mut txn, 0, source);
            }
            _ => {
                cell.insert(&mut txn, keys::SOURCE, TextPrelim::new(source));
            }
        }
        Ok(())
    }

    /// Removes a cell and returns what it held.
    pub fn remove_cell(&self, index: u32) -> Result<Value> {
        let mut txn = self.doc.transact_mut();
        let cell = self.cell_map(&txn, index)?;
        let removed = cell_to_json(&cell, &txn);
        self.cells(&txn)?.remove(&mut txn, index);
        Ok(removed)
    }

    /// Swaps a code cell's outputs and execution count in one transaction.
    pub fn replace_outputs(&self, index: u32, outputs: &[Value], execution_count: Option<i64>) -> Result<()> {
        let mut txn = self.doc.transact_mut();
        let cell = self.cell_map(&txn, index)?;
        let array = match cell.get(&txn, keys::OUTPUTS) {
            Some(Out::YArray(array)) => array,
            Some(_) => return Err(DocError::Conversion("outputs is not an array".into())),
            None => return Err(DocError::InvalidCellType(cell_type_of(&cell, &txn))),
        };
        Self::fill_outputs(&mut txn, &array, outputs);
        let count = execution_count.map(Any::BigInt).unwrap_or(Any::Null);
        cell.insert(&mut txn, keys::EXECUTION_COUNT, count);
        Ok(())
    }

    fn fill_outputs(txn: &mut TransactionMut, array: &ArrayRef, outputs: &[Value]) {
        let len = array.len(&*txn);
        if len > 0 {
            array.remove_range(txn, 0, len);
        }
        for output in outputs {
            array.push_back(txn, json_to_any(output));
        }
    }

    pub fn cell_json(&self, index: u32) -> Result<Value> {
        let txn = self.doc.transact();
        let cell = self.cell_map(&txn, index)?;
        Ok(cell_to_json(&cell, &txn))
    }

    /// The whole document as nbformat v4 JSON.
    pub fn to_json(&self) -> Value {
        let txn = self.doc.transact();
        let cells: Vec<Value> = match self.cells(&txn) {
            Ok(cells) => cells
                .iter(&txn)
                .filter_map(|value| match value {
                    Out::YMap(map) => Some(cell_to_json(&map, &txn)),
                    _ => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        let metadata = txn
            .get_map(keys::METADATA)
            .map(|map| any_to_json(&map.to_json(&txn)))
            .unwrap_or_else(|| Value::Object(JsonMap::new()));
        json!({
            "cells": cells,
            "metadata": metadata,
            "nbformat": 4,
            "nbformat_minor": 5,
        })
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.encode_diff(&StateVector::default())
    }

    /// Everything a peer at `since` is missing.
    pub fn encode_diff(&self, since: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(since)
    }

    /// Integrates a peer's update. An update that cannot be decoded or
    /// integrated leaves this replica diverged from the room.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let update = Update::decode_v1(update).map_err(|e| DocError::Desync(e.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| DocError::Desync(e.to_string()))
    }
}

impl Default for NotebookDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn cell_type_of<T: ReadTxn>(cell: &MapRef, txn: &T) -> String {
    match cell.get(txn, keys::CELL_TYPE) {
        Some(Out::Any(Any::String(s))) => s.to_string(),
        _ => "unknown".to_string(),
    }
}

fn cell_to_json<T: ReadTxn>(cell: &MapRef, txn: &T) -> Value {
    let cell_type = cell_type_of(cell, txn);
    let mut out = JsonMap::new();
    if let Some(id) = cell.get(txn, keys::ID) {
        out.insert(keys::ID.into(), out_to_json(&id, txn));
    }
    out.insert(keys::CELL_TYPE.into(), Value::String(cell_type.clone()));
    let source = cell
        .get(txn, keys::SOURCE)
        .map(|s| out_to_json(&s, txn))
        .unwrap_or_else(|| Value::String(String::new()));
    out.insert(keys::SOURCE.into(), source);
    let metadata = cell
        .get(txn, keys::CELL_METADATA)
        .map(|m| out_to_json(&m, txn))
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(JsonMap::new()));
    out.insert(keys::CELL_METADATA.into(), metadata);

    if cell_type == cell_types::CODE {
        let outputs = cell
            .get(txn, keys::OUTPUTS)
            .map(|o| out_to_json(&o, txn))
            .filter(Value::is_array)
            .unwrap_or_else(|| Value::Array(Vec::new()));
        out.insert(keys::OUTPUTS.into(), outputs);
        let count = match cell.get(txn, keys::EXECUTION_COUNT) {
            Some(Out::Any(Any::BigInt(n))) => json!(n),
            Some(Out::Any(Any::Number(n))) => json!(n as i64),
            _ => Value::Null,
        };
        out.insert(keys::EXECUTION_COUNT.into(), count);
    } else if let Some(attachments) = cell.get(txn, keys::ATTACHMENTS) {
        out.insert(keys::ATTACHMENTS.into(), out_to_json(&attachments, txn));
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_doc_is_empty() {
        let doc = NotebookDoc::new();
        assert_eq!(doc.cell_count(), 0);
        assert_eq!(doc.to_json()["cells"], json!([]));
    }

    #[test]
    fn test_add_and_read_cells() {
        let doc = NotebookDoc::new();
        doc.add_cell("a", cell_types::CODE, "print('hi')", None).unwrap();
        doc.add_cell("b", cell_types::MARKDOWN, "# Title", Some(0)).unwrap();

        assert_eq!(doc.cell_count(), 2);
        assert_eq!(doc.cell_source(0).unwrap(), "# Title");
        assert_eq!(doc.cell_source(1).unwrap(), "print('hi')");

        let code = doc.cell_json(1).unwrap();
        assert_eq!(code["cell_type"], "code");
        assert_eq!(code["outputs"], json!([]));
        assert_eq!(code["execution_count"], Value::Null);

        let markdown = doc.cell_json(0).unwrap();
        assert!(markdown.get("outputs").is_none());
    }

    #[test]
    fn test_insert_past_end_fails() {
        let doc = NotebookDoc::new();
        let err = doc.add_cell("a", cell_types::CODE, "", Some(3)).unwrap_err();
        assert!(matches!(err, DocError::IndexOutOfRange { index: 3, len: 0 }));
    }

    #[test]
    fn test_unknown_cell_type_rejected() {
        let doc = NotebookDoc::new();
        let err = doc
            .insert_cell(None, &json!({"cell_type": "sql", "source": ""}))
            .unwrap_err();
        assert!(matches!(err, DocError::InvalidCellType(t) if t == "sql"));
    }

    #[test]
    fn test_set_source_replaces_text() {
        let doc = NotebookDoc::new();
        doc.add_cell("a", cell_types::CODE, "x = 1", None).unwrap();
        doc.set_cell_source(0, "y = 2\nprint(y)").unwrap();
        assert_eq!(doc.cell_source(0).unwrap(), "y = 2\nprint(y)");
        doc.set_cell_source(0, "").unwrap();
        assert_eq!(doc.cell_source(0).unwrap(), "");
    }

    #[test]
    fn test_remove_returns_cell() {
        let doc = NotebookDoc::new();
        doc.add_cell("a", cell_types::RAW, "raw text", None).unwrap();
        let removed = doc.remove_cell(0).unwrap();
        assert_eq!(removed["source"], "raw text");
        assert_eq!(doc.cell_count(), 0);
        assert!(doc.remove_cell(0).is_err());
    }

    #[test]
    fn test_replace_outputs_is_whole_list() {
        let doc = NotebookDoc::new();
        doc.add_cell("a", cell_types::CODE, "print(1)", None).unwrap();
        let first = vec![json!({"output_type": "stream", "name": "stdout", "text": "1\n"})];
        doc.replace_outputs(0, &first, Some(1)).unwrap();

        let second = vec![
            json!({"output_type": "stream", "name": "stdout", "text": "2\n"}),
            json!({"output_type": "execute_result", "execution_count": 2, "data": {"text/plain": "2"}, "metadata": {}}),
        ];
        doc.replace_outputs(0, &second, Some(2)).unwrap();

        let cell = doc.cell_json(0).unwrap();
        assert_eq!(cell["outputs"], Value::Array(second));
        assert_eq!(cell["execution_count"], 2);
    }

    #[test]
    fn test_outputs_on_markdown_rejected() {
        let doc = NotebookDoc::new();
        doc.add_cell("m", cell_types::MARKDOWN, "text", None).unwrap();
        assert!(matches!(
            doc.replace_outputs(0, &[], None),
            Err(DocError::InvalidCellType(_))
        ));
    }

    #[test]
    fn test_from_notebook_json() {
        let nb = json!({
            "cells": [
                {"id": "c1", "cell_type": "markdown", "source": ["# Head\n", "body"], "metadata": {}},
                {"id": "c2", "cell_type": "code", "source": "1 + 1", "metadata": {"tags": ["x"]},
                 "outputs": [{"output_type": "execute_result", "execution_count": 4, "data": {"text/plain": "2"}, "metadata": {}}],
                 "execution_count": 4}
            ],
            "metadata": {"kernelspec": {"name": "python3", "display_name": "Python 3"}},
            "nbformat": 4,
            "nbformat_minor": 5
        });
        let doc = NotebookDoc::from_notebook_json(&nb).unwrap();
        assert_eq!(doc.cell_count(), 2);
        assert_eq!(doc.cell_source(0).unwrap(), "# Head\nbody");

        let out = doc.to_json();
        assert_eq!(out["cells"][1]["execution_count"], 4);
        assert_eq!(out["cells"][1]["metadata"]["tags"], json!(["x"]));
        assert_eq!(out["cells"][1]["outputs"][0]["data"]["text/plain"], "2");
        assert_eq!(out["metadata"]["kernelspec"]["name"], "python3");
    }

    #[test]
    fn test_updates_flow_between_replicas() {
        let server = NotebookDoc::new();
        let client = NotebookDoc::new();

        server.add_cell("a", cell_types::CODE, "x = 1", None).unwrap();
        client.apply_update(&server.encode_diff(&client.state_vector())).unwrap();
        assert_eq!(client.cell_source(0).unwrap(), "x = 1");

        let before = server.state_vector();
        client.set_cell_source(0, "x = 2").unwrap();
        server.apply_update(&client.encode_diff(&server.state_vector())).unwrap();
        assert_eq!(server.cell_source(0).unwrap(), "x = 2");
        assert_ne!(before, server.state_vector());
    }

    #[test]
    fn test_garbage_update_is_desync() {
        let doc = NotebookDoc::new();
        assert!(matches!(doc.apply_update(&[0xff, 0x00, 0x13]), Err(DocError::Desync(_))));
        assert!(doc.apply_update(&[]).is_ok());
    }
}
