use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::FillError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnowledgeField {
    pub name: String,
    pub value: String,
}

/// One person/project/unit of repeated data. Field order follows the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnowledgeRecord {
    pub entity_id: String,
    pub fields: Vec<KnowledgeField>,
}

impl KnowledgeRecord {
    pub fn field(&self, name: &str) -> Option<&str> {
        if let Some(f) = self.fields.iter().find(|f| f.name == name) {
            return Some(&f.value);
        }
        // Field names coming back from the model sometimes differ in
        // whitespace (labels wrapped across lines in the template).
        let want = squash(name);
        self.fields
            .iter()
            .find(|f| squash(&f.name) == want)
            .map(|f| f.value.as_str())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

fn squash(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

pub fn load_knowledge(path: &Path) -> Result<Vec<KnowledgeRecord>, FillError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "json" => {
            let bytes = std::fs::read(path).map_err(|e| {
                FillError::KnowledgeUnreadable(format!("{}: {e}", path.display()))
            })?;
            records_from_json_bytes(&bytes)
        }
        "xlsx" | "xlsm" => records_from_workbook(path),
        other => Err(FillError::KnowledgeUnreadable(format!(
            "unsupported knowledge base extension: {other} (expected .xlsx or .json)"
        ))),
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

pub fn records_from_json_bytes(bytes: &[u8]) -> Result<Vec<KnowledgeRecord>, FillError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| FillError::KnowledgeUnreadable(format!("json: {e}")))?;
    records_from_json(&value)
}

pub fn records_from_json(value: &Value) -> Result<Vec<KnowledgeRecord>, FillError> {
    match value {
        Value::Array(items) => {
            let mut records = Vec::new();
            for (i, item) in items.iter().enumerate() {
                let fields = flatten_fields(item);
                if fields.is_empty() {
                    continue;
                }
                let entity_id =
                    identity_of(&fields).unwrap_or_else(|| format!("record{}", i + 1));
                records.push(KnowledgeRecord { entity_id, fields });
            }
            Ok(records)
        }
        Value::Object(map) => {
            // An object whose values are all objects is a keyed record set;
            // anything else is one flat record.
            let all_objects =
                !map.is_empty() && map.values().all(|v| matches!(v, Value::Object(_)));
            if all_objects {
                let mut records = Vec::new();
                for (key, item) in map {
                    let fields = flatten_fields(item);
                    if fields.is_empty() {
                        continue;
                    }
                    records.push(KnowledgeRecord {
                        entity_id: key.clone(),
                        fields,
                    });
                }
                Ok(records)
            } else {
                let fields = flatten_fields(value);
                let entity_id =
                    identity_of(&fields).unwrap_or_else(|| "knowledge".to_string());
                Ok(vec![KnowledgeRecord { entity_id, fields }])
            }
        }
        _ => Err(FillError::KnowledgeUnreadable(
            "json knowledge base must be an object or an array".to_string(),
        )),
    }
}

fn flatten_fields(value: &Value) -> Vec<KnowledgeField> {
    let mut out = Vec::new();
    flatten_into("", value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<KnowledgeField>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let name = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}_{k}")
                };
                flatten_into(&name, v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}_{}", i + 1), v, out);
            }
        }
        other => {
            if prefix.is_empty() {
                return;
            }
            out.push(KnowledgeField {
                name: prefix.to_string(),
                value: scalar_to_string(other),
            });
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

static IDENTITY_KEYS: &[&str] = &["entity_id", "姓名", "名称", "项目名称", "name"];

fn identity_of(fields: &[KnowledgeField]) -> Option<String> {
    for key in IDENTITY_KEYS {
        if let Some(f) = fields.iter().find(|f| f.name == *key) {
            if !f.value.trim().is_empty() {
                return Some(f.value.trim().to_string());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// XLSX
// ---------------------------------------------------------------------------

fn records_from_workbook(path: &Path) -> Result<Vec<KnowledgeRecord>, FillError> {
    let mut wb = open_workbook_auto(path)
        .map_err(|e| FillError::KnowledgeUnreadable(format!("{}: {e}", path.display())))?;
    let sheet_names = wb.sheet_names().to_owned();
    let mut records = Vec::new();
    for name in sheet_names {
        let range = wb
            .worksheet_range(&name)
            .map_err(|e| FillError::KnowledgeUnreadable(format!("sheet {name}: {e}")))?;
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect();
        records.extend(records_from_matrix(&name, &rows));
    }
    if records.is_empty() {
        return Err(FillError::KnowledgeUnreadable(
            "workbook contains no usable rows".to_string(),
        ));
    }
    Ok(records)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => clean_cell_text(s),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(d) => d.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(_) => String::new(),
    }
}

static INLINE_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+([一-龥]{2,10}[：:])").expect("inline key regex"));

/// Cells sometimes carry several pairs on one line ("工作单位：A 职务：B");
/// break them onto separate lines so downstream field matching sees both.
pub fn clean_cell_text(text: &str) -> String {
    INLINE_KEY_RE.replace_all(text.trim(), "\n$1").into_owned()
}

/// Headerless sheet rows → records. Two shapes are recognized: a two-column
/// key/value sheet becomes one record, anything wider is a list with the
/// first row as field names and one record per following row.
pub fn records_from_matrix(sheet_name: &str, rows: &[Vec<String>]) -> Vec<KnowledgeRecord> {
    let non_empty: Vec<&Vec<String>> = rows
        .iter()
        .filter(|r| r.iter().any(|c| !c.trim().is_empty()))
        .collect();
    if non_empty.is_empty() {
        return Vec::new();
    }

    let max_cols = non_empty.iter().map(|r| r.len()).max().unwrap_or(0);
    let kv_shaped = max_cols <= 2
        && non_empty
            .iter()
            .all(|r| r.first().map(|c| !c.trim().is_empty()).unwrap_or(false));

    if kv_shaped {
        let fields: Vec<KnowledgeField> = non_empty
            .iter()
            .map(|r| KnowledgeField {
                name: r[0].trim().to_string(),
                value: r.get(1).map(|c| c.trim().to_string()).unwrap_or_default(),
            })
            .collect();
        let entity_id =
            identity_of(&fields).unwrap_or_else(|| sheet_name.to_string());
        return vec![KnowledgeRecord { entity_id, fields }];
    }

    let header: Vec<String> = non_empty[0].iter().map(|c| c.trim().to_string()).collect();
    let mut records = Vec::new();
    for (i, row) in non_empty.iter().enumerate().skip(1) {
        let mut fields = Vec::new();
        for (j, name) in header.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let value = row.get(j).map(|c| c.trim().to_string()).unwrap_or_default();
            fields.push(KnowledgeField {
                name: name.clone(),
                value,
            });
        }
        if fields.iter().all(|f| f.value.is_empty()) {
            continue;
        }
        let entity_id = identity_of(&fields)
            .or_else(|| {
                fields
                    .iter()
                    .find(|f| !f.value.is_empty())
                    .map(|f| f.value.clone())
            })
            .unwrap_or_else(|| format!("{sheet_name}#{i}"));
        records.push(KnowledgeRecord { entity_id, fields });
    }
    records
}
