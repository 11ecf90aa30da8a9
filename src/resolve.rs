use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::docx::model::DocumentModel;
use crate::error::{FillError, Warning};

/// Typed form of one raw mapping entry. Everything downstream of the
/// resolver operates on these; the untyped model output never escapes this
/// module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMapping {
    pub field_name: String,
    pub target_node_id: String,
}

#[derive(Clone, Debug)]
pub struct BlockMappings {
    pub block_id: String,
    pub mappings: Vec<FieldMapping>,
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedMapping {
    /// Per-block groups in document order, ready for entity assignment.
    pub blocks: Vec<BlockMappings>,
    pub warnings: Vec<Warning>,
}

/// Validate, repair and deduplicate the raw model output. Unknown targets and
/// duplicates degrade to warnings; only an unparseable payload is fatal.
pub fn resolve(raw: &str, model: &DocumentModel) -> Result<ResolvedMapping, FillError> {
    let value = extract_json_object(raw)?;
    let Value::Object(top) = value else {
        return Err(FillError::MappingParse(
            "expected a JSON object of field → node id pairs".to_string(),
        ));
    };

    let mut warnings: Vec<Warning> = Vec::new();
    // (block_id, mapping) in model output order.
    let mut entries: Vec<(String, FieldMapping)> = Vec::new();

    let mut push_entry = |field_name: &str, target: &Value, warnings: &mut Vec<Warning>| {
        let field_name = field_name.trim().to_string();
        let Some(node_id) = target.as_str().map(|s| s.trim().to_string()) else {
            warnings.push(Warning::UnresolvedField {
                field_name,
                node_id: target.to_string(),
            });
            return;
        };
        if node_id.is_empty() {
            return;
        }
        let resolved = if model.node(&node_id).is_some() {
            node_id
        } else if let Some(repaired) = model.repair_candidate(&node_id) {
            warnings.push(Warning::RepairedTarget {
                field_name: field_name.clone(),
                from: node_id,
                to: repaired.clone(),
            });
            repaired
        } else {
            warnings.push(Warning::UnresolvedField {
                field_name,
                node_id,
            });
            return;
        };
        let block_id = model
            .block_of(&resolved)
            .map(|b| b.block_id.clone())
            .unwrap_or_default();
        entries.push((
            block_id,
            FieldMapping {
                field_name,
                target_node_id: resolved,
            },
        ));
    };

    for (key, value) in &top {
        if key.starts_with("__") {
            continue;
        }
        match value {
            // Nested shape: block id → { field: node }.
            Value::Object(inner) => {
                for (field, target) in inner {
                    push_entry(field, target, &mut warnings);
                }
            }
            // Flat shape: field → node, routed to the node's own block.
            other => push_entry(key, other, &mut warnings),
        }
    }

    // First mapping per node wins, within its block instance.
    let mut claimed: HashSet<(String, String)> = HashSet::new();
    let mut by_block: HashMap<String, Vec<FieldMapping>> = HashMap::new();
    for (block_id, mapping) in entries {
        let key = (block_id.clone(), mapping.target_node_id.clone());
        if !claimed.insert(key) {
            warnings.push(Warning::AmbiguousTarget {
                field_name: mapping.field_name,
                node_id: mapping.target_node_id,
            });
            continue;
        }
        by_block.entry(block_id).or_default().push(mapping);
    }

    let blocks = model
        .nodes_by_block()
        .filter_map(|b| {
            by_block.remove(&b.block_id).map(|mappings| BlockMappings {
                block_id: b.block_id.clone(),
                mappings,
            })
        })
        .collect();

    Ok(ResolvedMapping { blocks, warnings })
}

/// The model wraps its JSON in prose or code fences often enough that strict
/// parsing alone loses usable answers; fall back to the outermost brace pair.
fn extract_json_object(raw: &str) -> Result<Value, FillError> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Ok(v);
    }
    let start = raw.find('{');
    let end = raw.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<Value>(&raw[start..=end]) {
                return Ok(v);
            }
        }
    }
    Err(FillError::MappingParse(format!(
        "no JSON object found in model output ({} chars)",
        raw.chars().count()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::model::DocumentModel;
    use crate::docx::package::TemplatePackage;
    use std::io::Write;

    fn model_with_two_tables() -> DocumentModel {
        let row = "<w:tr><w:tc><w:p><w:r><w:t>姓名</w:t></w:r></w:p></w:tc>\
                   <w:tc><w:p><w:r><w:t>____</w:t></w:r></w:p></w:tc></w:tr>";
        let xml = format!(
            "<w:document><w:body><w:tbl>{row}</w:tbl><w:tbl>{row}</w:tbl></w:body></w:document>"
        );
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let opts = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zip.start_file("word/document.xml", opts).unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
        let pkg = TemplatePackage::read_bytes(&cursor.into_inner()).expect("read");
        DocumentModel::build(&pkg).expect("build").0
    }

    #[test]
    fn nested_mapping_groups_by_block() {
        let model = model_with_two_tables();
        let raw = r#"{"t1": {"姓名": "t1r1c2"}, "t2": {"姓名": "t2r1c2"}}"#;
        let resolved = resolve(raw, &model).expect("resolve");
        assert_eq!(resolved.blocks.len(), 2);
        assert_eq!(resolved.blocks[0].block_id, "t1");
        assert_eq!(resolved.blocks[0].mappings[0].target_node_id, "t1r1c2");
        assert!(resolved.warnings.is_empty());
    }

    #[test]
    fn flat_mapping_routes_to_owning_block() {
        let model = model_with_two_tables();
        let raw = r#"{"姓名": "t2r1c2"}"#;
        let resolved = resolve(raw, &model).expect("resolve");
        assert_eq!(resolved.blocks.len(), 1);
        assert_eq!(resolved.blocks[0].block_id, "t2");
    }

    #[test]
    fn duplicate_target_keeps_first_and_warns() {
        let model = model_with_two_tables();
        let raw = r#"{"t1": {"姓名": "t1r1c2", "名字": "t1r1c2"}}"#;
        let resolved = resolve(raw, &model).expect("resolve");
        assert_eq!(resolved.blocks[0].mappings.len(), 1);
        assert_eq!(resolved.blocks[0].mappings[0].field_name, "姓名");
        assert!(matches!(
            resolved.warnings[0],
            Warning::AmbiguousTarget { .. }
        ));
    }

    #[test]
    fn off_by_one_column_is_repaired() {
        let model = model_with_two_tables();
        let raw = r#"{"姓名": "t1r1c3"}"#;
        let resolved = resolve(raw, &model).expect("resolve");
        assert_eq!(resolved.blocks[0].mappings[0].target_node_id, "t1r1c2");
        assert!(matches!(
            resolved.warnings[0],
            Warning::RepairedTarget { .. }
        ));
    }

    #[test]
    fn unknown_node_is_nonfatal() {
        let model = model_with_two_tables();
        let raw = r#"{"姓名": "t7r7c7"}"#;
        let resolved = resolve(raw, &model).expect("resolve");
        assert!(resolved.blocks.is_empty());
        assert!(matches!(
            resolved.warnings[0],
            Warning::UnresolvedField { .. }
        ));
    }

    #[test]
    fn json_is_extracted_from_fenced_output() {
        let model = model_with_two_tables();
        let raw = "Here is the mapping:\n```json\n{\"姓名\": \"t1r1c2\"}\n```";
        let resolved = resolve(raw, &model).expect("resolve");
        assert_eq!(resolved.blocks.len(), 1);
    }

    #[test]
    fn truncated_payload_is_a_parse_error() {
        let model = model_with_two_tables();
        let err = resolve("{\"姓名\": \"t1r1", &model).unwrap_err();
        assert!(matches!(err, FillError::MappingParse(_)));
    }

    #[test]
    fn identity_keys_are_ignored() {
        let model = model_with_two_tables();
        let raw = r#"{"__identity__": "张三", "姓名": "t1r1c2"}"#;
        let resolved = resolve(raw, &model).expect("resolve");
        assert_eq!(resolved.blocks.len(), 1);
        assert!(resolved.warnings.is_empty());
    }
}
