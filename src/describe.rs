use serde::Serialize;

use crate::docx::model::{BlockKind, DocumentModel, DocumentNode};

/// Serialized outline of the document handed to the model: per block its
/// signature and member nodes with existing text and label hints. Building it
/// is side-effect-free; this is the whole payload the model sees.
#[derive(Clone, Debug, Serialize)]
pub struct DocumentDescription {
    pub blocks: Vec<BlockDescription>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BlockDescription {
    pub block_id: String,
    pub kind: &'static str,
    pub signature: String,
    pub nodes: Vec<NodeDescription>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeDescription {
    pub node_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub fill_here: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

pub fn describe(model: &DocumentModel) -> DocumentDescription {
    let blocks = model
        .nodes_by_block()
        .map(|block| BlockDescription {
            block_id: block.block_id.clone(),
            kind: match block.kind {
                BlockKind::Table => "table",
                BlockKind::ParagraphGroup => "paragraph_group",
            },
            // A short prefix is enough to tell repetitions apart.
            signature: block.signature.chars().take(12).collect(),
            nodes: block.nodes.iter().map(describe_node).collect(),
        })
        .collect();
    DocumentDescription { blocks }
}

fn describe_node(node: &DocumentNode) -> NodeDescription {
    match node {
        DocumentNode::Cell(c) => NodeDescription {
            node_id: c.node_id.clone(),
            text: c.raw_text.trim().to_string(),
            fill_here: c.is_slot,
            hint: c.label_hint.clone(),
        },
        DocumentNode::Paragraph(p) => NodeDescription {
            node_id: p.node_id.clone(),
            text: p.raw_text.trim().to_string(),
            fill_here: true,
            hint: if p.label_text.trim().is_empty() {
                None
            } else {
                Some(format!("label: {}", p.label_text.trim()))
            },
        },
    }
}

pub fn to_json(description: &DocumentDescription) -> String {
    serde_json::to_string_pretty(description).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::model::DocumentModel;
    use crate::docx::package::TemplatePackage;
    use std::io::Write;

    fn docx(document_xml: &str) -> TemplatePackage {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let opts = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zip.start_file("word/document.xml", opts).unwrap();
        zip.write_all(document_xml.as_bytes()).unwrap();
        zip.finish().unwrap();
        TemplatePackage::read_bytes(&cursor.into_inner()).expect("read docx")
    }

    #[test]
    fn outline_carries_ids_labels_and_slot_flags() {
        let pkg = docx(
            "<w:document><w:body><w:tbl><w:tr>\
             <w:tc><w:p><w:r><w:t>姓名</w:t></w:r></w:p></w:tc>\
             <w:tc><w:p><w:r><w:t>____</w:t></w:r></w:p></w:tc>\
             </w:tr></w:tbl></w:body></w:document>",
        );
        let (model, _parts) = DocumentModel::build(&pkg).expect("build");
        let desc = describe(&model);

        assert_eq!(desc.blocks.len(), 1);
        let block = &desc.blocks[0];
        assert_eq!(block.kind, "table");
        assert_eq!(block.nodes.len(), 2);
        assert_eq!(block.nodes[0].node_id, "t1r1c1");
        assert!(!block.nodes[0].fill_here);
        assert!(block.nodes[1].fill_here);
        assert_eq!(block.nodes[1].hint.as_deref(), Some("left: 姓名"));

        let json = to_json(&desc);
        assert!(json.contains("t1r1c2"));
        assert!(json.contains("姓名"));
    }
}
