use std::collections::HashMap;

use crate::config::WriteMode;
use crate::docx::model::{is_placeholder_chars, ParagraphRun, TableCell, TextSegment};
use crate::docx::xml::{set_attr, PendingInsertions, XmlEvent, XmlPart};
use crate::error::Warning;

/// Paragraph fill automaton. Segments are visited in order; the transition
/// into `InsideUnderline` happens at the first underlined segment, `Filled`
/// after the value lands, and trailing placeholder runs are cleared until the
/// first non-placeholder segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FillState {
    Scanning,
    InsideUnderline,
    Filled,
}

/// Atomic cell write: every segment is validated against the document before
/// any mutation, then the value replaces the cell text in one go. Cells with
/// no text node get a run spliced in at serialize time.
pub fn write_cell(
    parts: &mut HashMap<String, XmlPart>,
    insertions: &mut HashMap<String, PendingInsertions>,
    cell: &TableCell,
    value: &str,
) -> Result<(), Warning> {
    if cell.segments.is_empty() {
        let Some(insert_at) = cell.insert_event else {
            return Err(Warning::FormattingPreservation {
                node_id: cell.node_id.clone(),
                detail: "cell has no paragraph to write into".to_string(),
            });
        };
        let run = build_run_events(&cell.rpr_events, value, cell.insert_wraps_paragraph);
        insertions
            .entry(cell.part.clone())
            .or_default()
            .insert_before(insert_at, run);
        return Ok(());
    }

    let part = parts.get_mut(&cell.part).ok_or_else(|| Warning::FormattingPreservation {
        node_id: cell.node_id.clone(),
        detail: format!("missing part: {}", cell.part),
    })?;
    verify_segments(part, &cell.node_id, &cell.segments)?;

    for (i, seg) in cell.segments.iter().enumerate() {
        let text = if i == 0 { value } else { "" };
        set_segment_text(part, seg, text);
    }
    Ok(())
}

pub fn write_paragraph(
    parts: &mut HashMap<String, XmlPart>,
    para: &ParagraphRun,
    value: &str,
    mode: WriteMode,
) -> Result<(), Warning> {
    let part = parts.get_mut(&para.part).ok_or_else(|| Warning::FormattingPreservation {
        node_id: para.node_id.clone(),
        detail: format!("missing part: {}", para.part),
    })?;
    verify_segments(part, &para.node_id, &para.segments)?;

    let fill = strip_label(&para.label_text, value);

    let mut state = FillState::Scanning;
    let mut target: Option<usize> = None;
    let mut cleared: Vec<usize> = Vec::new();
    for (i, seg) in para.segments.iter().enumerate() {
        state = match state {
            FillState::Scanning => {
                if seg.underlined {
                    target = Some(i);
                    FillState::InsideUnderline
                } else {
                    FillState::Scanning
                }
            }
            FillState::InsideUnderline | FillState::Filled => {
                if seg.underlined && is_placeholder_chars(&seg.text) {
                    cleared.push(i);
                    FillState::Filled
                } else {
                    break;
                }
            }
        };
    }

    let Some(target) = target else {
        return Err(Warning::NoPlaceholder {
            node_id: para.node_id.clone(),
        });
    };

    if mode == WriteMode::Append {
        // Append only protects an explicit label: the segment right before
        // the blank must end like one, and the blank must still be blank.
        let label_like = target > 0
            && para.segments[target - 1]
                .text
                .trim_end()
                .ends_with([':', '：', '.', '。', '、']);
        let blank = is_placeholder_chars(&para.segments[target].text);
        if !label_like || !blank {
            return Err(Warning::NoPlaceholder {
                node_id: para.node_id.clone(),
            });
        }
    }

    let segs = para.segments.clone();
    set_segment_text(part, &segs[target], &fill);
    for i in cleared {
        set_segment_text(part, &segs[i], "");
    }
    Ok(())
}

/// The model may hand back the label together with the value ("姓名: 张三");
/// peel it off, ignoring whitespace differences, so labels never duplicate.
pub fn strip_label(label: &str, value: &str) -> String {
    let label_clean: String = label.chars().filter(|c| !c.is_whitespace()).collect();
    if label_clean.is_empty() {
        return value.trim().to_string();
    }
    let mut lbl = label_clean.chars();
    let mut expect = lbl.next();
    let mut match_end = 0usize;
    for (pos, ch) in value.char_indices() {
        if ch.is_whitespace() {
            continue;
        }
        match expect {
            Some(want) if want == ch => {
                expect = lbl.next();
                match_end = pos + ch.len_utf8();
                if expect.is_none() {
                    break;
                }
            }
            _ => return value.trim().to_string(),
        }
    }
    if expect.is_none() {
        value[match_end..].trim().to_string()
    } else {
        value.trim().to_string()
    }
}

fn verify_segments(
    part: &XmlPart,
    node_id: &str,
    segments: &[TextSegment],
) -> Result<(), Warning> {
    for seg in segments {
        match part.events.get(seg.addr.text_event_index) {
            Some(XmlEvent::Text { text }) if *text == seg.text => {}
            other => {
                return Err(Warning::FormattingPreservation {
                    node_id: node_id.to_string(),
                    detail: format!(
                        "text node at {} changed since capture ({:?})",
                        seg.addr.text_event_index,
                        other.map(|_| ())
                    ),
                });
            }
        }
    }
    Ok(())
}

fn set_segment_text(part: &mut XmlPart, seg: &TextSegment, value: &str) {
    if let Some(XmlEvent::Text { text }) = part.events.get_mut(seg.addr.text_event_index) {
        *text = value.to_string();
    }
    if value.starts_with(' ') || value.ends_with(' ') {
        if let Some(ev) = part.events.get_mut(seg.addr.elem_event_index) {
            set_attr(ev, "xml:space", "preserve");
        }
    }
}

fn build_run_events(rpr: &[XmlEvent], value: &str, wrap_paragraph: bool) -> Vec<XmlEvent> {
    let mut t_attrs: Vec<(String, String)> = Vec::new();
    if value.starts_with(' ') || value.ends_with(' ') {
        t_attrs.push(("xml:space".to_string(), "preserve".to_string()));
    }
    let mut events = Vec::new();
    if wrap_paragraph {
        events.push(XmlEvent::Start {
            name: "w:p".to_string(),
            attrs: vec![],
        });
    }
    events.push(XmlEvent::Start {
        name: "w:r".to_string(),
        attrs: vec![],
    });
    events.extend(rpr.iter().cloned());
    events.push(XmlEvent::Start {
        name: "w:t".to_string(),
        attrs: t_attrs,
    });
    events.push(XmlEvent::Text {
        text: value.to_string(),
    });
    events.push(XmlEvent::End {
        name: "w:t".to_string(),
    });
    events.push(XmlEvent::End {
        name: "w:r".to_string(),
    });
    if wrap_paragraph {
        events.push(XmlEvent::End {
            name: "w:p".to_string(),
        });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteMode;
    use crate::docx::model::{DocumentModel, DocumentNode};
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

    fn serialized_document(
        parts: &HashMap<String, XmlPart>,
        insertions: &HashMap<String, PendingInsertions>,
    ) -> String {
        let part = parts.get("word/document.xml").expect("document part");
        let empty = PendingInsertions::default();
        let ins = insertions.get("word/document.xml").unwrap_or(&empty);
        String::from_utf8(part.serialize_with(ins).expect("serialize")).expect("utf8")
    }

    #[test]
    fn fills_underline_blank_after_label() {
        // 姓名：____ with the blank underlined; value lands inside the
        // underline span, label untouched.
        let pkg = docx(
            "<w:document><w:body><w:p><w:r><w:t>姓名：</w:t></w:r>\
             <w:r><w:rPr><w:u w:val=\"single\"/></w:rPr><w:t>____</w:t></w:r></w:p>\
             </w:body></w:document>",
        );
        let (model, mut parts) = DocumentModel::build(&pkg).expect("build");
        let DocumentNode::Paragraph(p) = model.node("p1").expect("node").clone() else {
            panic!("expected paragraph");
        };

        write_paragraph(&mut parts, &p, "张三", WriteMode::Overwrite).expect("write");
        let out = serialized_document(&parts, &HashMap::new());
        assert!(out.contains("<w:t>姓名：</w:t>"));
        assert!(out.contains("<w:u w:val=\"single\"/></w:rPr><w:t>张三</w:t>"));
    }

    #[test]
    fn overwrite_clears_trailing_placeholder_runs_only() {
        let pkg = docx(
            "<w:document><w:body><w:p><w:r><w:t>编号：</w:t></w:r>\
             <w:r><w:rPr><w:u/></w:rPr><w:t>__</w:t></w:r>\
             <w:r><w:rPr><w:u/></w:rPr><w:t>__</w:t></w:r>\
             <w:r><w:t>（审批用）</w:t></w:r></w:p></w:body></w:document>",
        );
        let (model, mut parts) = DocumentModel::build(&pkg).expect("build");
        let DocumentNode::Paragraph(p) = model.node("p1").expect("node").clone() else {
            panic!("expected paragraph");
        };

        write_paragraph(&mut parts, &p, "A-17", WriteMode::Overwrite).expect("write");
        let out = serialized_document(&parts, &HashMap::new());
        assert!(out.contains("<w:t>A-17</w:t>"));
        assert!(out.contains("<w:t></w:t>"));
        assert!(out.contains("（审批用）"));
    }

    #[test]
    fn append_refuses_without_label() {
        let pkg = docx(
            "<w:document><w:body><w:p>\
             <w:r><w:rPr><w:u/></w:rPr><w:t>    </w:t></w:r></w:p></w:body></w:document>",
        );
        let (model, mut parts) = DocumentModel::build(&pkg).expect("build");
        let DocumentNode::Paragraph(p) = model.node("p1").expect("node").clone() else {
            panic!("expected paragraph");
        };

        let err = write_paragraph(&mut parts, &p, "x", WriteMode::Append).unwrap_err();
        assert!(matches!(err, Warning::NoPlaceholder { .. }));
    }

    #[test]
    fn paragraph_without_underline_reports_unresolved() {
        let pkg = docx(
            "<w:document><w:body><w:p><w:r><w:t>备注：</w:t></w:r></w:p></w:body></w:document>",
        );
        let (model, mut parts) = DocumentModel::build(&pkg).expect("build");
        let DocumentNode::Paragraph(p) = model.node("p1").expect("node").clone() else {
            panic!("expected paragraph");
        };

        let err = write_paragraph(&mut parts, &p, "x", WriteMode::Overwrite).unwrap_err();
        assert!(matches!(err, Warning::NoPlaceholder { .. }));
    }

    #[test]
    fn cell_write_replaces_whole_cell_text() {
        let pkg = docx(
            "<w:document><w:body><w:tbl><w:tr>\
             <w:tc><w:p><w:r><w:t>姓名</w:t></w:r></w:p></w:tc>\
             <w:tc><w:p><w:r><w:t>__</w:t></w:r><w:r><w:t>__</w:t></w:r></w:p></w:tc>\
             </w:tr></w:tbl></w:body></w:document>",
        );
        let (model, mut parts) = DocumentModel::build(&pkg).expect("build");
        let DocumentNode::Cell(c) = model.node("t1r1c2").expect("cell").clone() else {
            panic!("expected cell");
        };

        let mut insertions = HashMap::new();
        write_cell(&mut parts, &mut insertions, &c, "张三").expect("write");
        let out = serialized_document(&parts, &insertions);
        assert!(out.contains("<w:r><w:t>张三</w:t></w:r><w:r><w:t></w:t></w:r>"));
        assert!(out.contains("<w:t>姓名</w:t>"));
    }

    #[test]
    fn empty_cell_gets_inserted_run() {
        let pkg = docx(
            "<w:document><w:body><w:tbl><w:tr>\
             <w:tc><w:p><w:r><w:rPr><w:b/></w:rPr><w:t>电话</w:t></w:r></w:p></w:tc>\
             <w:tc><w:p/></w:tc>\
             </w:tr></w:tbl></w:body></w:document>",
        );
        let (model, mut parts) = DocumentModel::build(&pkg).expect("build");
        let DocumentNode::Cell(c) = model.node("t1r1c2").expect("cell").clone() else {
            panic!("expected cell");
        };
        assert!(c.segments.is_empty());

        let mut insertions = HashMap::new();
        write_cell(&mut parts, &mut insertions, &c, "13800000000").expect("write");
        let out = serialized_document(&parts, &insertions);
        assert!(out.contains("<w:p><w:r><w:t>13800000000</w:t></w:r></w:p><w:p/>"));
    }

    #[test]
    fn write_aborts_when_captured_text_drifted() {
        let pkg = docx(
            "<w:document><w:body><w:tbl><w:tr>\
             <w:tc><w:p><w:r><w:t>____</w:t></w:r></w:p></w:tc>\
             </w:tr></w:tbl></w:body></w:document>",
        );
        let (model, mut parts) = DocumentModel::build(&pkg).expect("build");
        let DocumentNode::Cell(c) = model.node("t1r1c1").expect("cell").clone() else {
            panic!("expected cell");
        };
        // Simulate drift between capture and write.
        let part = parts.get_mut("word/document.xml").unwrap();
        if let Some(XmlEvent::Text { text }) =
            part.events.get_mut(c.segments[0].addr.text_event_index)
        {
            *text = "meddled".to_string();
        }

        let mut insertions = HashMap::new();
        let err = write_cell(&mut parts, &mut insertions, &c, "v").unwrap_err();
        assert!(matches!(err, Warning::FormattingPreservation { .. }));
    }

    #[test]
    fn strip_label_handles_spacing_variants() {
        assert_eq!(strip_label("姓名：", "姓名： 张三"), "张三");
        assert_eq!(strip_label("姓名：", "张三"), "张三");
        assert_eq!(strip_label("Name:", "Name: Ada"), "Ada");
        assert_eq!(strip_label("", "  v  "), "v");
        // Model rephrased the label: keep the full value rather than guess.
        assert_eq!(strip_label("姓名：", "名字：张三"), "名字：张三");
    }
}
