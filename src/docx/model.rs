use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::docx::package::TemplatePackage;
use crate::docx::xml::{find_attr, XmlEvent, XmlPart};
use crate::error::FillError;

/// Address of one `w:t` text node inside a parsed part. Event indices are
/// captured at parse time and stay valid for the whole pass (writers mutate
/// `Text` events in place and never splice into `events`).
#[derive(Clone, Debug)]
pub struct TextAddr {
    pub part: String,
    pub elem_event_index: usize,
    pub text_event_index: usize,
}

#[derive(Clone, Debug)]
pub struct TextSegment {
    pub text: String,
    pub underlined: bool,
    pub addr: TextAddr,
}

#[derive(Clone, Debug)]
pub struct TableCell {
    pub node_id: String,
    pub table_id: usize,
    pub row: usize,
    pub col: usize,
    pub raw_text: String,
    /// Serialized `w:rPr` of the cell's first styled run; reapplied when a
    /// run has to be created in an empty cell.
    pub style_ref: String,
    pub rpr_events: Vec<XmlEvent>,
    pub segments: Vec<TextSegment>,
    pub part: String,
    /// Event index the writer splices a new run before when the cell has no
    /// text node. Points at the first paragraph's `</w:p>`, or at an empty
    /// `<w:p/>` (then `insert_wraps_paragraph` is set and the spliced events
    /// carry their own paragraph).
    pub insert_event: Option<usize>,
    pub insert_wraps_paragraph: bool,
    pub is_slot: bool,
    pub label_hint: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ParagraphRun {
    pub node_id: String,
    pub paragraph_id: usize,
    pub raw_text: String,
    /// Plain text preceding the first underlined segment.
    pub label_text: String,
    pub segments: Vec<TextSegment>,
    pub part: String,
    pub has_underline_placeholder: bool,
}

#[derive(Clone, Debug)]
pub enum DocumentNode {
    Cell(TableCell),
    Paragraph(ParagraphRun),
}

impl DocumentNode {
    pub fn node_id(&self) -> &str {
        match self {
            DocumentNode::Cell(c) => &c.node_id,
            DocumentNode::Paragraph(p) => &p.node_id,
        }
    }

    pub fn raw_text(&self) -> &str {
        match self {
            DocumentNode::Cell(c) => &c.raw_text,
            DocumentNode::Paragraph(p) => &p.raw_text,
        }
    }

    pub fn is_slot(&self) -> bool {
        match self {
            DocumentNode::Cell(c) => c.is_slot,
            DocumentNode::Paragraph(p) => {
                p.has_underline_placeholder || is_potential_slot(&p.raw_text)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Table,
    ParagraphGroup,
}

/// A table or a run of consecutive slot-bearing paragraphs. Blocks with the
/// same signature are repetitions of one pattern, in document order.
#[derive(Clone, Debug)]
pub struct StructuralBlock {
    pub block_id: String,
    pub kind: BlockKind,
    pub signature: String,
    pub nodes: Vec<DocumentNode>,
}

pub struct DocumentModel {
    blocks: Vec<StructuralBlock>,
    node_index: HashMap<String, (usize, usize)>,
}

impl DocumentModel {
    pub fn build(pkg: &TemplatePackage) -> Result<(Self, HashMap<String, XmlPart>), FillError> {
        let mut parts: HashMap<String, XmlPart> = HashMap::new();
        let mut builder = ModelBuilder::default();
        for ent in pkg.fillable_parts() {
            let part = XmlPart::parse(&ent.name, &ent.data)?;
            builder.scan_part(&part);
            parts.insert(ent.name.clone(), part);
        }
        Ok((builder.finish(), parts))
    }

    /// Blocks in document order, each with its ordered member nodes. Plain
    /// slice iteration: lazy, finite, restartable.
    pub fn nodes_by_block(&self) -> impl Iterator<Item = &StructuralBlock> {
        self.blocks.iter()
    }

    pub fn node(&self, node_id: &str) -> Option<&DocumentNode> {
        let (b, n) = *self.node_index.get(node_id)?;
        Some(&self.blocks[b].nodes[n])
    }

    pub fn block_of(&self, node_id: &str) -> Option<&StructuralBlock> {
        let (b, _) = *self.node_index.get(node_id)?;
        Some(&self.blocks[b])
    }

    pub fn block(&self, block_id: &str) -> Option<&StructuralBlock> {
        self.blocks.iter().find(|b| b.block_id == block_id)
    }

    /// Signature groups in first-occurrence order; members in document order.
    pub fn signature_groups(&self) -> Vec<(String, Vec<&StructuralBlock>)> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&StructuralBlock>> = HashMap::new();
        for b in &self.blocks {
            if !groups.contains_key(&b.signature) {
                order.push(b.signature.clone());
            }
            groups.entry(b.signature.clone()).or_default().push(b);
        }
        order
            .into_iter()
            .map(|sig| {
                let members = groups.remove(&sig).unwrap_or_default();
                (sig, members)
            })
            .collect()
    }

    /// Bounded repair for model indexing slips: a cell id unknown to the tree
    /// is accepted when shifting the column by one lands on a real node in
    /// the same table and row.
    pub fn repair_candidate(&self, node_id: &str) -> Option<String> {
        let (table, row, col) = parse_cell_id(node_id)?;
        for cand_col in [col.wrapping_sub(1), col + 1] {
            if cand_col == 0 {
                continue;
            }
            let cand = cell_id(table, row, cand_col);
            if self.node_index.contains_key(&cand) {
                return Some(cand);
            }
        }
        None
    }
}

pub fn cell_id(table: usize, row: usize, col: usize) -> String {
    format!("t{table}r{row}c{col}")
}

pub fn parse_cell_id(id: &str) -> Option<(usize, usize, usize)> {
    static CELL_ID_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^t(\d+)r(\d+)c(\d+)$").expect("cell id regex"));
    let caps = CELL_ID_RE.captures(id)?;
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

// ---------------------------------------------------------------------------
// Slot heuristics
// ---------------------------------------------------------------------------

static HEADER_EXCLUSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^第\s*[（(]\s*[）)]\s*(?:完成人|作者|完成单位|单位|起草人)")
        .expect("header exclusion regex")
});
static UNDERSCORES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{2,}").expect("underscore regex"));
static PROMPT_PARENS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[（(](?:\s*|.*?(?:填写|输入|粘贴|限|字|内容).*?)[）)]").expect("parens regex")
});
static BLANK_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_+|\s+").expect("blank run regex"));
static NUMBERED_PROMPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+[.、\s]").expect("numbered prompt regex"));

/// Whether a cell or paragraph text marks a position to fill rather than a
/// label. Ported rules: blanks, underscore runs, empty or prompting
/// parentheses, 年/月 date skeletons, trailing colons, numbered long prompts;
/// `第( )完成人`-style headers are explicitly excluded.
pub fn is_potential_slot(text: &str) -> bool {
    if text.is_empty() {
        return true;
    }
    let clean: String = text
        .trim()
        .chars()
        .filter(|&c| c != '\u{200b}')
        .map(|c| if c == '\u{3000}' { ' ' } else { c })
        .collect();
    let clean = clean.trim();
    if clean.is_empty() {
        return true;
    }
    if HEADER_EXCLUSION_RE.is_match(clean) {
        return false;
    }
    if clean.chars().all(|c| " _()（）".contains(c)) {
        return true;
    }
    if UNDERSCORES_RE.is_match(clean) {
        return true;
    }
    if PROMPT_PARENS_RE.is_match(clean) {
        return true;
    }
    if clean.contains('年') && clean.contains('月') {
        if !clean.starts_with(|c: char| c.is_ascii_digit()) && BLANK_RUN_RE.is_match(clean) {
            return true;
        }
    }
    if clean.ends_with(':') || clean.ends_with('：') {
        return true;
    }
    if NUMBERED_PROMPT_RE.is_match(clean) && clean.chars().count() > 5 {
        return true;
    }
    false
}

pub fn is_placeholder_chars(text: &str) -> bool {
    text.chars().all(|c| matches!(c, ' ' | '_' | '\t' | '\u{3000}' | '\u{a0}'))
}

/// An underlined whitespace-only run of at least two characters reads as a
/// visual blank even when the surrounding text does not.
pub fn has_visual_placeholder(segments: &[TextSegment]) -> bool {
    segments.iter().any(|s| {
        s.underlined
            && s.text.chars().count() >= 2
            && s.text
                .chars()
                .all(|c| matches!(c, ' ' | '\t' | '\u{3000}' | '\u{a0}'))
    })
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunCapture {
    underlined: bool,
    rpr_start: Option<usize>,
    in_rpr: bool,
    text_elem: Option<usize>,
}

#[derive(Default)]
struct ParaCapture {
    segments: Vec<TextSegment>,
    raw_text: String,
    end_event: Option<usize>,
}

struct CellCapture {
    row: usize,
    col: usize,
    span: usize,
    vmerge_continuation: bool,
    in_tcpr: bool,
    paragraphs: Vec<ParaCapture>,
    first_para_insert: Option<usize>,
    first_para_is_empty_elem: bool,
    rpr_events: Vec<XmlEvent>,
}

struct TableCapture {
    table_id: usize,
    row: usize,
    next_col: usize,
    cells: Vec<TableCell>,
    grid: HashMap<(usize, usize), String>,
}

#[derive(Default)]
struct ModelBuilder {
    blocks: Vec<StructuralBlock>,
    next_table_id: usize,
    next_paragraph_id: usize,
    next_group_id: usize,
    pending_group: Vec<ParagraphRun>,
}

impl ModelBuilder {
    fn scan_part(&mut self, part: &XmlPart) {
        let mut stack: Vec<String> = Vec::new();
        let mut tbl_depth = 0usize;
        let mut table: Option<TableCapture> = None;
        let mut cell: Option<CellCapture> = None;
        let mut para: Option<ParaCapture> = None;
        let mut para_in_cell = false;
        // Paragraphs can nest through textbox content; only the outermost
        // capture counts.
        let mut nested_para_depth = 0usize;
        let mut run: Option<RunCapture> = None;

        for (idx, ev) in part.events.iter().enumerate() {
            match ev {
                XmlEvent::Start { name, attrs } => {
                    let parent = stack.last().map(|s| s.as_str()).unwrap_or("");
                    match name.as_str() {
                        "w:tbl" => {
                            if tbl_depth == 0 {
                                self.flush_group();
                                self.next_table_id += 1;
                                table = Some(TableCapture {
                                    table_id: self.next_table_id,
                                    row: 0,
                                    next_col: 1,
                                    cells: Vec::new(),
                                    grid: HashMap::new(),
                                });
                            }
                            tbl_depth += 1;
                        }
                        "w:tr" => {
                            if tbl_depth == 1 {
                                if let Some(t) = table.as_mut() {
                                    t.row += 1;
                                    t.next_col = 1;
                                }
                            }
                        }
                        "w:tc" => {
                            if tbl_depth == 1 {
                                let (row, col) = table
                                    .as_ref()
                                    .map(|t| (t.row, t.next_col))
                                    .unwrap_or((1, 1));
                                cell = Some(CellCapture {
                                    row,
                                    col,
                                    span: 1,
                                    vmerge_continuation: false,
                                    in_tcpr: false,
                                    paragraphs: Vec::new(),
                                    first_para_insert: None,
                                    first_para_is_empty_elem: false,
                                    rpr_events: Vec::new(),
                                });
                            }
                        }
                        "w:tcPr" => {
                            if let Some(c) = cell.as_mut() {
                                c.in_tcpr = true;
                            }
                        }
                        "w:p" => {
                            if para.is_some() {
                                nested_para_depth += 1;
                            } else if cell.is_some() && tbl_depth == 1 {
                                para = Some(ParaCapture::default());
                                para_in_cell = true;
                            } else if tbl_depth == 0
                                && matches!(parent, "w:body" | "w:hdr" | "w:ftr")
                            {
                                para = Some(ParaCapture::default());
                                para_in_cell = false;
                            }
                        }
                        "w:r" => {
                            if para.is_some() && nested_para_depth == 0 {
                                run = Some(RunCapture::default());
                            }
                        }
                        "w:rPr" => {
                            if nested_para_depth == 0 {
                                if let Some(r) = run.as_mut() {
                                    r.in_rpr = true;
                                    r.rpr_start = Some(idx);
                                }
                            }
                        }
                        "w:u" => {
                            if nested_para_depth == 0 {
                                if let Some(r) = run.as_mut() {
                                    if r.in_rpr {
                                        r.underlined = underline_value(attrs);
                                    }
                                }
                            }
                        }
                        "w:t" => {
                            if nested_para_depth == 0 {
                                if let Some(r) = run.as_mut() {
                                    r.text_elem = Some(idx);
                                }
                            }
                        }
                        _ => {}
                    }
                    stack.push(name.clone());
                }
                XmlEvent::Empty { name, attrs } => {
                    match name.as_str() {
                        "w:p" => {
                            // An empty <w:p/> in a cell still marks where a
                            // run could go; the spliced events bring their
                            // own paragraph.
                            if para.is_none() {
                                if let Some(c) = cell.as_mut() {
                                    if tbl_depth == 1 && c.first_para_insert.is_none() {
                                        c.first_para_insert = Some(idx);
                                        c.first_para_is_empty_elem = true;
                                    }
                                    if tbl_depth == 1 {
                                        c.paragraphs.push(ParaCapture::default());
                                    }
                                }
                            }
                        }
                        "w:gridSpan" => {
                            if let Some(c) = cell.as_mut() {
                                if c.in_tcpr {
                                    if let Some(n) =
                                        find_attr(attrs, "w:val").and_then(|v| v.parse::<usize>().ok())
                                    {
                                        c.span = n.max(1);
                                    }
                                }
                            }
                        }
                        "w:vMerge" => {
                            if let Some(c) = cell.as_mut() {
                                if c.in_tcpr {
                                    let val = find_attr(attrs, "w:val").unwrap_or("continue");
                                    c.vmerge_continuation = val != "restart";
                                }
                            }
                        }
                        "w:u" => {
                            if nested_para_depth == 0 {
                                if let Some(r) = run.as_mut() {
                                    if r.in_rpr {
                                        r.underlined = underline_value(attrs);
                                    }
                                }
                            }
                        }
                        "w:tab" | "w:ptab" => {
                            if nested_para_depth == 0 {
                                if let Some(p) = para.as_mut() {
                                    p.raw_text.push('\t');
                                }
                            }
                        }
                        "w:br" | "w:cr" => {
                            if nested_para_depth == 0 {
                                if let Some(p) = para.as_mut() {
                                    p.raw_text.push('\n');
                                }
                            }
                        }
                        _ => {}
                    }
                }
                XmlEvent::End { name } => {
                    match name.as_str() {
                        "w:tbl" => {
                            tbl_depth = tbl_depth.saturating_sub(1);
                            if tbl_depth == 0 {
                                if let Some(t) = table.take() {
                                    self.push_table_block(t);
                                }
                            }
                        }
                        "w:tc" => {
                            if tbl_depth == 1 {
                                if let Some(c) = cell.take() {
                                    if let Some(t) = table.as_mut() {
                                        finish_cell(t, c, &part.name);
                                    }
                                }
                            }
                        }
                        "w:tcPr" => {
                            if let Some(c) = cell.as_mut() {
                                c.in_tcpr = false;
                            }
                        }
                        "w:p" => {
                            if nested_para_depth > 0 {
                                nested_para_depth -= 1;
                            } else if let Some(mut p) = para.take() {
                                p.end_event = Some(idx);
                                if para_in_cell {
                                    if let Some(c) = cell.as_mut() {
                                        if c.first_para_insert.is_none() {
                                            c.first_para_insert = Some(idx);
                                        }
                                        c.paragraphs.push(p);
                                    }
                                } else {
                                    self.finish_body_paragraph(p, &part.name);
                                }
                            }
                        }
                        "w:rPr" => {
                            if nested_para_depth == 0 {
                                if let Some(r) = run.as_mut() {
                                    if r.in_rpr {
                                        r.in_rpr = false;
                                        if let Some(c) = cell.as_mut() {
                                            if c.rpr_events.is_empty() {
                                                if let Some(start) = r.rpr_start {
                                                    c.rpr_events =
                                                        part.events[start..=idx].to_vec();
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        "w:r" => {
                            if nested_para_depth == 0 {
                                run = None;
                            }
                        }
                        "w:t" => {
                            if nested_para_depth == 0 {
                                if let Some(r) = run.as_mut() {
                                    r.text_elem = None;
                                }
                            }
                        }
                        _ => {}
                    }
                    let _ = stack.pop();
                }
                XmlEvent::Text { text } => {
                    if nested_para_depth > 0 {
                        continue;
                    }
                    let (Some(r), Some(p)) = (run.as_mut(), para.as_mut()) else {
                        continue;
                    };
                    let Some(elem_idx) = r.text_elem else {
                        continue;
                    };
                    p.raw_text.push_str(text);
                    p.segments.push(TextSegment {
                        text: text.clone(),
                        underlined: r.underlined,
                        addr: TextAddr {
                            part: part.name.clone(),
                            elem_event_index: elem_idx,
                            text_event_index: idx,
                        },
                    });
                }
                _ => {}
            }
        }
        self.flush_group();
    }

    fn finish_body_paragraph(&mut self, p: ParaCapture, part: &str) {
        let trimmed = p.raw_text.trim();
        let visual = has_visual_placeholder(&p.segments);
        if trimmed.is_empty() && !visual {
            return;
        }
        if !is_potential_slot(trimmed) && !visual {
            // Plain prose breaks the current paragraph group.
            self.flush_group();
            return;
        }
        self.next_paragraph_id += 1;
        let node_id = format!("p{}", self.next_paragraph_id);
        let label_text: String = p
            .segments
            .iter()
            .take_while(|s| !s.underlined)
            .map(|s| s.text.as_str())
            .collect();
        self.pending_group.push(ParagraphRun {
            node_id,
            paragraph_id: self.next_paragraph_id,
            raw_text: p.raw_text.clone(),
            label_text,
            segments: p.segments,
            part: part.to_string(),
            has_underline_placeholder: visual,
        });
    }

    fn flush_group(&mut self) {
        if self.pending_group.is_empty() {
            return;
        }
        let paras = std::mem::take(&mut self.pending_group);
        self.next_group_id += 1;
        let block_id = format!("g{}", self.next_group_id);

        let mut hasher = Sha256::new();
        for p in &paras {
            hasher.update(p.label_text.trim().as_bytes());
            hasher.update(if p.has_underline_placeholder { b"|u\n" } else { b"|p\n" });
        }
        let signature = hex::encode(hasher.finalize());

        self.blocks.push(StructuralBlock {
            block_id,
            kind: BlockKind::ParagraphGroup,
            signature,
            nodes: paras.into_iter().map(DocumentNode::Paragraph).collect(),
        });
    }

    fn push_table_block(&mut self, t: TableCapture) {
        if t.cells.is_empty() {
            return;
        }
        let mut hasher = Sha256::new();
        for c in &t.cells {
            if !c.is_slot && !c.raw_text.trim().is_empty() {
                hasher.update(c.raw_text.trim().as_bytes());
                hasher.update(b"\n");
            }
        }
        let signature = hex::encode(hasher.finalize());

        let mut cells = t.cells;
        for c in cells.iter_mut() {
            if c.is_slot {
                c.label_hint = label_hint(&t.grid, c.row, c.col);
            }
        }

        self.blocks.push(StructuralBlock {
            block_id: format!("t{}", t.table_id),
            kind: BlockKind::Table,
            signature,
            nodes: cells.into_iter().map(DocumentNode::Cell).collect(),
        });
    }

    fn finish(mut self) -> DocumentModel {
        self.flush_group();
        let mut node_index = HashMap::new();
        for (bi, b) in self.blocks.iter().enumerate() {
            for (ni, n) in b.nodes.iter().enumerate() {
                node_index.insert(n.node_id().to_string(), (bi, ni));
            }
        }
        DocumentModel {
            blocks: self.blocks,
            node_index,
        }
    }
}

fn finish_cell(t: &mut TableCapture, c: CellCapture, part: &str) {
    let col = c.col;
    t.next_col = col + c.span;
    if c.vmerge_continuation {
        return;
    }

    let raw_text = c
        .paragraphs
        .iter()
        .map(|p| p.raw_text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let segments: Vec<TextSegment> = c
        .paragraphs
        .iter()
        .flat_map(|p| p.segments.iter().cloned())
        .collect();

    let is_slot = is_potential_slot(raw_text.trim()) || has_visual_placeholder(&segments);
    if !is_slot {
        t.grid.insert((c.row, col), raw_text.trim().to_string());
    }

    let style_ref = if c.rpr_events.is_empty() {
        String::new()
    } else {
        serialize_events(&c.rpr_events)
    };

    t.cells.push(TableCell {
        node_id: cell_id(t.table_id, c.row, col),
        table_id: t.table_id,
        row: c.row,
        col,
        raw_text,
        style_ref,
        rpr_events: c.rpr_events,
        segments,
        part: part.to_string(),
        insert_event: c.first_para_insert,
        insert_wraps_paragraph: c.first_para_is_empty_elem,
        is_slot,
        label_hint: None,
    });
}

fn label_hint(grid: &HashMap<(usize, usize), String>, row: usize, col: usize) -> Option<String> {
    if col > 1 {
        if let Some(left) = grid.get(&(row, col - 1)) {
            if !left.is_empty() && left.chars().count() < 20 {
                return Some(format!("left: {left}"));
            }
        }
    }
    if row > 1 {
        if let Some(above) = grid.get(&(row - 1, col)) {
            if !above.is_empty() && above.chars().count() < 20 {
                return Some(format!("above: {above}"));
            }
        }
    }
    None
}

fn underline_value(attrs: &[(String, String)]) -> bool {
    match find_attr(attrs, "w:val") {
        Some(v) => {
            let v = v.trim().to_ascii_lowercase();
            !(v == "none" || v == "false" || v == "0")
        }
        None => true,
    }
}

fn serialize_events(events: &[XmlEvent]) -> String {
    let mut out = String::new();
    for ev in events {
        match ev {
            XmlEvent::Start { name, attrs } => {
                out.push('<');
                out.push_str(name);
                for (k, v) in attrs {
                    out.push_str(&format!(" {k}=\"{v}\""));
                }
                out.push('>');
            }
            XmlEvent::Empty { name, attrs } => {
                out.push('<');
                out.push_str(name);
                for (k, v) in attrs {
                    out.push_str(&format!(" {k}=\"{v}\""));
                }
                out.push_str("/>");
            }
            XmlEvent::End { name } => {
                out.push_str(&format!("</{name}>"));
            }
            XmlEvent::Text { text } => out.push_str(text),
            _ => {}
        }
    }
    out
}
