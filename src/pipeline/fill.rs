use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Serialize;

use crate::config::JobConfig;
use crate::describe;
use crate::docx::model::{DocumentModel, DocumentNode};
use crate::docx::package::TemplatePackage;
use crate::docx::write::{write_cell, write_paragraph};
use crate::docx::xml::PendingInsertions;
use crate::entity::{EntityAssignment, EntityContextTracker};
use crate::error::{FillError, Warning};
use crate::knowledge::KnowledgeRecord;
use crate::llm::LlmClient;
use crate::pipeline::prompt::{corrective_messages, mapping_messages};
use crate::progress::ConsoleProgress;
use crate::resolve::{resolve, ResolvedMapping};

/// What one pass did, node by node: everything filled, left blank or
/// repaired shows up here, so a failed expectation is auditable instead of
/// silent.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FillSummary {
    pub written: Vec<String>,
    pub unresolved: Vec<String>,
    pub repaired: Vec<String>,
    pub assignments: Vec<EntityAssignment>,
    pub warnings: Vec<Warning>,
}

/// Drives one fill pass, sequential and deterministic: build tree, describe,
/// obtain mapping, resolve, assign entities, write in document order. The
/// document is only mutated after the mapping has fully resolved, so any
/// failure up to that point leaves the template untouched.
pub struct FillPass<'a> {
    config: JobConfig,
    client: &'a dyn LlmClient,
    progress: &'a ConsoleProgress,
}

impl<'a> FillPass<'a> {
    pub fn new(config: JobConfig, client: &'a dyn LlmClient, progress: &'a ConsoleProgress) -> Self {
        Self {
            config,
            client,
            progress,
        }
    }

    pub fn run_path(
        &self,
        template: &Path,
        records: &[KnowledgeRecord],
        output: &Path,
    ) -> anyhow::Result<FillSummary> {
        use anyhow::Context;
        let bytes = std::fs::read(template)
            .with_context(|| format!("read template: {}", template.display()))?;
        let (filled, summary) = self.run_bytes(&bytes, records)?;
        std::fs::write(output, filled)
            .with_context(|| format!("write output: {}", output.display()))?;
        Ok(summary)
    }

    pub fn run_bytes(
        &self,
        template: &[u8],
        records: &[KnowledgeRecord],
    ) -> Result<(Vec<u8>, FillSummary), FillError> {
        let pkg = TemplatePackage::read_bytes(template)?;
        let (model, mut parts) = DocumentModel::build(&pkg)?;
        let block_count = model.nodes_by_block().count();
        self.progress
            .info(format!("template parsed: {block_count} structural blocks"));

        let description = describe::to_json(&describe::describe(&model));
        let resolved = self.obtain_mapping(&description, records, &model)?;
        self.progress.info(format!(
            "mapping resolved: {} blocks, {} warnings",
            resolved.blocks.len(),
            resolved.warnings.len()
        ));

        let mut tracker = EntityContextTracker::new(self.config.exhaustion_policy);
        let (assignments, entity_warnings) = tracker.assign(records, &model, &resolved);
        for a in &assignments {
            self.progress
                .info(format!("block {} -> entity {}", a.block_id, a.entity_id));
        }

        let mut summary = FillSummary {
            assignments,
            ..FillSummary::default()
        };
        summary.warnings.extend(resolved.warnings.iter().cloned());
        summary.warnings.extend(entity_warnings);

        let mut insertions: HashMap<String, PendingInsertions> = HashMap::new();
        let mut touched: HashSet<String> = HashSet::new();
        let total: usize = resolved.blocks.iter().map(|b| b.mappings.len()).sum();
        let mut done = 0usize;

        for block in &resolved.blocks {
            let Some(entity_id) = tracker.entity_for(&block.block_id) else {
                // Exhausted under leave-unassigned; already in warnings.
                for m in &block.mappings {
                    summary.unresolved.push(m.target_node_id.clone());
                }
                continue;
            };
            let record = records.iter().find(|r| r.entity_id == entity_id);
            for m in &block.mappings {
                done += 1;
                self.progress.step("filling", done, total);
                let value = record.and_then(|r| r.field(&m.field_name));
                let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
                    summary.warnings.push(Warning::MissingField {
                        entity_id: entity_id.to_string(),
                        field_name: m.field_name.clone(),
                        node_id: m.target_node_id.clone(),
                    });
                    summary.unresolved.push(m.target_node_id.clone());
                    continue;
                };
                let Some(node) = model.node(&m.target_node_id) else {
                    continue;
                };
                let outcome = match node {
                    DocumentNode::Cell(cell) => {
                        write_cell(&mut parts, &mut insertions, cell, value)
                    }
                    DocumentNode::Paragraph(para) => {
                        write_paragraph(&mut parts, para, value, self.config.write_mode)
                    }
                };
                match outcome {
                    Ok(()) => {
                        touched.insert(node_part(node).to_string());
                        summary.written.push(m.target_node_id.clone());
                    }
                    Err(w) => {
                        self.progress
                            .warn(format!("{}: skipped ({w:?})", m.target_node_id));
                        summary.unresolved.push(m.target_node_id.clone());
                        summary.warnings.push(w);
                    }
                }
            }
        }

        summary.repaired = summary
            .warnings
            .iter()
            .filter_map(|w| match w {
                Warning::RepairedTarget { to, .. } => Some(to.clone()),
                _ => None,
            })
            .collect();

        // Anything beyond w:t text changing here would corrupt the document;
        // refuse to emit output instead.
        for name in touched.iter() {
            if let Some(part) = parts.get(name) {
                part.verify_structure_unchanged()?;
            }
        }

        let mut replacements: HashMap<String, Vec<u8>> = HashMap::new();
        let empty = PendingInsertions::default();
        let replace_names: HashSet<&String> = touched.iter().chain(insertions.keys()).collect();
        for name in replace_names {
            let Some(part) = parts.get(name) else { continue };
            let ins = insertions.get(name).unwrap_or(&empty);
            let bytes = part.serialize_with(ins).map_err(|e| {
                FillError::FormattingPreservation {
                    part: name.clone(),
                    detail: format!("{e:#}"),
                }
            })?;
            replacements.insert(name.clone(), bytes);
        }

        let out = pkg.write_bytes(&replacements).map_err(|e| {
            FillError::FormattingPreservation {
                part: "package".to_string(),
                detail: format!("{e:#}"),
            }
        })?;
        self.progress.info(format!(
            "pass complete: {} written, {} unresolved, {} warnings",
            summary.written.len(),
            summary.unresolved.len(),
            summary.warnings.len()
        ));
        Ok((out, summary))
    }

    /// One model call, plus exactly one corrective round when the payload
    /// does not parse. A second bad payload fails the pass.
    fn obtain_mapping(
        &self,
        description_json: &str,
        records: &[KnowledgeRecord],
        model: &DocumentModel,
    ) -> Result<ResolvedMapping, FillError> {
        let messages = mapping_messages(description_json, records);
        let raw = self.client.chat(&messages)?;
        match resolve(&raw, model) {
            Ok(resolved) => Ok(resolved),
            Err(FillError::MappingParse(parse_error)) => {
                self.progress
                    .warn(format!("mapping unparseable, re-prompting once: {parse_error}"));
                let retry = corrective_messages(&messages, &raw, &parse_error);
                let raw2 = self.client.chat(&retry)?;
                resolve(&raw2, model)
            }
            Err(other) => Err(other),
        }
    }
}

fn node_part(node: &DocumentNode) -> &str {
    match node {
        DocumentNode::Cell(c) => &c.part,
        DocumentNode::Paragraph(p) => &p.part,
    }
}
