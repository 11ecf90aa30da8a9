use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::config::ExhaustionPolicy;
use crate::docx::model::DocumentModel;
use crate::error::Warning;
use crate::knowledge::KnowledgeRecord;
use crate::resolve::ResolvedMapping;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntityAssignment {
    pub block_id: String,
    pub entity_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupState {
    Unassigned,
    Assigned,
    Exhausted,
}

struct GroupQueue {
    queue: Vec<String>,
    next: usize,
    state: GroupState,
}

impl GroupQueue {
    fn pop(&mut self, policy: ExhaustionPolicy) -> Option<String> {
        if self.queue.is_empty() {
            self.state = GroupState::Exhausted;
            return None;
        }
        if self.next >= self.queue.len() {
            self.state = GroupState::Exhausted;
            match policy {
                // Start over rather than stamping every extra block with the
                // last record.
                ExhaustionPolicy::Wrap => self.next = 0,
                ExhaustionPolicy::LeaveUnassigned => return None,
            }
        } else if self.state == GroupState::Unassigned {
            self.state = GroupState::Assigned;
        }
        let id = self.queue[self.next].clone();
        self.next += 1;
        Some(id)
    }
}

/// Hands one knowledge record to each repetition of a structural pattern, in
/// document order, so repeated tables receive distinct entities instead of
/// the first record over and over. Assignments are fixed once made.
pub struct EntityContextTracker {
    policy: ExhaustionPolicy,
    groups: HashMap<String, GroupQueue>,
    assignments: HashMap<String, String>,
}

impl EntityContextTracker {
    pub fn new(policy: ExhaustionPolicy) -> Self {
        Self {
            policy,
            groups: HashMap::new(),
            assignments: HashMap::new(),
        }
    }

    /// Resolve the full assignment for one pass. Blocks with no mappings need
    /// no entity and are skipped; everything else gets exactly one decision.
    pub fn assign(
        &mut self,
        records: &[KnowledgeRecord],
        model: &DocumentModel,
        resolved: &ResolvedMapping,
    ) -> (Vec<EntityAssignment>, Vec<Warning>) {
        let mapped_fields: HashMap<&str, Vec<&str>> = resolved
            .blocks
            .iter()
            .map(|b| {
                (
                    b.block_id.as_str(),
                    b.mappings.iter().map(|m| m.field_name.as_str()).collect(),
                )
            })
            .collect();

        let mut out: Vec<EntityAssignment> = Vec::new();
        let mut warnings: Vec<Warning> = Vec::new();

        for (signature, blocks) in model.signature_groups() {
            // Fields this pattern asks for, across all its repetitions.
            let mut wanted: HashSet<&str> = HashSet::new();
            for b in &blocks {
                if let Some(fields) = mapped_fields.get(b.block_id.as_str()) {
                    wanted.extend(fields.iter().copied());
                }
            }
            if wanted.is_empty() {
                continue;
            }

            let group = self.groups.entry(signature.clone()).or_insert_with(|| {
                let queue = records
                    .iter()
                    .filter(|r| wanted.iter().any(|f| r.has_field(f)))
                    .map(|r| r.entity_id.clone())
                    .collect();
                GroupQueue {
                    queue,
                    next: 0,
                    state: GroupState::Unassigned,
                }
            });

            for b in &blocks {
                if !mapped_fields.contains_key(b.block_id.as_str()) {
                    continue;
                }
                if let Some(existing) = self.assignments.get(&b.block_id) {
                    // Already decided earlier in the pass; never reassigned.
                    out.push(EntityAssignment {
                        block_id: b.block_id.clone(),
                        entity_id: existing.clone(),
                    });
                    continue;
                }
                match group.pop(self.policy) {
                    Some(entity_id) => {
                        self.assignments
                            .insert(b.block_id.clone(), entity_id.clone());
                        out.push(EntityAssignment {
                            block_id: b.block_id.clone(),
                            entity_id,
                        });
                    }
                    None => warnings.push(Warning::EntityExhausted {
                        block_id: b.block_id.clone(),
                    }),
                }
            }
        }
        (out, warnings)
    }

    pub fn entity_for(&self, block_id: &str) -> Option<&str> {
        self.assignments.get(block_id).map(|s| s.as_str())
    }

    #[cfg(test)]
    fn group_state(&self, signature: &str) -> Option<GroupState> {
        self.groups.get(signature).map(|g| g.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::model::DocumentModel;
    use crate::docx::package::TemplatePackage;
    use crate::knowledge::{KnowledgeField, KnowledgeRecord};
    use crate::resolve::resolve;
    use std::io::Write;

    fn record(id: &str) -> KnowledgeRecord {
        KnowledgeRecord {
            entity_id: id.to_string(),
            fields: vec![KnowledgeField {
                name: "姓名".to_string(),
                value: id.to_string(),
            }],
        }
    }

    fn model_with_tables(n: usize) -> DocumentModel {
        let row = "<w:tr><w:tc><w:p><w:r><w:t>姓名</w:t></w:r></w:p></w:tc>\
                   <w:tc><w:p><w:r><w:t>____</w:t></w:r></w:p></w:tc></w:tr>";
        let tables: String = (0..n).map(|_| format!("<w:tbl>{row}</w:tbl>")).collect();
        let xml = format!("<w:document><w:body>{tables}</w:body></w:document>");
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

    fn mapping_for_tables(model: &DocumentModel, n: usize) -> crate::resolve::ResolvedMapping {
        let entries: Vec<String> = (1..=n)
            .map(|i| format!("\"t{i}\": {{\"姓名\": \"t{i}r1c2\"}}"))
            .collect();
        resolve(&format!("{{{}}}", entries.join(",")), model).expect("resolve")
    }

    #[test]
    fn repeated_blocks_get_distinct_entities_in_order() {
        let model = model_with_tables(2);
        let resolved = mapping_for_tables(&model, 2);
        let records = vec![record("e1"), record("e2")];
        let mut tracker = EntityContextTracker::new(ExhaustionPolicy::Wrap);
        let (assignments, warnings) = tracker.assign(&records, &model, &resolved);

        assert!(warnings.is_empty());
        assert_eq!(
            assignments,
            vec![
                EntityAssignment {
                    block_id: "t1".into(),
                    entity_id: "e1".into()
                },
                EntityAssignment {
                    block_id: "t2".into(),
                    entity_id: "e2".into()
                },
            ]
        );
    }

    #[test]
    fn wrap_policy_reuses_from_the_start() {
        let model = model_with_tables(3);
        let resolved = mapping_for_tables(&model, 3);
        let records = vec![record("e1"), record("e2")];
        let mut tracker = EntityContextTracker::new(ExhaustionPolicy::Wrap);
        let (assignments, warnings) = tracker.assign(&records, &model, &resolved);

        assert!(warnings.is_empty());
        let ids: Vec<&str> = assignments.iter().map(|a| a.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e1"]);
        let sig = model.signature_groups()[0].0.clone();
        assert_eq!(tracker.group_state(&sig), Some(GroupState::Exhausted));
    }

    #[test]
    fn leave_unassigned_policy_flags_overflow_blocks() {
        let model = model_with_tables(3);
        let resolved = mapping_for_tables(&model, 3);
        let records = vec![record("e1")];
        let mut tracker = EntityContextTracker::new(ExhaustionPolicy::LeaveUnassigned);
        let (assignments, warnings) = tracker.assign(&records, &model, &resolved);

        assert_eq!(assignments.len(), 1);
        assert_eq!(warnings.len(), 2);
        assert!(warnings
            .iter()
            .all(|w| matches!(w, Warning::EntityExhausted { .. })));
    }

    #[test]
    fn records_without_relevant_fields_are_not_queued() {
        let model = model_with_tables(1);
        let resolved = mapping_for_tables(&model, 1);
        let off_topic = KnowledgeRecord {
            entity_id: "proj".to_string(),
            fields: vec![KnowledgeField {
                name: "项目编号".to_string(),
                value: "P-1".to_string(),
            }],
        };
        let records = vec![off_topic, record("e1")];
        let mut tracker = EntityContextTracker::new(ExhaustionPolicy::Wrap);
        let (assignments, _) = tracker.assign(&records, &model, &resolved);
        assert_eq!(assignments[0].entity_id, "e1");
    }

    #[test]
    fn assignment_is_stable_across_repeated_calls() {
        let model = model_with_tables(1);
        let resolved = mapping_for_tables(&model, 1);
        let records = vec![record("e1"), record("e2")];
        let mut tracker = EntityContextTracker::new(ExhaustionPolicy::Wrap);
        let (first, _) = tracker.assign(&records, &model, &resolved);
        let (second, _) = tracker.assign(&records, &model, &resolved);
        assert_eq!(first, second);
    }
}
