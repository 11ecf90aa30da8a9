use serde_json::json;

use crate::knowledge::KnowledgeRecord;
use crate::llm::ChatMessage;

const SYSTEM_PROMPT: &str = "You are a document filling assistant. You map knowledge-base \
fields onto positions of a document template. You only ever answer with a single JSON object.";

/// Build the mapping request: the knowledge records, the structural outline,
/// and the ground rules. The model answers with
/// `{"<block_id>": {"<field name>": "<node_id>", ...}, ...}`.
pub fn mapping_messages(
    description_json: &str,
    records: &[KnowledgeRecord],
) -> Vec<ChatMessage> {
    let knowledge = knowledge_context(records);
    let user = format!(
        "KNOWLEDGE RECORDS (one entry per entity):\n{knowledge}\n\n\
         DOCUMENT OUTLINE (blocks with the same signature are repetitions of \
         one pattern; `fill_here: true` marks positions that take a value):\n\
         {description_json}\n\n\
         Task: for every block that contains fillable positions, decide which \
         knowledge field belongs at which position.\n\
         Rules:\n\
         - Use only field names that appear in the knowledge records; never \
         invent fields or values.\n\
         - Use only node ids from the outline, and only ones marked \
         `fill_here: true`. Use the `hint` labels to decide what a position \
         expects.\n\
         - At most one field per node id. Leave a position out entirely when \
         no field matches; do not guess.\n\
         - Repeated blocks share field names; map each repetition separately \
         under its own block id. Entity selection is handled elsewhere.\n\
         Answer with exactly one JSON object of the form \
         {{\"<block_id>\": {{\"<field name>\": \"<node_id>\"}}}} and nothing else."
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// One corrective round after an unparseable reply: echo the bad output back
/// with the parse failure and ask again for bare JSON.
pub fn corrective_messages(
    original: &[ChatMessage],
    bad_output: &str,
    parse_error: &str,
) -> Vec<ChatMessage> {
    let mut messages = original.to_vec();
    messages.push(ChatMessage {
        role: "assistant".to_string(),
        content: bad_output.to_string(),
    });
    messages.push(ChatMessage::user(format!(
        "That reply could not be used: {parse_error}. Send the mapping again \
         as one valid JSON object, with no code fences, no commentary and no \
         trailing text."
    )));
    messages
}

fn knowledge_context(records: &[KnowledgeRecord]) -> String {
    let entries: Vec<serde_json::Value> = records
        .iter()
        .map(|r| {
            let fields: serde_json::Map<String, serde_json::Value> = r
                .fields
                .iter()
                .map(|f| (f.name.clone(), json!(f.value)))
                .collect();
            json!({ "entity_id": r.entity_id, "fields": fields })
        })
        .collect();
    serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{KnowledgeField, KnowledgeRecord};

    #[test]
    fn mapping_prompt_carries_records_and_outline() {
        let records = vec![KnowledgeRecord {
            entity_id: "张三".into(),
            fields: vec![KnowledgeField {
                name: "姓名".into(),
                value: "张三".into(),
            }],
        }];
        let messages = mapping_messages("{\"blocks\": []}", &records);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[1].content.contains("姓名"));
        assert!(messages[1].content.contains("\"blocks\""));
    }

    #[test]
    fn corrective_round_replays_the_bad_output() {
        let original = mapping_messages("{}", &[]);
        let messages = corrective_messages(&original, "not json", "no JSON object found");
        assert_eq!(messages.len(), original.len() + 2);
        assert_eq!(messages[original.len()].role, "assistant");
        assert_eq!(messages[original.len()].content, "not json");
        assert!(messages.last().unwrap().content.contains("no JSON object"));
    }
}
