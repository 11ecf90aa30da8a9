use serde::Serialize;
use thiserror::Error;

/// Fatal failures of a fill pass. Anything here aborts before the output
/// package is written; `TemplateUnreadable` and `MappingParse` are raised
/// before any document mutation at all.
#[derive(Debug, Error)]
pub enum FillError {
    #[error("template unreadable: {0}")]
    TemplateUnreadable(String),

    #[error("knowledge base unreadable: {0}")]
    KnowledgeUnreadable(String),

    #[error("mapping parse failed: {0}")]
    MappingParse(String),

    #[error("mapping unavailable: {0}")]
    MappingUnavailable(String),

    #[error("entity records exhausted for block {block_id}")]
    EntityExhaustion { block_id: String },

    #[error("formatting preservation failed in {part}: {detail}")]
    FormattingPreservation { part: String, detail: String },

    #[error("config error: {0}")]
    Config(String),
}

/// Non-fatal conditions. These accumulate into the job summary instead of
/// aborting the pass, so every skipped or repaired node stays auditable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Mapping entry targeted a node id that does not exist (and was not
    /// repairable). The field is left unfilled.
    UnresolvedField { field_name: String, node_id: String },

    /// A later mapping entry targeted a node already claimed within the same
    /// block. The first entry won; this one was dropped.
    AmbiguousTarget { field_name: String, node_id: String },

    /// Off-by-one target id corrected against the node tree.
    RepairedTarget {
        field_name: String,
        from: String,
        to: String,
    },

    /// No unused entity left for this block under the configured policy.
    EntityExhausted { block_id: String },

    /// The assigned entity's record does not carry the mapped field.
    MissingField {
        entity_id: String,
        field_name: String,
        node_id: String,
    },

    /// Paragraph had no underline placeholder and append mode did not apply;
    /// the node was left untouched rather than guessed at.
    NoPlaceholder { node_id: String },

    /// The node's captured text no longer matched the document at write time.
    /// The write for this node was aborted; the rest of the pass continued.
    FormattingPreservation { node_id: String, detail: String },
}
