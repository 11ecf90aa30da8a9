use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::FillError;
use crate::knowledge::KnowledgeRecord;
use crate::llm::{client_from_config, LlmClient};
use crate::pipeline::{FillPass, FillSummary};
use crate::progress::ConsoleProgress;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Done { summary: FillSummary },
    Failed { error: String },
}

struct JobEntry {
    status: JobStatus,
    result: Option<Vec<u8>>,
}

/// In-memory job surface for UI/CLI collaborators. A pass runs synchronously
/// on submit (the pipeline is single-threaded by design); independent
/// managers share no state, so callers may run one per worker if they want
/// concurrency across documents.
#[derive(Default)]
pub struct JobManager {
    jobs: HashMap<String, JobEntry>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(
        &mut self,
        template: &[u8],
        records: &[KnowledgeRecord],
        config: JobConfig,
    ) -> Result<String, FillError> {
        let client = client_from_config(&config)?;
        Ok(self.submit_with_client(template, records, config, client.as_ref()))
    }

    /// Same as `submit` with the model boundary injected; tests script the
    /// client instead of standing up a server.
    pub fn submit_with_client(
        &mut self,
        template: &[u8],
        records: &[KnowledgeRecord],
        config: JobConfig,
        client: &dyn LlmClient,
    ) -> String {
        let job_id = Uuid::new_v4().to_string();
        self.jobs.insert(
            job_id.clone(),
            JobEntry {
                status: JobStatus::Pending,
                result: None,
            },
        );

        let progress = ConsoleProgress::new(false);
        let pass = FillPass::new(config, client, &progress);
        let entry = self.jobs.get_mut(&job_id).expect("job just inserted");
        match pass.run_bytes(template, records) {
            Ok((bytes, summary)) => {
                entry.status = JobStatus::Done { summary };
                entry.result = Some(bytes);
            }
            Err(e) => {
                entry.status = JobStatus::Failed {
                    error: e.to_string(),
                };
            }
        }
        job_id
    }

    pub fn status(&self, job_id: &str) -> Option<&JobStatus> {
        self.jobs.get(job_id).map(|j| &j.status)
    }

    pub fn result(&self, job_id: &str) -> Option<&[u8]> {
        self.jobs.get(job_id).and_then(|j| j.result.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FillError;
    use crate::llm::ChatMessage;

    struct ScriptedClient(String);

    impl LlmClient for ScriptedClient {
        fn chat(&self, _messages: &[ChatMessage]) -> Result<String, FillError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn unreadable_template_fails_the_job() {
        let mut mgr = JobManager::new();
        let client = ScriptedClient("{}".to_string());
        let id = mgr.submit_with_client(b"not a docx", &[], JobConfig::default(), &client);
        match mgr.status(&id) {
            Some(JobStatus::Failed { error }) => {
                assert!(error.contains("template unreadable"));
            }
            other => panic!("expected failed status, got {other:?}"),
        }
        assert!(mgr.result(&id).is_none());
    }

    #[test]
    fn unknown_job_id_has_no_status() {
        let mgr = JobManager::new();
        assert!(mgr.status("nope").is_none());
    }
}
