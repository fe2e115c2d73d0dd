use std::collections::HashMap;

use crate::errors::HostError;
use crate::host::HostClient;
use crate::util::BoundedSet;

use super::reconstruct::reconstruct;
use super::types::Pipeline;

/// In-memory `issue_id -> Pipeline` map (§4.3), owned exclusively by the
/// poll task.
#[derive(Default)]
pub struct PipelineStore {
    pipelines: HashMap<i64, Pipeline>,
}

impl PipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, issue_id: i64) -> Option<&Pipeline> {
        self.pipelines.get(&issue_id)
    }

    pub fn get_mut(&mut self, issue_id: i64) -> Option<&mut Pipeline> {
        self.pipelines.get_mut(&issue_id)
    }

    pub fn remove(&mut self, issue_id: i64) -> Option<Pipeline> {
        self.pipelines.remove(&issue_id)
    }

    pub fn issue_ids(&self) -> Vec<i64> {
        self.pipelines.keys().copied().collect()
    }

    pub fn insert(&mut self, pipeline: Pipeline) {
        self.pipelines.insert(pipeline.issue_id, pipeline);
    }

    /// Returns the cached pipeline if its status already matches
    /// `board_status` (cheap path); otherwise either reconstructs it from
    /// the Host (no cached pipeline, or the cached one already finished
    /// its agent sequence) or, if a still-incomplete pipeline is cached
    /// under a different status, just relabels it (the Bot moved the
    /// board ahead of the pipeline — keep driving the original agent
    /// sequence rather than discarding its progress for the new status's
    /// agent list; see Scenario 6).
    pub async fn get_or_reconstruct(
        &mut self,
        host: &dyn HostClient,
        issue_id: i64,
        project_id: &str,
        board_status: &str,
        agents: &[String],
        claimed_child_prs: &mut BoundedSet<String>,
    ) -> Result<&Pipeline, HostError> {
        match self.pipelines.get_mut(&issue_id) {
            Some(existing) if existing.status == board_status => {}
            Some(existing) if !existing.is_complete() => {
                existing.status = board_status.to_string();
            }
            _ => {
                let pipeline = reconstruct(
                    host,
                    issue_id,
                    project_id,
                    board_status,
                    agents,
                    claimed_child_prs,
                )
                .await?;
                self.pipelines.insert(issue_id, pipeline);
            }
        }
        Ok(self.pipelines.get(&issue_id).expect("just inserted or cached"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHostClient;

    #[tokio::test]
    async fn cached_pipeline_with_matching_status_skips_reconstruction() {
        let fake = FakeHostClient::default();
        let mut store = PipelineStore::new();
        store.insert(Pipeline::new(
            42,
            "proj".to_string(),
            "Backlog".to_string(),
            vec!["A".to_string()],
        ));
        let mut claimed = BoundedSet::new(500);
        let pipeline = store
            .get_or_reconstruct(&fake, 42, "proj", "Backlog", &["A".to_string()], &mut claimed)
            .await
            .unwrap();
        assert_eq!(pipeline.status, "Backlog");
        // fake has no issue #42 registered; reconstruction would have errored.
    }

    #[tokio::test]
    async fn board_ahead_of_incomplete_pipeline_relabels_without_discarding_agents() {
        // Scenario 6: the Bot moved the board to "In Progress" by opening
        // a PR, but the cached pipeline is still mid-Backlog. The
        // In-Progress agent list must not replace Backlog's.
        let fake = FakeHostClient::default();
        let mut store = PipelineStore::new();
        store.insert(Pipeline::new(
            42,
            "proj".to_string(),
            "Backlog".to_string(),
            vec!["speckit.specify".to_string(), "speckit.plan".to_string()],
        ));
        let mut claimed = BoundedSet::new(500);
        let pipeline = store
            .get_or_reconstruct(
                &fake,
                42,
                "proj",
                "In Progress",
                &["speckit.implement".to_string()],
                &mut claimed,
            )
            .await
            .unwrap();
        assert_eq!(pipeline.status, "In Progress");
        assert_eq!(
            pipeline.agents,
            vec!["speckit.specify".to_string(), "speckit.plan".to_string()]
        );
        assert_eq!(pipeline.current_agent(), Some("speckit.specify"));
        // fake has no issue #42 registered; a real reconstruction would have errored.
    }

    #[tokio::test]
    async fn completed_pipeline_under_a_new_status_does_reconstruct() {
        let mut fake = FakeHostClient::default();
        fake.issues.lock().unwrap().insert(
            42,
            crate::host::Issue {
                id: 42,
                number: 42,
                title: "t".to_string(),
                body: String::new(),
                status: "In Progress".to_string(),
                comments: vec![],
            },
        );
        let mut store = PipelineStore::new();
        let mut done = Pipeline::new(
            42,
            "proj".to_string(),
            "Backlog".to_string(),
            vec!["A".to_string()],
        );
        done.record_completion("A");
        assert!(done.is_complete());
        store.insert(done);

        let mut claimed = BoundedSet::new(500);
        let pipeline = store
            .get_or_reconstruct(
                &fake,
                42,
                "proj",
                "In Progress",
                &["B".to_string()],
                &mut claimed,
            )
            .await
            .unwrap();
        assert_eq!(pipeline.status, "In Progress");
        assert_eq!(pipeline.agents, vec!["B".to_string()]);
    }
}
