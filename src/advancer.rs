use chrono::Utc;
use tracing::{info, instrument};

use crate::errors::HostError;
use crate::events::{EventBus, PipelineEvent};
use crate::host::{AssignInstructions, HostClient};
use crate::pipeline::{MainBranch, Pipeline, PipelineStore};
use crate::pipeline_config::PipelineConfig;
use crate::tracking;
use crate::util::{BoundedMap, BoundedSet};

/// The atomic "agent X done" unit of work (§4.5). Every public entry
/// point either fully commits its side effects or returns an error with
/// nothing durable changed, so a retried tick never double-applies work.
pub struct Advancer<'a> {
    host: &'a dyn HostClient,
    config: &'a PipelineConfig,
    events: &'a EventBus,
}

impl<'a> Advancer<'a> {
    pub fn new(host: &'a dyn HostClient, config: &'a PipelineConfig, events: &'a EventBus) -> Self {
        Self {
            host,
            config,
            events,
        }
    }

    #[instrument(skip(self, store, pending_assignments, system_marked_ready_prs))]
    pub async fn advance(
        &self,
        store: &mut PipelineStore,
        issue_id: i64,
        pending_assignments: &mut BoundedMap<String, chrono::DateTime<Utc>>,
        system_marked_ready_prs: &mut BoundedSet<i64>,
    ) -> Result<(), HostError> {
        let pipeline = store.get(issue_id).ok_or(HostError::NotFound {
            kind: "pipeline",
            id: issue_id.to_string(),
        })?;
        let agent = pipeline
            .current_agent()
            .ok_or_else(|| HostError::Unrecoverable("advance called on a complete pipeline".into()))?
            .to_string();
        let project_id = pipeline.project_id.clone();
        let is_first_agent = pipeline.completed.is_empty();

        // Merge safety-net / first-PR capture MUST succeed (or be a no-op)
        // before anything else is committed — this is why Done is posted
        // only after the merge (§7 Conflict handling).
        if is_first_agent {
            self.capture_first_pr_if_missing(store, issue_id).await?;
        } else {
            self.merge_child_pr(store, issue_id, &agent).await?;
        }

        // Step 1: record completion in memory.
        let pipeline = store.get_mut(issue_id).unwrap();
        pipeline.record_completion(&agent);
        let sub_issue_id = pipeline.sub_issues.get(&agent).copied();
        let status = pipeline.status.clone();
        let next_agent = pipeline.current_agent().map(str::to_string);
        let is_complete = pipeline.is_complete();
        pending_assignments.remove(&format!("{issue_id}:{agent}"));

        // Step 2: mark done in the tracking table.
        let issue = self.host.get_issue(issue_id).await?;
        let updated_body = tracking::mark_done(&issue.body, &agent);
        self.host.update_issue_body(issue_id, &updated_body).await?;

        // Step 3: close the agent's sub-issue.
        if let Some(sub_id) = sub_issue_id {
            self.host.update_issue_state(sub_id, false).await?;
            let _ = self.host.update_item_status(sub_id, "Done").await;
        }

        // Step 5: publish agent_completed.
        self.events.publish(PipelineEvent::AgentCompleted {
            project_id: project_id.clone(),
            issue: issue_id,
            agent: agent.clone(),
            status: status.clone(),
            next_agent: next_agent.clone(),
            ts: Utc::now(),
        });
        info!(issue_id, agent = agent.as_str(), "agent completed");

        if !is_complete {
            // Step 6: assign the next agent.
            let next = next_agent.expect("pipeline not complete implies a current agent");
            self.assign(store, issue_id, &next, pending_assignments).await?;
            let pipeline = store.get(issue_id).unwrap();
            self.events.publish(PipelineEvent::AgentAssigned {
                project_id,
                issue: issue_id,
                agent: next.clone(),
                status: pipeline.status.clone(),
                next_agent: pipeline.agents.get(pipeline.current_index + 1).cloned(),
                ts: Utc::now(),
            });
        } else {
            // Step 7: remove the pipeline record and transition status.
            let removed = store.remove(issue_id);
            let main_branch = removed.and_then(|p| p.main_branch);
            self.transition_status(
                store,
                issue_id,
                &project_id,
                &status,
                main_branch,
                pending_assignments,
                system_marked_ready_prs,
            )
            .await?;
        }
        Ok(())
    }

    /// Invoked by the poll loop when a sweep finds a pipeline whose
    /// agents are already exhausted (§4.6 phase 1-3: "if the pipeline is
    /// complete, transition"). Equivalent to the tail of [`Self::advance`]
    /// without re-running the completion steps.
    pub async fn transition_complete(
        &self,
        store: &mut PipelineStore,
        issue_id: i64,
        project_id: &str,
        pending_assignments: &mut BoundedMap<String, chrono::DateTime<Utc>>,
        system_marked_ready_prs: &mut BoundedSet<i64>,
    ) -> Result<(), HostError> {
        let removed = store.remove(issue_id);
        let Some(removed) = removed else { return Ok(()) };
        self.transition_status(
            store,
            issue_id,
            project_id,
            &removed.status,
            removed.main_branch,
            pending_assignments,
            system_marked_ready_prs,
        )
        .await
    }

    /// First-PR capture (§4.5): the first bot-authored PR for an issue
    /// becomes its main branch, linked with a `Closes #<n>` reference.
    async fn capture_first_pr_if_missing(
        &self,
        store: &mut PipelineStore,
        issue_id: i64,
    ) -> Result<(), HostError> {
        if store
            .get(issue_id)
            .map(|p| p.main_branch.is_some())
            .unwrap_or(false)
        {
            return Ok(());
        }
        let linked = self.host.list_linked_prs(issue_id).await?;
        if let Some(pr) = linked.into_iter().find(|p| p.is_bot_authored) {
            self.host.link_pr_to_issue(pr.number, issue_id).await?;
            let pipeline = store.get_mut(issue_id).unwrap();
            pipeline.main_branch = Some(MainBranch {
                name: pr.head_ref.clone(),
                main_pr_id: pr.number,
                head_sha: pr.head_sha.clone(),
            });
            pipeline.assigned_sha = Some(pr.head_sha);
        }
        Ok(())
    }

    /// Merge safety-net (§4.5 step 4, scenario 2): finds the agent's
    /// child PR targeting the main branch (re-targeting from the
    /// platform default branch if needed), squash-merges it, and deletes
    /// the feature branch. A merge failure propagates as `Conflict` and
    /// the caller must not have committed any other advance step yet.
    pub(crate) async fn merge_child_pr(
        &self,
        store: &mut PipelineStore,
        issue_id: i64,
        agent: &str,
    ) -> Result<(), HostError> {
        let main_branch = match store.get(issue_id).and_then(|p| p.main_branch.clone()) {
            Some(m) => m,
            None => return Ok(()),
        };
        let linked = self.host.list_linked_prs(issue_id).await?;
        let child = linked
            .into_iter()
            .find(|pr| pr.is_open && pr.number != main_branch.main_pr_id);
        let Some(pr) = child else {
            return Ok(());
        };
        if pr.base_ref != main_branch.name {
            self.host.update_pr_base(pr.number, &main_branch.name).await?;
        }
        let message = format!("Merge {agent} changes into {}", main_branch.name);
        let merge_sha = self.host.merge_pr(pr.number, true, &message).await?;
        self.host.delete_branch(&pr.head_ref).await?;
        if let Some(pipeline) = store.get_mut(issue_id) {
            if let Some(mb) = &mut pipeline.main_branch {
                mb.head_sha = merge_sha;
            }
        }
        Ok(())
    }

    pub(crate) async fn assign(
        &self,
        store: &mut PipelineStore,
        issue_id: i64,
        agent: &str,
        pending_assignments: &mut BoundedMap<String, chrono::DateTime<Utc>>,
    ) -> Result<(), HostError> {
        let base_branch = store
            .get(issue_id)
            .and_then(|p| p.main_branch.as_ref())
            .map(|m| m.name.clone())
            .unwrap_or_else(|| "default".to_string());
        let issue = self.host.get_issue(issue_id).await?;
        let instructions_text = format!(
            "{}\n\n{}\n\n{}",
            issue.title,
            issue.body,
            issue
                .comments
                .iter()
                .map(|c| c.body.as_str())
                .collect::<Vec<_>>()
                .join("\n---\n")
        );
        let instructions = AssignInstructions {
            agent_tag: agent.to_string(),
            base_branch,
            instructions: instructions_text,
        };
        self.host.assign_bot(issue_id, &instructions).await?;
        let updated_body = tracking::mark_active(&issue.body, agent);
        self.host.update_issue_body(issue_id, &updated_body).await?;
        pending_assignments.insert(format!("{issue_id}:{agent}"), Utc::now());
        Ok(())
    }

    /// Status transition with pass-through (§4.5, L3).
    #[allow(clippy::too_many_arguments)]
    async fn transition_status(
        &self,
        store: &mut PipelineStore,
        issue_id: i64,
        project_id: &str,
        from_status: &str,
        main_branch: Option<MainBranch>,
        pending_assignments: &mut BoundedMap<String, chrono::DateTime<Utc>>,
        system_marked_ready_prs: &mut BoundedSet<i64>,
    ) -> Result<(), HostError> {
        let mut current = from_status.to_string();
        loop {
            let Some(next_status) = self.config.status_after(&current).map(str::to_string) else {
                return Ok(());
            };
            self.host.update_item_status(issue_id, &next_status).await?;
            self.events.publish(PipelineEvent::StatusUpdated {
                project_id: project_id.to_string(),
                issue: issue_id,
                from: current.clone(),
                to: next_status.clone(),
                triggered_by: "advancer",
            });

            if next_status == self.config.review_status {
                if let Some(main) = &main_branch {
                    self.host.mark_pr_ready(main.main_pr_id).await?;
                    system_marked_ready_prs.insert(main.main_pr_id);
                    self.host.request_code_review(main.main_pr_id).await?;
                }
                return Ok(());
            }

            let agents = self.config.agents_for(&next_status).to_vec();
            if agents.is_empty() {
                // Pass-through: keep scanning forward.
                current = next_status;
                continue;
            }

            let assigned_sha = main_branch.as_ref().map(|m| m.head_sha.clone());
            let pipeline = Pipeline::rehydrate(
                issue_id,
                project_id.to_string(),
                next_status.clone(),
                agents.clone(),
                Vec::new(),
                Utc::now(),
                Default::default(),
                main_branch.clone(),
                assigned_sha,
            );
            store.insert(pipeline);
            let first_agent = agents[0].clone();
            self.assign(store, issue_id, &first_agent, pending_assignments).await?;
            self.events.publish(PipelineEvent::AgentAssigned {
                project_id: project_id.to_string(),
                issue: issue_id,
                agent: first_agent,
                status: next_status,
                next_agent: agents.get(1).cloned(),
                ts: Utc::now(),
            });
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FakeHostClient, Issue, PullRequest};
    use crate::pipeline_config::PipelineConfig;

    const CONFIG_TOML: &str = r#"
        project = "demo"

        [[statuses]]
        name = "Backlog"
        agents = ["A", "B"]

        [[statuses]]
        name = "Ready"
        agents = []

        [[statuses]]
        name = "In Progress"
        agents = ["C"]

        [[statuses]]
        name = "In Review"
        agents = []
    "#;

    fn setup_issue(fake: &FakeHostClient, id: i64) {
        fake.issues.lock().unwrap().insert(
            id,
            Issue {
                id,
                number: id,
                title: "Add login page".to_string(),
                body: "| Status | Agent | State |\n| --- | --- | --- |\n| Backlog | A | ▶ |\n| Backlog | B | · |\n".to_string(),
                status: "Backlog".to_string(),
                comments: vec![],
            },
        );
    }

    #[tokio::test]
    async fn advance_mid_pipeline_assigns_next_agent_and_publishes_events() {
        let fake = FakeHostClient::default();
        setup_issue(&fake, 42);
        let config = PipelineConfig::from_toml_str(CONFIG_TOML).unwrap();
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let advancer = Advancer::new(&fake, &config, &events);

        let mut store = PipelineStore::new();
        store.insert(Pipeline::new(42, "demo".to_string(), "Backlog".to_string(), vec!["A".to_string(), "B".to_string()]));
        let mut pending = BoundedMap::new(200);
        let mut ready = BoundedSet::new(500);

        advancer
            .advance(&mut store, 42, &mut pending, &mut ready)
            .await
            .unwrap();

        let pipeline = store.get(42).unwrap();
        assert_eq!(pipeline.completed, vec!["A".to_string()]);
        assert_eq!(pipeline.current_agent(), Some("B"));

        let completed_event = rx.recv().await.unwrap();
        assert!(matches!(completed_event, PipelineEvent::AgentCompleted { .. }));
        let assigned_event = rx.recv().await.unwrap();
        assert!(matches!(assigned_event, PipelineEvent::AgentAssigned { .. }));
    }

    #[tokio::test]
    async fn advance_last_agent_transitions_status_and_assigns_next_status_agent() {
        let fake = FakeHostClient::default();
        setup_issue(&fake, 42);
        let config = PipelineConfig::from_toml_str(CONFIG_TOML).unwrap();
        let events = EventBus::new(16);
        let advancer = Advancer::new(&fake, &config, &events);

        let mut store = PipelineStore::new();
        store.insert(Pipeline::rehydrate(
            42,
            "demo".to_string(),
            "Backlog".to_string(),
            vec!["A".to_string(), "B".to_string()],
            vec!["A".to_string()],
            Utc::now(),
            Default::default(),
            None,
            None,
        ));
        let mut pending = BoundedMap::new(200);
        let mut ready = BoundedSet::new(500);

        advancer
            .advance(&mut store, 42, &mut pending, &mut ready)
            .await
            .unwrap();

        // Pass-through Ready (no agents) landed on In Progress with agent C.
        let pipeline = store.get(42).unwrap();
        assert_eq!(pipeline.status, "In Progress");
        assert_eq!(pipeline.current_agent(), Some("C"));
    }

    #[tokio::test]
    async fn failed_merge_aborts_advance_without_posting_done() {
        let fake = FakeHostClient::default();
        setup_issue(&fake, 7);
        fake.linked_prs.lock().unwrap().insert(
            7,
            vec![
                PullRequest {
                    number: 100,
                    title: "main".to_string(),
                    body: String::new(),
                    author: "bot".to_string(),
                    is_bot_authored: true,
                    is_draft: false,
                    is_open: true,
                    base_ref: "default".to_string(),
                    head_ref: "copilot/fix-7".to_string(),
                    head_sha: "sha-main".to_string(),
                },
                PullRequest {
                    number: 101,
                    title: "child".to_string(),
                    body: String::new(),
                    author: "bot".to_string(),
                    is_bot_authored: true,
                    is_draft: false,
                    is_open: true,
                    base_ref: "default".to_string(),
                    head_ref: "copilot/fix-7-child".to_string(),
                    head_sha: "sha-child".to_string(),
                },
            ],
        );
        *fake.merge_should_fail.lock().unwrap() = true;

        let config = PipelineConfig::from_toml_str(CONFIG_TOML).unwrap();
        let events = EventBus::new(16);
        let advancer = Advancer::new(&fake, &config, &events);

        let mut store = PipelineStore::new();
        store.insert(Pipeline::rehydrate(
            7,
            "demo".to_string(),
            "Backlog".to_string(),
            vec!["A".to_string(), "C".to_string()],
            vec!["A".to_string()],
            Utc::now(),
            Default::default(),
            Some(MainBranch {
                name: "copilot/fix-7".to_string(),
                main_pr_id: 100,
                head_sha: "sha-main".to_string(),
            }),
            Some("sha-main".to_string()),
        ));
        let mut pending = BoundedMap::new(200);
        let mut ready = BoundedSet::new(500);

        let result = advancer.advance(&mut store, 7, &mut pending, &mut ready).await;
        assert!(result.is_err());

        // No Done marker posted, pipeline untouched.
        assert!(fake.created_comments.lock().unwrap().is_empty());
        let pipeline = store.get(7).unwrap();
        assert_eq!(pipeline.completed, vec!["A".to_string()]);
    }
}
