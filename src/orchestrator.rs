use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Notify};
use tracing::{info, instrument, warn};

use crate::advancer::Advancer;
use crate::detector::{Completion, CompletionDetector};
use crate::errors::{HostError, PollError};
use crate::events::{EventBus, PipelineEvent};
use crate::host::{HostClient, ProjectItem, PullRequest};
use crate::pipeline::PipelineStore;
use crate::pipeline_config::PipelineConfig;
use crate::util::{elapsed_at_least, BoundedMap, BoundedSet};

/// Error/last-error counters shared across phases (§4.6: "swallows
/// exceptions into a counter and `last_error`").
#[derive(Debug, Default, Clone)]
pub struct PollState {
    pub errors: u64,
    pub last_error: Option<String>,
    pub ticks: u64,
}

/// Owns every piece of in-memory state for one `(project, credentials)`
/// loop (Design Notes: no module-level statics). Starting a new
/// Orchestrator for the same tuple is the caller's responsibility to
/// serialize — see [`Orchestrator::stop`].
pub struct Orchestrator {
    host: Arc<dyn HostClient>,
    config: PipelineConfig,
    store: PipelineStore,
    events: EventBus,
    posted_outputs: BoundedSet<String>,
    claimed_child_prs: BoundedSet<String>,
    pending_assignments: BoundedMap<String, chrono::DateTime<Utc>>,
    system_marked_ready_prs: BoundedSet<i64>,
    recovery_last_attempt: BoundedMap<i64, chrono::DateTime<Utc>>,
    state: PollState,
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(host: Arc<dyn HostClient>, config: PipelineConfig) -> Self {
        Self {
            host,
            config,
            store: PipelineStore::new(),
            events: EventBus::default(),
            posted_outputs: BoundedSet::new(500),
            claimed_child_prs: BoundedSet::new(500),
            pending_assignments: BoundedMap::new(500),
            system_marked_ready_prs: BoundedSet::new(500),
            recovery_last_attempt: BoundedMap::new(200),
            state: PollState::default(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PollState {
        self.state.clone()
    }

    pub fn store(&self) -> &crate::pipeline::PipelineStore {
        &self.store
    }

    /// Flips the shared stop flag and wakes the poll task out of its
    /// sleep between ticks (§5 Cancellation).
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn stop_handle(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (self.stop_flag.clone(), self.notify.clone())
    }

    /// Runs ticks every `poll_interval_secs` until [`Orchestrator::stop`]
    /// is called.
    pub async fn run(&mut self) {
        let interval = std::time::Duration::from_secs(self.config.poll_interval_secs);
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                info!("poll loop stopping");
                return;
            }
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Executes one tick: phases 0 through 5 in order (§4.6, §5 ordering
    /// guarantees). Each phase's errors are recorded, never propagated.
    #[instrument(skip(self))]
    pub async fn tick(&mut self) {
        self.state.ticks += 1;

        let items = match self.host.list_project_items(&self.config.project).await {
            Ok(items) => items,
            Err(e) => {
                self.record_error(PollError::new("list_project_items", 0, e));
                return;
            }
        };

        self.phase0_artifact_posting(&items).await;

        for status in self.statuses_with_agents() {
            for item in items.iter().filter(|i| i.status == status) {
                if let Err(e) = self.sweep_issue(item.issue_id, &status).await {
                    self.record_error(PollError::new("sweep", item.issue_id, e));
                }
            }
        }

        for item in items.iter().filter(|i| i.status == self.config.review_status) {
            if let Err(e) = self.phase4_request_review(item.issue_id).await {
                self.record_error(PollError::new("code_review", item.issue_id, e));
            }
        }

        for item in items.iter().filter(|i| !self.config.is_terminal(&i.status)) {
            if let Err(e) = self.phase5_recovery(item.issue_id, &item.status).await {
                self.record_error(PollError::new("recovery", item.issue_id, e));
            }
        }
    }

    fn statuses_with_agents(&self) -> Vec<String> {
        self.config
            .statuses
            .iter()
            .filter(|s| s.name != self.config.review_status && !self.config.is_terminal(&s.name))
            .map(|s| s.name.clone())
            .collect()
    }

    fn record_error(&mut self, err: PollError) {
        warn!(phase = err.phase, issue = err.issue, error = %err.source, "phase error swallowed");
        self.state.errors += 1;
        self.state.last_error = Some(err.to_string());
    }

    /// Phase 0 (§4.6): reconstruct pipeline state first if missing (a
    /// restart must not skip an issue just because nothing is cached
    /// yet), then post artifacts and the Done marker once Tier B/C
    /// fires, running the merge safety-net first so Done is never posted
    /// ahead of a successful child-PR merge.
    async fn phase0_artifact_posting(&mut self, items: &[ProjectItem]) {
        let statuses_with_agents = self.statuses_with_agents();
        for item in items.iter().filter(|i| statuses_with_agents.contains(&i.status)) {
            if let Err(e) = self.phase0_for_issue(item.issue_id, &item.status).await {
                self.record_error(PollError::new("artifact_posting", item.issue_id, e));
            }
        }
    }

    async fn phase0_for_issue(&mut self, issue_id: i64, status: &str) -> Result<(), HostError> {
        let agents = self.config.agents_for(status).to_vec();
        if agents.is_empty() {
            return Ok(());
        }
        let project_id = self.config.project.clone();
        let pipeline = self
            .store
            .get_or_reconstruct(
                self.host.as_ref(),
                issue_id,
                &project_id,
                status,
                &agents,
                &mut self.claimed_child_prs,
            )
            .await?
            .clone();
        let Some(agent) = pipeline.current_agent().map(str::to_string) else {
            return Ok(());
        };

        let issue = self.host.get_issue(issue_id).await?;
        if issue.comments.iter().any(|c| c.has_done_marker(&agent)) {
            return Ok(());
        }

        let is_first_agent = pipeline.completed.is_empty();
        let completion = {
            let detector = CompletionDetector::new(self.host.as_ref());
            detector
                .check(&agent, &pipeline, is_first_agent, &self.system_marked_ready_prs)
                .await?
        };
        if completion != Completion::Done {
            return Ok(());
        }

        if !is_first_agent {
            let advancer = Advancer::new(self.host.as_ref(), &self.config, &self.events);
            advancer.merge_child_pr(&mut self.store, issue_id, &agent).await?;
        }

        let agent_pr = self.find_agent_pr(issue_id, &pipeline, is_first_agent).await?;
        let sub_issue_id = pipeline.sub_issues.get(&agent).copied();

        if let (Some(sub_issue_id), Some(pr)) = (sub_issue_id, &agent_pr) {
            self.post_artifacts(issue_id, &agent, sub_issue_id, pr).await?;
        }

        self.host
            .create_comment(issue_id, &format!("{agent}: Done!"))
            .await?;

        if let Some(sub_issue_id) = sub_issue_id {
            self.host.update_issue_state(sub_issue_id, false).await?;
        }

        Ok(())
    }

    async fn post_artifacts(
        &mut self,
        issue_id: i64,
        agent: &str,
        sub_issue_id: i64,
        pr: &PullRequest,
    ) -> Result<(), HostError> {
        let expected = self
            .config
            .artifacts
            .get(agent)
            .cloned()
            .unwrap_or_default();
        if expected.is_empty() {
            return Ok(());
        }
        let files = self.host.get_pr_files(pr.number).await.unwrap_or_default();
        for file in files.iter().filter(|f| expected.iter().any(|e| e == *f)) {
            let key = format!("{issue_id}:{agent}:{}", pr.number);
            if self.posted_outputs.contains(&key) {
                continue;
            }
            let contents = self
                .host
                .get_file_contents(file, &pr.head_sha)
                .await
                .unwrap_or_default();
            self.host
                .create_comment(sub_issue_id, &format!("**{file}**\n\n```\n{contents}\n```"))
                .await?;
            self.posted_outputs.insert(key);
        }
        Ok(())
    }

    async fn find_agent_pr(
        &self,
        issue_id: i64,
        pipeline: &crate::pipeline::Pipeline,
        is_first_agent: bool,
    ) -> Result<Option<PullRequest>, HostError> {
        Self::find_agent_pr_for(self.host.as_ref(), issue_id, pipeline, is_first_agent).await
    }

    async fn find_agent_pr_for(
        host: &dyn HostClient,
        issue_id: i64,
        pipeline: &crate::pipeline::Pipeline,
        is_first_agent: bool,
    ) -> Result<Option<PullRequest>, HostError> {
        let linked = host.list_linked_prs(issue_id).await?;
        if is_first_agent {
            Ok(linked.into_iter().find(|pr| pr.is_bot_authored))
        } else {
            let Some(main) = &pipeline.main_branch else {
                return Ok(None);
            };
            Ok(linked
                .into_iter()
                .find(|pr| pr.is_bot_authored && pr.number != main.main_pr_id))
        }
    }

    /// Phases 1-3 (§4.6): per-status sweep over a single issue.
    async fn sweep_issue(&mut self, issue_id: i64, status: &str) -> Result<(), HostError> {
        let agents = self.config.agents_for(status).to_vec();
        if agents.is_empty() {
            return Ok(());
        }
        let project_id = self.config.project.clone();
        let pipeline = self
            .store
            .get_or_reconstruct(
                self.host.as_ref(),
                issue_id,
                &project_id,
                status,
                &agents,
                &mut self.claimed_child_prs,
            )
            .await?
            .clone();

        let advancer = Advancer::new(self.host.as_ref(), &self.config, &self.events);

        if pipeline.is_complete() {
            advancer
                .transition_complete(
                    &mut self.store,
                    issue_id,
                    &project_id,
                    &mut self.pending_assignments,
                    &mut self.system_marked_ready_prs,
                )
                .await?;
            return Ok(());
        }

        let agent = pipeline
            .current_agent()
            .expect("non-complete pipeline has a current agent")
            .to_string();
        let is_first_agent = pipeline.completed.is_empty();
        let completion = {
            let detector = CompletionDetector::new(self.host.as_ref());
            detector
                .check(&agent, &pipeline, is_first_agent, &self.system_marked_ready_prs)
                .await?
        };

        match completion {
            Completion::Done => {
                advancer
                    .advance(
                        &mut self.store,
                        issue_id,
                        &mut self.pending_assignments,
                        &mut self.system_marked_ready_prs,
                    )
                    .await?;
            }
            Completion::Failed | Completion::NotDone => {
                if !pipeline.completed.is_empty() {
                    let has_pending = self
                        .pending_assignments
                        .get(&format!("{issue_id}:{agent}"))
                        .is_some();
                    let grace_secs = self.config.assignment_grace_secs;
                    if Self::should_reassign_lost_agent(
                        self.host.as_ref(),
                        issue_id,
                        &agent,
                        &pipeline,
                        has_pending,
                        grace_secs,
                    )
                    .await?
                    {
                        advancer
                            .assign(&mut self.store, issue_id, &agent, &mut self.pending_assignments)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// "catches assignments lost at restart" (§4.6 phase 1-3 closing
    /// clause): re-assign when there's no pending-assignment entry, no
    /// active tracking entry, and no existing child PR, respecting the
    /// assignment grace period.
    async fn should_reassign_lost_agent(
        host: &dyn HostClient,
        issue_id: i64,
        agent: &str,
        pipeline: &crate::pipeline::Pipeline,
        has_pending_assignment: bool,
        assignment_grace_secs: i64,
    ) -> Result<bool, HostError> {
        if has_pending_assignment {
            return Ok(false);
        }
        let tracking_active = host
            .get_issue(issue_id)
            .await
            .ok()
            .and_then(|issue| crate::tracking::current_active(&issue.body))
            .map(|active| active == agent)
            .unwrap_or(false);
        if tracking_active && !elapsed_at_least(pipeline.started_at, assignment_grace_secs, Utc::now()) {
            return Ok(false);
        }
        let has_child_pr = Self::find_agent_pr_for(host, issue_id, pipeline, false)
            .await?
            .is_some();
        Ok(!has_child_pr)
    }

    /// Phase 4 (§4.6): request a code review once per "In Review" PR.
    async fn phase4_request_review(&mut self, issue_id: i64) -> Result<(), HostError> {
        let linked = self.host.list_linked_prs(issue_id).await?;
        let Some(main_pr) = linked.into_iter().find(|pr| pr.is_bot_authored) else {
            return Ok(());
        };
        if self.host.has_code_review(main_pr.number).await? {
            return Ok(());
        }
        self.host.request_code_review(main_pr.number).await
    }

    /// Phase 5 (§4.6): cooldown-gated recovery for stalled agents.
    async fn phase5_recovery(&mut self, issue_id: i64, status: &str) -> Result<(), HostError> {
        let agents = self.config.agents_for(status).to_vec();
        if agents.is_empty() {
            return Ok(());
        }
        let issue = self.host.get_issue(issue_id).await?;
        let Some(expected_agent) = crate::tracking::current_active(&issue.body)
            .or_else(|| crate::tracking::next_pending(&issue.body))
        else {
            return Ok(());
        };
        if issue.comments.iter().any(|c| c.has_done_marker(&expected_agent)) {
            return Ok(());
        }

        let bot_assigned = self.host.is_bot_assigned(issue_id).await?;
        let has_draft_pr = self
            .host
            .list_linked_prs(issue_id)
            .await?
            .iter()
            .any(|pr| pr.is_bot_authored && pr.is_open && pr.is_draft);

        if bot_assigned && has_draft_pr {
            return Ok(());
        }

        if let Some(last) = self.recovery_last_attempt.get(&issue_id) {
            if !elapsed_at_least(*last, self.config.recovery_cooldown_secs, Utc::now()) {
                return Ok(());
            }
        }

        let project_id = self.config.project.clone();
        let pipeline = self
            .store
            .get_or_reconstruct(
                self.host.as_ref(),
                issue_id,
                &project_id,
                status,
                &agents,
                &mut self.claimed_child_prs,
            )
            .await?
            .clone();
        if pipeline.current_agent() != Some(expected_agent.as_str()) {
            return Ok(());
        }

        let advancer = Advancer::new(self.host.as_ref(), &self.config, &self.events);
        advancer
            .assign(
                &mut self.store,
                issue_id,
                &expected_agent,
                &mut self.pending_assignments,
            )
            .await?;
        self.recovery_last_attempt.insert(issue_id, Utc::now());
        self.events.publish(PipelineEvent::Recovery {
            project_id,
            issue: issue_id,
            agent: expected_agent,
            missing: vec![
                (!bot_assigned).then_some("bot_assignment"),
                (!has_draft_pr).then_some("draft_pr"),
            ]
            .into_iter()
            .flatten()
            .map(str::to_string)
            .collect(),
        });
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project", &self.config.project)
            .field("ticks", &self.state.ticks)
            .field("errors", &self.state.errors)
            .finish()
    }
}
