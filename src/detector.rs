use chrono::{DateTime, Utc};
use tracing::warn;

use crate::errors::HostError;
use crate::host::{HostClient, TimelineEventKind};
use crate::pipeline::Pipeline;
use crate::util::BoundedSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The agent has not finished yet.
    NotDone,
    /// The agent has finished; safe to advance.
    Done,
    /// The Bot disengaged without producing a new commit — a likely
    /// failure, but never grounds for advancing (§4.4 Tier C guard).
    Failed,
}

/// Decides whether `agent` has finished work on `issue`, per the
/// three-tier scheme in §4.4. Any tier firing returns `Done`.
pub struct CompletionDetector<'a> {
    host: &'a dyn HostClient,
}

impl<'a> CompletionDetector<'a> {
    pub fn new(host: &'a dyn HostClient) -> Self {
        Self { host }
    }

    pub async fn check(
        &self,
        agent: &str,
        pipeline: &Pipeline,
        is_first_agent: bool,
        system_marked_ready_prs: &BoundedSet<i64>,
    ) -> Result<Completion, HostError> {
        let issue = self.host.get_issue(pipeline.issue_id).await?;

        // Tier A: parent issue preferred, sub-issue is a legacy fallback
        // (see DESIGN.md for why this order was chosen over the
        // original source's sub-issue-first behavior).
        if issue.comments.iter().any(|c| c.has_done_marker(agent)) {
            return Ok(Completion::Done);
        }
        if let Some(&sub_issue_id) = pipeline.sub_issues.get(agent) {
            if let Ok(sub_issue) = self.host.get_issue(sub_issue_id).await {
                if sub_issue.comments.iter().any(|c| c.has_done_marker(agent)) {
                    return Ok(Completion::Done);
                }
            }
        }

        // Tier B: fresh PR signal.
        let linked_prs = self.host.list_linked_prs(pipeline.issue_id).await?;
        let candidate_prs: Vec<_> = if is_first_agent {
            linked_prs.iter().filter(|pr| pr.is_bot_authored).collect()
        } else {
            let main_branch = match &pipeline.main_branch {
                Some(m) => m,
                None => return Ok(Completion::NotDone),
            };
            linked_prs
                .iter()
                .filter(|pr| {
                    pr.is_bot_authored && pr.is_open && pr.number != main_branch.main_pr_id
                })
                .collect()
        };

        for pr in &candidate_prs {
            if !pr.is_draft && !system_marked_ready_prs.contains(&pr.number) {
                return Ok(Completion::Done);
            }
            let timeline = self.host.get_pr_timeline(pr.number).await?;
            if self.has_fresh_completion_event(&timeline, pipeline.started_at) {
                return Ok(Completion::Done);
            }
        }

        // Tier C: commit + disengagement, only applies to subsequent
        // agents working directly on the main PR branch (no child PR).
        if !is_first_agent && candidate_prs.is_empty() {
            if let Some(main_branch) = &pipeline.main_branch {
                let main_pr = self.host.get_pr(main_branch.main_pr_id).await?;
                let bot_assigned = self.host.is_bot_assigned(pipeline.issue_id).await?;
                let sha_changed = pipeline
                    .assigned_sha
                    .as_deref()
                    .is_some_and(|sha| sha != main_pr.head_sha);

                if sha_changed && !bot_assigned {
                    return Ok(Completion::Done);
                }
                if !sha_changed && !bot_assigned {
                    warn!(
                        issue = pipeline.issue_id,
                        agent, "bot disengaged with no new commit; treating as failed, not advancing"
                    );
                    return Ok(Completion::Failed);
                }
            }
        }

        Ok(Completion::NotDone)
    }

    fn has_fresh_completion_event(
        &self,
        timeline: &[crate::host::TimelineEvent],
        started_at: DateTime<Utc>,
    ) -> bool {
        timeline.iter().any(|event| {
            if event.created_at <= started_at {
                return false;
            }
            match event.kind {
                TimelineEventKind::WorkFinished => true,
                TimelineEventKind::ReviewRequested => {
                    event.requester.as_deref() == Some("bot")
                }
                TimelineEventKind::Other => false,
            }
        })
    }
}
