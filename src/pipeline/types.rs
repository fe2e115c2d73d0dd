use std::collections::HashMap;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainBranch {
    pub name: String,
    pub main_pr_id: i64,
    pub head_sha: String,
}

/// Per-issue, in-memory pipeline record (§3). Constructed exclusively
/// through [`Pipeline::rehydrate`] — no field is ever set after
/// construction via an ad hoc mutation helper (Design Notes).
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub issue_id: i64,
    pub project_id: String,
    pub status: String,
    pub agents: Vec<String>,
    pub current_index: usize,
    pub completed: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub sub_issues: HashMap<String, i64>,
    pub main_branch: Option<MainBranch>,
    pub assigned_sha: Option<String>,
}

impl Pipeline {
    /// The single obligation for producing a Pipeline, whether freshly
    /// created or reconstructed from the Host. `current_index` is always
    /// derived from `completed.len()` (invariant I1), never passed
    /// separately.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        issue_id: i64,
        project_id: String,
        status: String,
        agents: Vec<String>,
        completed: Vec<String>,
        started_at: DateTime<Utc>,
        sub_issues: HashMap<String, i64>,
        main_branch: Option<MainBranch>,
        assigned_sha: Option<String>,
    ) -> Self {
        let current_index = completed.len();
        Self {
            issue_id,
            project_id,
            status,
            agents,
            current_index,
            completed,
            started_at,
            sub_issues,
            main_branch,
            assigned_sha,
        }
    }

    pub fn new(issue_id: i64, project_id: String, status: String, agents: Vec<String>) -> Self {
        Self::rehydrate(
            issue_id,
            project_id,
            status,
            agents,
            Vec::new(),
            Utc::now(),
            HashMap::new(),
            None,
            None,
        )
    }

    pub fn current_agent(&self) -> Option<&str> {
        self.agents.get(self.current_index).map(String::as_str)
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.agents.len()
    }

    /// Records `agent` as completed and refreshes `started_at` (step 1 of
    /// §4.5). Does not touch the Host; callers are responsible for the
    /// remaining advance steps.
    pub fn record_completion(&mut self, agent: &str) {
        debug_assert_eq!(self.current_agent(), Some(agent));
        self.completed.push(agent.to_string());
        self.current_index = self.completed.len();
        self.started_at = Utc::now();
    }
}
