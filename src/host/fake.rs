#![cfg(test)]
//! In-memory [`HostClient`] used across the workspace's test suites
//! (reconstruction, detection, advancing, the poll loop). Keeps every
//! piece of Host-side state a test might need to set up or assert on.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::HostError;

use super::types::*;
use super::HostClient;

#[derive(Default)]
pub struct FakeHostClient {
    pub issues: Mutex<HashMap<i64, Issue>>,
    /// Keyed by parent issue id.
    pub linked_prs: Mutex<HashMap<i64, Vec<PullRequest>>>,
    /// Keyed by parent issue id.
    pub sub_issues: Mutex<HashMap<i64, Vec<SubIssue>>>,
    /// Keyed by PR number.
    pub timelines: Mutex<HashMap<i64, Vec<TimelineEvent>>>,
    /// Keyed by PR number.
    pub pr_files: Mutex<HashMap<i64, Vec<String>>>,
    pub item_statuses: Mutex<HashMap<i64, String>>,
    pub project_items: Mutex<Vec<ProjectItem>>,
    pub bot_assigned: Mutex<HashMap<i64, bool>>,
    pub code_reviews: Mutex<HashMap<i64, bool>>,
    pub merged_prs: Mutex<Vec<i64>>,
    pub merge_should_fail: Mutex<bool>,
    pub deleted_branches: Mutex<Vec<String>>,
    pub rebased_prs: Mutex<HashMap<i64, String>>,
    pub created_comments: Mutex<Vec<(i64, String)>>,
    pub closed_issues: Mutex<Vec<i64>>,
    pub assignments: Mutex<Vec<(i64, AssignInstructions)>>,
    pub ready_prs: Mutex<Vec<i64>>,
    pub review_requests: Mutex<Vec<i64>>,
}

impl FakeHostClient {
    fn pr_by_number(&self, number: i64) -> Option<PullRequest> {
        self.linked_prs
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|pr| pr.number == number)
            .cloned()
    }
}

#[async_trait]
impl HostClient for FakeHostClient {
    async fn list_project_items(&self, _project: &str) -> Result<Vec<ProjectItem>, HostError> {
        Ok(self.project_items.lock().unwrap().clone())
    }

    async fn get_issue(&self, id: i64) -> Result<Issue, HostError> {
        self.issues
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(HostError::NotFound {
                kind: "issue",
                id: id.to_string(),
            })
    }

    async fn update_issue_body(&self, id: i64, body: &str) -> Result<(), HostError> {
        if let Some(issue) = self.issues.lock().unwrap().get_mut(&id) {
            issue.body = body.to_string();
        }
        Ok(())
    }

    async fn update_issue_state(&self, id: i64, open: bool) -> Result<(), HostError> {
        if !open {
            self.closed_issues.lock().unwrap().push(id);
        }
        Ok(())
    }

    async fn create_comment(&self, issue_id: i64, body: &str) -> Result<(), HostError> {
        self.created_comments
            .lock()
            .unwrap()
            .push((issue_id, body.to_string()));
        if let Some(issue) = self.issues.lock().unwrap().get_mut(&issue_id) {
            issue.comments.push(Comment {
                id: issue.comments.len() as i64 + 1,
                body: body.to_string(),
                author: "orchestrator".to_string(),
                created_at: chrono::Utc::now(),
            });
        }
        Ok(())
    }

    async fn create_sub_issue(
        &self,
        parent_id: i64,
        title: &str,
        _body: &str,
    ) -> Result<SubIssue, HostError> {
        let mut subs = self.sub_issues.lock().unwrap();
        let entry = subs.entry(parent_id).or_default();
        let number = 9000 + entry.len() as i64;
        let sub = SubIssue {
            id: number,
            number,
            title: title.to_string(),
            parent_issue_id: parent_id,
        };
        entry.push(sub.clone());
        Ok(sub)
    }

    async fn list_sub_issues(&self, parent_id: i64) -> Result<Vec<SubIssue>, HostError> {
        Ok(self
            .sub_issues
            .lock()
            .unwrap()
            .get(&parent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_linked_prs(&self, issue_id: i64) -> Result<Vec<PullRequest>, HostError> {
        Ok(self
            .linked_prs
            .lock()
            .unwrap()
            .get(&issue_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_pr(&self, number: i64) -> Result<PullRequest, HostError> {
        self.pr_by_number(number).ok_or(HostError::NotFound {
            kind: "pull request",
            id: number.to_string(),
        })
    }

    async fn get_pr_timeline(&self, number: i64) -> Result<Vec<TimelineEvent>, HostError> {
        Ok(self
            .timelines
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_pr_files(&self, number: i64) -> Result<Vec<String>, HostError> {
        Ok(self
            .pr_files
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_file_contents(&self, _path: &str, _git_ref: &str) -> Result<String, HostError> {
        Ok(String::new())
    }

    async fn mark_pr_ready(&self, number: i64) -> Result<(), HostError> {
        self.ready_prs.lock().unwrap().push(number);
        for prs in self.linked_prs.lock().unwrap().values_mut() {
            for pr in prs.iter_mut() {
                if pr.number == number {
                    pr.is_draft = false;
                }
            }
        }
        Ok(())
    }

    async fn merge_pr(&self, number: i64, _squash: bool, _message: &str) -> Result<String, HostError> {
        if *self.merge_should_fail.lock().unwrap() {
            return Err(HostError::Conflict(format!("merge of #{number} rejected")));
        }
        self.merged_prs.lock().unwrap().push(number);
        for prs in self.linked_prs.lock().unwrap().values_mut() {
            for pr in prs.iter_mut() {
                if pr.number == number {
                    pr.is_open = false;
                }
            }
        }
        Ok(format!("merge-sha-{number}"))
    }

    async fn update_pr_base(&self, number: i64, base: &str) -> Result<(), HostError> {
        self.rebased_prs
            .lock()
            .unwrap()
            .insert(number, base.to_string());
        for prs in self.linked_prs.lock().unwrap().values_mut() {
            for pr in prs.iter_mut() {
                if pr.number == number {
                    pr.base_ref = base.to_string();
                }
            }
        }
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> Result<(), HostError> {
        self.deleted_branches.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn link_pr_to_issue(&self, _pr_number: i64, _issue_number: i64) -> Result<(), HostError> {
        Ok(())
    }

    async fn assign_bot(
        &self,
        issue_id: i64,
        instructions: &AssignInstructions,
    ) -> Result<(), HostError> {
        self.assignments
            .lock()
            .unwrap()
            .push((issue_id, instructions.clone()));
        self.bot_assigned.lock().unwrap().insert(issue_id, true);
        Ok(())
    }

    async fn unassign_bot(&self, issue_id: i64) -> Result<(), HostError> {
        self.bot_assigned.lock().unwrap().insert(issue_id, false);
        Ok(())
    }

    async fn is_bot_assigned(&self, issue_id: i64) -> Result<bool, HostError> {
        Ok(*self
            .bot_assigned
            .lock()
            .unwrap()
            .get(&issue_id)
            .unwrap_or(&false))
    }

    async fn request_code_review(&self, pr_number: i64) -> Result<(), HostError> {
        self.review_requests.lock().unwrap().push(pr_number);
        self.code_reviews.lock().unwrap().insert(pr_number, true);
        Ok(())
    }

    async fn has_code_review(&self, pr_number: i64) -> Result<bool, HostError> {
        Ok(*self
            .code_reviews
            .lock()
            .unwrap()
            .get(&pr_number)
            .unwrap_or(&false))
    }

    async fn update_item_status(&self, issue_id: i64, status: &str) -> Result<(), HostError> {
        self.item_statuses
            .lock()
            .unwrap()
            .insert(issue_id, status.to_string());
        if let Some(issue) = self.issues.lock().unwrap().get_mut(&issue_id) {
            issue.status = status.to_string();
        }
        Ok(())
    }
}
