mod client;
#[cfg(test)]
pub mod fake;
pub mod types;

pub use client::HttpHostClient;
#[cfg(test)]
pub use fake::FakeHostClient;
pub use types::*;

use async_trait::async_trait;

use crate::errors::HostError;

/// Interface the Advancer, Detector and Poll Loop depend on (Design Notes:
/// cyclic imports are cut by treating the Host Client as an interface
/// rather than a concrete type). The production implementation is
/// [`HttpHostClient`]; tests use an in-memory fake.
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn list_project_items(&self, project: &str) -> Result<Vec<ProjectItem>, HostError>;
    async fn get_issue(&self, id: i64) -> Result<Issue, HostError>;
    async fn update_issue_body(&self, id: i64, body: &str) -> Result<(), HostError>;
    async fn update_issue_state(&self, id: i64, open: bool) -> Result<(), HostError>;
    async fn create_comment(&self, issue_id: i64, body: &str) -> Result<(), HostError>;
    async fn create_sub_issue(
        &self,
        parent_id: i64,
        title: &str,
        body: &str,
    ) -> Result<SubIssue, HostError>;
    async fn list_sub_issues(&self, parent_id: i64) -> Result<Vec<SubIssue>, HostError>;
    async fn list_linked_prs(&self, issue_id: i64) -> Result<Vec<PullRequest>, HostError>;
    async fn get_pr(&self, number: i64) -> Result<PullRequest, HostError>;
    async fn get_pr_timeline(&self, number: i64) -> Result<Vec<TimelineEvent>, HostError>;
    async fn get_pr_files(&self, number: i64) -> Result<Vec<String>, HostError>;
    async fn get_file_contents(&self, path: &str, git_ref: &str) -> Result<String, HostError>;
    async fn mark_pr_ready(&self, number: i64) -> Result<(), HostError>;
    /// Returns the merge commit SHA.
    async fn merge_pr(&self, number: i64, squash: bool, message: &str) -> Result<String, HostError>;
    async fn update_pr_base(&self, number: i64, base: &str) -> Result<(), HostError>;
    async fn delete_branch(&self, name: &str) -> Result<(), HostError>;
    async fn link_pr_to_issue(&self, pr_number: i64, issue_number: i64) -> Result<(), HostError>;
    async fn assign_bot(
        &self,
        issue_id: i64,
        instructions: &AssignInstructions,
    ) -> Result<(), HostError>;
    async fn unassign_bot(&self, issue_id: i64) -> Result<(), HostError>;
    async fn is_bot_assigned(&self, issue_id: i64) -> Result<bool, HostError>;
    async fn request_code_review(&self, pr_number: i64) -> Result<(), HostError>;
    async fn has_code_review(&self, pr_number: i64) -> Result<bool, HostError>;
    async fn update_item_status(&self, issue_id: i64, status: &str) -> Result<(), HostError>;
}
