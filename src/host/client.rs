use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::errors::HostError;

use super::types::*;
use super::HostClient;

const RETRY_SEED: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

/// Production Host Client. Backed by a single shared [`reqwest::Client`]
/// with a 30s timeout (§5), closed implicitly when the last clone is
/// dropped. All requests funnel through [`HttpHostClient::send`], which
/// applies the rate-limit/backoff policy from §4.1.
pub struct HttpHostClient {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpHostClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Sends a request built by `build`, retrying transient failures per
    /// §4.1: rate limits wait for the reported reset or exponential
    /// backoff (whichever is larger); 429/503 back off exponentially;
    /// everything else fails fast.
    #[instrument(skip(self, build))]
    async fn send<T, F>(&self, label: &str, build: F) -> Result<T, HostError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        let mut backoff = RETRY_SEED;
        loop {
            attempt += 1;
            let request = build(&self.http).bearer_auth(&self.token);
            let result = request.send().await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .map_err(|e| HostError::Unrecoverable(e.to_string()));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(HostError::NotFound {
                            kind: "resource",
                            id: label.to_string(),
                        });
                    }
                    if status == StatusCode::CONFLICT {
                        return Err(HostError::Conflict(format!("{label}: {status}")));
                    }
                    let retriable = status == StatusCode::TOO_MANY_REQUESTS
                        || status == StatusCode::SERVICE_UNAVAILABLE;
                    if retriable && attempt < MAX_ATTEMPTS {
                        let wait = reset_wait(&response).unwrap_or(backoff).max(backoff);
                        debug!(attempt, ?wait, "retrying transient host error");
                        tokio::time::sleep(wait).await;
                        backoff = (backoff * 2).min(RETRY_CAP);
                        continue;
                    }
                    if retriable {
                        warn!(label, "exhausted retries against host");
                        return Err(HostError::Transient(format!("{label}: {status}")));
                    }
                    return Err(HostError::Unrecoverable(format!("{label}: {status}")));
                }
                Err(e) if attempt < MAX_ATTEMPTS && e.is_timeout() => {
                    debug!(attempt, "retrying after timeout");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_CAP);
                    continue;
                }
                Err(e) => return Err(HostError::Transient(e.to_string())),
            }
        }
    }

    /// Same retry policy, for requests with no meaningful response body.
    async fn send_unit<F>(&self, label: &str, build: F) -> Result<(), HostError>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        self.send::<serde_json::Value, F>(label, build)
            .await
            .map(|_| ())
    }
}

fn reset_wait(response: &reqwest::Response) -> Option<Duration> {
    let header = response.headers().get("x-ratelimit-reset")?;
    let reset_epoch: i64 = header.to_str().ok()?.parse().ok()?;
    let now = chrono::Utc::now().timestamp();
    let secs = (reset_epoch - now).max(0) as u64;
    Some(Duration::from_secs(secs))
}

#[async_trait]
impl HostClient for HttpHostClient {
    async fn list_project_items(&self, project: &str) -> Result<Vec<ProjectItem>, HostError> {
        let url = self.url(&format!("/projects/{project}/items"));
        self.send("list_project_items", move |c| c.get(&url)).await
    }

    async fn get_issue(&self, id: i64) -> Result<Issue, HostError> {
        let url = self.url(&format!("/issues/{id}"));
        self.send("get_issue", move |c| c.get(&url)).await
    }

    async fn update_issue_body(&self, id: i64, body: &str) -> Result<(), HostError> {
        let url = self.url(&format!("/issues/{id}"));
        let payload = json!({ "body": body });
        self.send_unit("update_issue_body", move |c| c.patch(&url).json(&payload))
            .await
    }

    async fn update_issue_state(&self, id: i64, open: bool) -> Result<(), HostError> {
        let url = self.url(&format!("/issues/{id}"));
        let payload = json!({ "state": if open { "open" } else { "closed" } });
        self.send_unit("update_issue_state", move |c| c.patch(&url).json(&payload))
            .await
    }

    async fn create_comment(&self, issue_id: i64, body: &str) -> Result<(), HostError> {
        let url = self.url(&format!("/issues/{issue_id}/comments"));
        let payload = json!({ "body": body });
        self.send_unit("create_comment", move |c| c.post(&url).json(&payload))
            .await
    }

    async fn create_sub_issue(
        &self,
        parent_id: i64,
        title: &str,
        body: &str,
    ) -> Result<SubIssue, HostError> {
        let url = self.url(&format!("/issues/{parent_id}/sub_issues"));
        let payload = json!({ "title": title, "body": body });
        self.send("create_sub_issue", move |c| c.post(&url).json(&payload))
            .await
    }

    async fn list_sub_issues(&self, parent_id: i64) -> Result<Vec<SubIssue>, HostError> {
        let url = self.url(&format!("/issues/{parent_id}/sub_issues"));
        self.send("list_sub_issues", move |c| c.get(&url)).await
    }

    async fn list_linked_prs(&self, issue_id: i64) -> Result<Vec<PullRequest>, HostError> {
        let url = self.url(&format!("/issues/{issue_id}/pulls"));
        self.send("list_linked_prs", move |c| c.get(&url)).await
    }

    async fn get_pr(&self, number: i64) -> Result<PullRequest, HostError> {
        let url = self.url(&format!("/pulls/{number}"));
        self.send("get_pr", move |c| c.get(&url)).await
    }

    async fn get_pr_timeline(&self, number: i64) -> Result<Vec<TimelineEvent>, HostError> {
        let url = self.url(&format!("/pulls/{number}/timeline"));
        self.send("get_pr_timeline", move |c| c.get(&url)).await
    }

    async fn get_pr_files(&self, number: i64) -> Result<Vec<String>, HostError> {
        let url = self.url(&format!("/pulls/{number}/files"));
        self.send("get_pr_files", move |c| c.get(&url)).await
    }

    async fn get_file_contents(&self, path: &str, git_ref: &str) -> Result<String, HostError> {
        let url = self.url(&format!("/contents/{path}?ref={git_ref}"));
        #[derive(serde::Deserialize)]
        struct Raw {
            content: String,
        }
        let raw: Raw = self.send("get_file_contents", move |c| c.get(&url)).await?;
        Ok(raw.content)
    }

    async fn mark_pr_ready(&self, number: i64) -> Result<(), HostError> {
        let url = self.url(&format!("/pulls/{number}/ready"));
        self.send_unit("mark_pr_ready", move |c| c.post(&url)).await
    }

    async fn merge_pr(&self, number: i64, squash: bool, message: &str) -> Result<String, HostError> {
        let url = self.url(&format!("/pulls/{number}/merge"));
        let payload = json!({ "squash": squash, "message": message });
        #[derive(serde::Deserialize)]
        struct MergeResult {
            sha: String,
        }
        let result: MergeResult = self
            .send("merge_pr", move |c| c.put(&url).json(&payload))
            .await?;
        Ok(result.sha)
    }

    async fn update_pr_base(&self, number: i64, base: &str) -> Result<(), HostError> {
        let url = self.url(&format!("/pulls/{number}"));
        let payload = json!({ "base": base });
        self.send_unit("update_pr_base", move |c| c.patch(&url).json(&payload))
            .await
    }

    async fn delete_branch(&self, name: &str) -> Result<(), HostError> {
        let url = self.url(&format!("/branches/{name}"));
        self.send_unit("delete_branch", move |c| c.delete(&url)).await
    }

    async fn link_pr_to_issue(&self, pr_number: i64, issue_number: i64) -> Result<(), HostError> {
        let url = self.url(&format!("/pulls/{pr_number}"));
        let payload = json!({ "closes": issue_number });
        self.send_unit("link_pr_to_issue", move |c| c.patch(&url).json(&payload))
            .await
    }

    async fn assign_bot(
        &self,
        issue_id: i64,
        instructions: &AssignInstructions,
    ) -> Result<(), HostError> {
        if self.is_bot_assigned(issue_id).await? {
            self.unassign_bot(issue_id).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let url = self.url(&format!("/issues/{issue_id}/assign_bot"));
        let payload = json!({
            "agent_tag": instructions.agent_tag,
            "base_branch": instructions.base_branch,
            "instructions": instructions.instructions,
        });
        self.send_unit("assign_bot", move |c| c.post(&url).json(&payload))
            .await
    }

    async fn unassign_bot(&self, issue_id: i64) -> Result<(), HostError> {
        let url = self.url(&format!("/issues/{issue_id}/assign_bot"));
        self.send_unit("unassign_bot", move |c| c.delete(&url)).await
    }

    async fn is_bot_assigned(&self, issue_id: i64) -> Result<bool, HostError> {
        let url = self.url(&format!("/issues/{issue_id}/assign_bot"));
        #[derive(serde::Deserialize)]
        struct Assignment {
            assigned: bool,
        }
        let result: Assignment = self.send("is_bot_assigned", move |c| c.get(&url)).await?;
        Ok(result.assigned)
    }

    async fn request_code_review(&self, pr_number: i64) -> Result<(), HostError> {
        let url = self.url(&format!("/pulls/{pr_number}/request_review"));
        self.send_unit("request_code_review", move |c| c.post(&url))
            .await
    }

    async fn has_code_review(&self, pr_number: i64) -> Result<bool, HostError> {
        let url = self.url(&format!("/pulls/{pr_number}/reviews"));
        #[derive(serde::Deserialize)]
        struct Reviews {
            reviews: Vec<serde_json::Value>,
        }
        let result: Reviews = self.send("has_code_review", move |c| c.get(&url)).await?;
        Ok(!result.reviews.is_empty())
    }

    async fn update_item_status(&self, issue_id: i64, status: &str) -> Result<(), HostError> {
        let url = self.url(&format!("/issues/{issue_id}/status"));
        let payload = json!({ "status": status });
        self.send_unit("update_item_status", move |c| c.patch(&url).json(&payload))
            .await
    }
}
