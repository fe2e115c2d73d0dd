use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub body: String,
    pub status: String,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn has_done_marker(&self, agent: &str) -> bool {
        self.body.contains(&format!("{agent}: Done!"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub author: String,
    pub is_bot_authored: bool,
    pub is_draft: bool,
    pub is_open: bool,
    pub base_ref: String,
    pub head_ref: String,
    pub head_sha: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    WorkFinished,
    ReviewRequested,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub kind: TimelineEventKind,
    pub requester: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectItem {
    pub issue_id: i64,
    pub issue_number: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubIssue {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub parent_issue_id: i64,
}

/// Parses the `[<agent>] ` prefix convention described in §3/§6.
pub fn agent_from_sub_issue_title(title: &str) -> Option<&str> {
    let rest = title.strip_prefix('[')?;
    let end = rest.find(']')?;
    Some(&rest[..end])
}

#[derive(Debug, Clone)]
pub struct AssignInstructions {
    pub agent_tag: String,
    pub base_branch: String,
    pub instructions: String,
}
