use std::collections::HashMap;

use chrono::Utc;

use crate::errors::HostError;
use crate::host::{agent_from_sub_issue_title, HostClient};
use crate::util::BoundedSet;

use super::types::{MainBranch, Pipeline};

/// Rebuilds a [`Pipeline`] purely from Host state (§4.3). Idempotent per
/// law L1: run twice and the result agrees up to `started_at`.
pub async fn reconstruct(
    host: &dyn HostClient,
    issue_id: i64,
    project_id: &str,
    status: &str,
    agents: &[String],
    claimed_child_prs: &mut BoundedSet<String>,
) -> Result<Pipeline, HostError> {
    let issue = host.get_issue(issue_id).await?;

    // Step 2: walk agents in order, stopping at the first one with no
    // Done marker on the parent issue.
    let mut completed = Vec::new();
    for agent in agents {
        if issue.comments.iter().any(|c| c.has_done_marker(agent)) {
            completed.push(agent.clone());
        } else {
            break;
        }
    }

    // Step 4: sub-issues, keyed by the `[<agent>]` title prefix.
    let sub_issues_list = host.list_sub_issues(issue_id).await.unwrap_or_default();
    let mut sub_issues = HashMap::new();
    for sub in &sub_issues_list {
        if let Some(agent) = agent_from_sub_issue_title(&sub.title) {
            sub_issues.insert(agent.to_string(), sub.id);
        }
    }

    // Step 3: the first open/draft PR authored by the Bot becomes the
    // main branch.
    let linked_prs = host.list_linked_prs(issue_id).await.unwrap_or_default();
    let main_pr = linked_prs
        .iter()
        .find(|pr| pr.is_bot_authored && pr.is_open);

    let (main_branch, assigned_sha) = match main_pr {
        Some(pr) => (
            Some(MainBranch {
                name: pr.head_ref.clone(),
                main_pr_id: pr.number,
                head_sha: pr.head_sha.clone(),
            }),
            Some(pr.head_sha.clone()),
        ),
        None => (None, None),
    };

    // Step 6: claim merged child PRs belonging to already-completed
    // agents so Phase 0 never re-attributes them.
    if let Some(main) = &main_branch {
        for pr in &linked_prs {
            if pr.number == main.main_pr_id || pr.is_open {
                continue;
            }
            if pr.base_ref != main.name {
                continue;
            }
            for agent in &completed {
                let key = format!("{issue_id}:{}:{agent}", pr.number);
                claimed_child_prs.insert(key);
            }
        }
    }

    Ok(Pipeline::rehydrate(
        issue_id,
        project_id.to_string(),
        status.to_string(),
        agents.to_vec(),
        completed,
        Utc::now(),
        sub_issues,
        main_branch,
        assigned_sha,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHostClient;
    use crate::host::{Comment, Issue, PullRequest, SubIssue};

    fn issue_with_comments(comments: Vec<Comment>) -> Issue {
        Issue {
            id: 50,
            number: 50,
            title: "Add login page".to_string(),
            body: String::new(),
            status: "Backlog".to_string(),
            comments,
        }
    }

    fn comment(body: &str) -> Comment {
        Comment {
            id: 1,
            body: body.to_string(),
            author: "bot".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reconstruct_marks_completed_prefix_and_stops_at_gap() {
        let mut fake = FakeHostClient::default();
        fake.issues.lock().unwrap().insert(
            50,
            issue_with_comments(vec![comment("speckit.specify: Done!")]),
        );
        let mut claimed = BoundedSet::new(500);
        let agents = vec![
            "speckit.specify".to_string(),
            "speckit.plan".to_string(),
            "speckit.tasks".to_string(),
        ];
        let pipeline = reconstruct(&fake, 50, "proj", "Backlog", &agents, &mut claimed)
            .await
            .unwrap();
        assert_eq!(pipeline.completed, vec!["speckit.specify".to_string()]);
        assert_eq!(pipeline.current_index, 1);
    }

    #[tokio::test]
    async fn reconstruct_populates_main_branch_from_bot_pr() {
        let mut fake = FakeHostClient::default();
        fake.issues.lock().unwrap().insert(50, issue_with_comments(vec![]));
        fake.linked_prs.lock().unwrap().insert(
            50,
            vec![PullRequest {
                number: 101,
                title: "speckit.specify work".to_string(),
                body: String::new(),
                author: "bot".to_string(),
                is_bot_authored: true,
                is_draft: true,
                is_open: true,
                base_ref: "main".to_string(),
                head_ref: "copilot/fix-50".to_string(),
                head_sha: "abc123".to_string(),
            }],
        );
        let mut claimed = BoundedSet::new(500);
        let agents = vec!["speckit.specify".to_string()];
        let pipeline = reconstruct(&fake, 50, "proj", "Backlog", &agents, &mut claimed)
            .await
            .unwrap();
        let main = pipeline.main_branch.expect("main branch populated");
        assert_eq!(main.name, "copilot/fix-50");
        assert_eq!(pipeline.assigned_sha.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn reconstruct_parses_sub_issue_prefixes() {
        let mut fake = FakeHostClient::default();
        fake.issues.lock().unwrap().insert(50, issue_with_comments(vec![]));
        fake.sub_issues.lock().unwrap().insert(
            50,
            vec![SubIssue {
                id: 9001,
                number: 51,
                title: "[speckit.specify] Add login page".to_string(),
                parent_issue_id: 50,
            }],
        );
        let mut claimed = BoundedSet::new(500);
        let agents = vec!["speckit.specify".to_string()];
        let pipeline = reconstruct(&fake, 50, "proj", "Backlog", &agents, &mut claimed)
            .await
            .unwrap();
        assert_eq!(pipeline.sub_issues.get("speckit.specify"), Some(&9001));
    }

    #[tokio::test]
    async fn reconstruct_claims_merged_child_prs_of_completed_agents() {
        let mut fake = FakeHostClient::default();
        fake.issues.lock().unwrap().insert(
            50,
            issue_with_comments(vec![comment("speckit.specify: Done!")]),
        );
        fake.linked_prs.lock().unwrap().insert(
            50,
            vec![
                PullRequest {
                    number: 100,
                    title: "main".to_string(),
                    body: String::new(),
                    author: "bot".to_string(),
                    is_bot_authored: true,
                    is_draft: false,
                    is_open: true,
                    base_ref: "main".to_string(),
                    head_ref: "copilot/fix-50".to_string(),
                    head_sha: "def456".to_string(),
                },
                PullRequest {
                    number: 101,
                    title: "child".to_string(),
                    body: String::new(),
                    author: "bot".to_string(),
                    is_bot_authored: true,
                    is_draft: false,
                    is_open: false,
                    base_ref: "copilot/fix-50".to_string(),
                    head_ref: "copilot/fix-50-child".to_string(),
                    head_sha: "ghi789".to_string(),
                },
            ],
        );
        let mut claimed = BoundedSet::new(500);
        let agents = vec!["speckit.specify".to_string(), "speckit.plan".to_string()];
        reconstruct(&fake, 50, "proj", "Backlog", &agents, &mut claimed)
            .await
            .unwrap();
        assert!(claimed.contains(&"50:101:speckit.specify".to_string()));
    }
}
