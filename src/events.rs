use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// The four event kinds published by the Orchestrator (§6), each
/// implicitly scoped to the `project_id` carried on the event.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    AgentAssigned {
        project_id: String,
        issue: i64,
        agent: String,
        status: String,
        next_agent: Option<String>,
        ts: DateTime<Utc>,
    },
    AgentCompleted {
        project_id: String,
        issue: i64,
        agent: String,
        status: String,
        next_agent: Option<String>,
        ts: DateTime<Utc>,
    },
    StatusUpdated {
        project_id: String,
        issue: i64,
        from: String,
        to: String,
        triggered_by: &'static str,
    },
    Recovery {
        project_id: String,
        issue: i64,
        agent: String,
        missing: Vec<String>,
    },
}

/// Second cooperative task (§5): fans out notifications to subscribers but
/// owns no pipeline state of its own. A dropped receiver simply stops
/// getting events; publishing never blocks on a slow subscriber.
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns the number of active subscribers that
    /// received it; zero subscribers is not an error.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
