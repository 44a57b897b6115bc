use shared::domain::{AgentId, AgentStatus};

/// Milestone shown once the debate starts, regardless of research progress.
pub const BATTLE_MILESTONE_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    Advanced { from: AgentStatus, to: AgentStatus },
    /// The record already reached this status or a later one.
    Ignored { current: AgentStatus },
}

/// Agent Progress Records for one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressTracker {
    records: [AgentStatus; AgentId::COUNT],
}

impl ProgressTracker {
    pub fn reset(&mut self) {
        self.records = [AgentStatus::Waiting; AgentId::COUNT];
    }

    pub fn status(&self, agent: AgentId) -> AgentStatus {
        self.records[agent.index()]
    }

    pub fn advance(&mut self, agent: AgentId, next: AgentStatus) -> ProgressUpdate {
        let current = self.records[agent.index()];
        if !current.can_advance_to(next) {
            return ProgressUpdate::Ignored { current };
        }
        self.records[agent.index()] = next;
        ProgressUpdate::Advanced {
            from: current,
            to: next,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.records
            .iter()
            .filter(|status| **status == AgentStatus::Completed)
            .count()
    }

    pub fn percent(&self) -> f64 {
        self.completed_count() as f64 / AgentId::COUNT as f64 * 100.0
    }

    pub fn snapshot(&self) -> Vec<(AgentId, AgentStatus)> {
        AgentId::ALL
            .iter()
            .map(|agent| (*agent, self.status(*agent)))
            .collect()
    }
}
