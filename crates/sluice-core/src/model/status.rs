use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Waiting,
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the node state machine admits the edge `self -> target`.
    ///
    /// `Waiting -> Failed` covers template resolution failures detected
    /// before dispatch; `Pending -> Completed | Failed` covers workers
    /// that published a completion without the intermediate `Running`;
    /// `Running -> Pending` is the retry handback that precedes a
    /// republished attempt.
    pub fn can_transition_to(self, target: NodeStatus) -> bool {
        match self {
            Self::Waiting => matches!(target, Self::Pending | Self::Skipped | Self::Failed),
            Self::Pending => matches!(
                target,
                Self::Running | Self::Completed | Self::Failed | Self::Skipped
            ),
            Self::Running => matches!(target, Self::Completed | Self::Failed | Self::Pending),
            Self::Completed | Self::Failed | Self::Skipped => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_status_terminal_states() {
        assert!(!NodeStatus::Waiting.is_terminal());
        assert!(!NodeStatus::Pending.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Completed.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
    }

    #[test]
    fn execution_status_terminal_states() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn waiting_admits_dispatch_skip_and_template_failure() {
        assert!(NodeStatus::Waiting.can_transition_to(NodeStatus::Pending));
        assert!(NodeStatus::Waiting.can_transition_to(NodeStatus::Skipped));
        assert!(NodeStatus::Waiting.can_transition_to(NodeStatus::Failed));
        assert!(!NodeStatus::Waiting.can_transition_to(NodeStatus::Running));
        assert!(!NodeStatus::Waiting.can_transition_to(NodeStatus::Completed));
    }

    #[test]
    fn pending_admits_running_and_direct_terminals() {
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Completed));
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Failed));
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Skipped));
        assert!(!NodeStatus::Pending.can_transition_to(NodeStatus::Waiting));
    }

    #[test]
    fn running_admits_terminals_and_retry_handback() {
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Completed));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Failed));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Pending));
        assert!(!NodeStatus::Running.can_transition_to(NodeStatus::Skipped));
        assert!(!NodeStatus::Running.can_transition_to(NodeStatus::Waiting));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for terminal in [
            NodeStatus::Completed,
            NodeStatus::Failed,
            NodeStatus::Skipped,
        ] {
            for target in [
                NodeStatus::Waiting,
                NodeStatus::Pending,
                NodeStatus::Running,
                NodeStatus::Completed,
                NodeStatus::Failed,
                NodeStatus::Skipped,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn serde_uses_snake_case_wire_values() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::Waiting).expect("serialize"),
            "\"waiting\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Cancelled).expect("serialize"),
            "\"cancelled\""
        );
    }
}
