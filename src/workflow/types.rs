use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::types::{AnalysisResult, PullRequestRef, ResolutionResult, ReviewResult};
use crate::error::{AppError, Result};

/// Position of a workflow in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Analyzing,
    Resolving,
    Reviewing,
    GeneratingPr,
    Completed,
    Failed,
    Escalated,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Analyzing => "analyzing",
            WorkflowState::Resolving => "resolving",
            WorkflowState::Reviewing => "reviewing",
            WorkflowState::GeneratingPr => "generating_pr",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Escalated => "escalated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Escalated
        )
    }

    fn pipeline_position(self) -> u8 {
        match self {
            WorkflowState::Pending => 0,
            WorkflowState::Analyzing => 1,
            WorkflowState::Resolving => 2,
            WorkflowState::Reviewing => 3,
            WorkflowState::GeneratingPr => 4,
            WorkflowState::Completed => 5,
            // Side states sit after every in-progress state.
            WorkflowState::Failed | WorkflowState::Escalated => 6,
        }
    }

    /// Forward moves along the pipeline, or a jump to a failure side state.
    /// Nothing leaves a terminal state.
    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            WorkflowState::Failed | WorkflowState::Escalated => true,
            _ => next.pipeline_position() > self.pipeline_position(),
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the four pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Resolution,
    Review,
    PrGeneration,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Analysis,
        Stage::Resolution,
        Stage::Review,
        Stage::PrGeneration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Analysis => "analysis",
            Stage::Resolution => "resolution",
            Stage::Review => "review",
            Stage::PrGeneration => "pr_generation",
        }
    }

    /// The state a workflow is in while this stage runs.
    pub fn state(self) -> WorkflowState {
        match self {
            Stage::Analysis => WorkflowState::Analyzing,
            Stage::Resolution => WorkflowState::Resolving,
            Stage::Review => WorkflowState::Reviewing,
            Stage::PrGeneration => WorkflowState::GeneratingPr,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transient,
    BusinessRejection,
    Timeout,
    WorkflowTimeout,
    DuplicateWorkflow,
    EscalationRequired,
    /// Orchestrator bookkeeping broke; not a collaborator failure.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub kind: ErrorKind,
    /// Stage the error is attributed to; `None` for systemic failures.
    pub stage: Option<Stage>,
    pub message: String,
}

impl WorkflowError {
    pub fn new(kind: ErrorKind, stage: Option<Stage>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "{:?} during {stage}: {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Outputs of the stages that completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageResults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestRef>,
}

/// Mutable state of one resolution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub issue_number: u64,
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_counts: BTreeMap<Stage, u32>,
    pub consecutive_failures: u32,
    pub last_error: Option<WorkflowError>,
    pub result: StageResults,
}

impl WorkflowRecord {
    pub fn new(issue_number: u64, consecutive_failures: u32) -> Self {
        Self {
            issue_number,
            state: WorkflowState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            attempt_counts: BTreeMap::new(),
            consecutive_failures,
            last_error: None,
            result: StageResults::default(),
        }
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: WorkflowState) -> Result<WorkflowState> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                issue: self.issue_number,
                from,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(from)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempt_counts.get(&stage).copied().unwrap_or(0)
    }

    pub fn record_stage_success(&mut self, stage: Stage, attempts: u32) {
        self.attempt_counts.insert(stage, attempts);
        self.consecutive_failures = 0;
    }

    pub fn record_stage_failure(&mut self, stage: Stage, attempts: u32, error: WorkflowError) {
        self.attempt_counts.insert(stage, attempts);
        self.consecutive_failures += 1;
        self.last_error = Some(error);
    }
}

/// How a workflow ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    /// Pipeline finished and a PR was opened.
    PullRequestCreated { pr_number: u64, url: String },
    /// Analysis judged the issue infeasible; nothing further to do.
    NotFeasible { reasoning: String },
    /// Pipeline stopped on a stage failure, rejection, or deadline.
    Failed { error: WorkflowError },
    /// Failure streak reached the threshold; route to a human.
    Escalated { error: WorkflowError },
}

/// Summary returned to the caller of `process_issue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub issue_number: u64,
    pub success: bool,
    pub final_state: WorkflowState,
    pub outcome: WorkflowOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestRef>,
    pub execution_time_ms: u64,
    pub attempt_counts: BTreeMap<Stage, u32>,
    pub consecutive_failures: u32,
    pub results: StageResults,
}

impl WorkflowResult {
    pub fn error(&self) -> Option<&WorkflowError> {
        match &self.outcome {
            WorkflowOutcome::Failed { error } | WorkflowOutcome::Escalated { error } => Some(error),
            _ => None,
        }
    }

    pub fn requires_human(&self) -> bool {
        matches!(self.outcome, WorkflowOutcome::Escalated { .. })
    }
}

/// Emitted on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub issue_number: u64,
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub at: DateTime<Utc>,
}
