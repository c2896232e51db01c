//! Scriptable collaborator used by the orchestrator and server tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::types::*;
use super::{AutonomousResolver, CodeReviewer, IssueAnalyzer, PrGenerator};
use crate::error::{AppError, Result};
use crate::workflow::types::Stage;

/// How one stage of the mock behaves.
#[derive(Clone, Default)]
pub(crate) struct StageScript {
    /// Fail this many calls before succeeding.
    pub fail_first: u32,
    pub always_fail: bool,
    pub fail_for_issue: Option<fn(u64) -> bool>,
    pub delay: Duration,
    pub panic: bool,
}

impl StageScript {
    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

pub(crate) struct MockCollaborator {
    scripts: [StageScript; 4],
    feasible: bool,
    resolution_success: bool,
    approved: bool,
    calls: [AtomicU32; 4],
}

fn index(stage: Stage) -> usize {
    match stage {
        Stage::Analysis => 0,
        Stage::Resolution => 1,
        Stage::Review => 2,
        Stage::PrGeneration => 3,
    }
}

impl MockCollaborator {
    /// Every stage succeeds on the first call.
    pub fn happy() -> Self {
        Self {
            scripts: Default::default(),
            feasible: true,
            resolution_success: true,
            approved: true,
            calls: Default::default(),
        }
    }

    pub fn with_stage(mut self, stage: Stage, script: StageScript) -> Self {
        self.scripts[index(stage)] = script;
        self
    }

    pub fn infeasible(mut self) -> Self {
        self.feasible = false;
        self
    }

    pub fn unsuccessful_resolution(mut self) -> Self {
        self.resolution_success = false;
        self
    }

    pub fn rejecting_review(mut self) -> Self {
        self.approved = false;
        self
    }

    pub fn calls(&self, stage: Stage) -> u32 {
        self.calls[index(stage)].load(Ordering::SeqCst)
    }

    async fn run(&self, stage: Stage, issue: u64) -> Result<()> {
        let script = &self.scripts[index(stage)];
        let call = self.calls[index(stage)].fetch_add(1, Ordering::SeqCst) + 1;

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        if script.panic {
            panic!("{stage} collaborator blew up");
        }

        let scripted_failure = script.always_fail
            || call <= script.fail_first
            || script.fail_for_issue.is_some_and(|f| f(issue));
        if scripted_failure {
            return Err(AppError::Collaborator(format!(
                "{stage} unavailable (call {call})"
            )));
        }
        Ok(())
    }
}

pub(crate) fn sample_analysis(feasible: bool) -> AnalysisResult {
    AnalysisResult {
        category: "bug".to_string(),
        complexity: "low".to_string(),
        requirements: vec!["fix the crash".to_string()],
        acceptance_criteria: vec!["no panic on empty input".to_string()],
        feasible,
        confidence: 0.9,
        reasoning: if feasible {
            "small, well-scoped change".to_string()
        } else {
            "requires product decision".to_string()
        },
    }
}

#[async_trait]
impl IssueAnalyzer for MockCollaborator {
    async fn analyze(&self, issue: &IssueInput) -> Result<AnalysisResult> {
        self.run(Stage::Analysis, issue.number).await?;
        Ok(sample_analysis(self.feasible))
    }
}

#[async_trait]
impl AutonomousResolver for MockCollaborator {
    async fn resolve(
        &self,
        _analysis: &AnalysisResult,
        issue: &IssueInput,
    ) -> Result<ResolutionResult> {
        self.run(Stage::Resolution, issue.number).await?;
        Ok(ResolutionResult {
            success: self.resolution_success,
            solution: Solution {
                files: vec![FileChange {
                    path: "src/lib.rs".to_string(),
                    action: ChangeAction::Modify,
                    content: Some("// fixed".to_string()),
                }],
                tests: vec![TestCase {
                    name: "handles_empty_input".to_string(),
                    path: "tests/empty.rs".to_string(),
                    content: "#[test] fn handles_empty_input() {}".to_string(),
                }],
            },
            confidence: 0.8,
            reasoning: "guarded the empty case".to_string(),
        })
    }
}

#[async_trait]
impl CodeReviewer for MockCollaborator {
    async fn review(&self, _solution: &Solution, issue: &IssueInput) -> Result<ReviewResult> {
        self.run(Stage::Review, issue.number).await?;
        Ok(ReviewResult {
            approved: self.approved,
            score: if self.approved { 0.92 } else { 0.31 },
            comments: vec![],
            suggestions: vec![],
            critical_issues: if self.approved {
                vec![]
            } else {
                vec!["missing error handling".to_string()]
            },
        })
    }
}

#[async_trait]
impl PrGenerator for MockCollaborator {
    async fn create_pull_request(
        &self,
        issue: &IssueInput,
        _resolution: &ResolutionResult,
        _review: &ReviewResult,
        _analysis: &AnalysisResult,
    ) -> Result<PullRequestRef> {
        self.run(Stage::PrGeneration, issue.number).await?;
        let number = 1000 + issue.number;
        Ok(PullRequestRef {
            number,
            title: format!("Fix #{}: {}", issue.number, issue.title),
            body: format!("Resolves #{}", issue.number),
            url: format!("https://github.com/acme/widgets/pull/{number}"),
        })
    }
}
