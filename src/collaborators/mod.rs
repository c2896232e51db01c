pub mod http;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use types::*;

/// Classifies an issue and judges whether it can be resolved automatically.
#[async_trait]
pub trait IssueAnalyzer: Send + Sync {
    /// `feasible: false` in the result is a judgment, not an error.
    async fn analyze(&self, issue: &IssueInput) -> Result<AnalysisResult>;
}

/// Produces a candidate solution for an analyzed issue.
#[async_trait]
pub trait AutonomousResolver: Send + Sync {
    async fn resolve(&self, analysis: &AnalysisResult, issue: &IssueInput)
        -> Result<ResolutionResult>;
}

/// Reviews a candidate solution.
#[async_trait]
pub trait CodeReviewer: Send + Sync {
    async fn review(&self, solution: &Solution, issue: &IssueInput) -> Result<ReviewResult>;
}

/// Opens a pull request for an approved solution.
#[async_trait]
pub trait PrGenerator: Send + Sync {
    async fn create_pull_request(
        &self,
        issue: &IssueInput,
        resolution: &ResolutionResult,
        review: &ReviewResult,
        analysis: &AnalysisResult,
    ) -> Result<PullRequestRef>;
}

/// The four pipeline collaborators, injected into the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn IssueAnalyzer>,
    pub resolver: Arc<dyn AutonomousResolver>,
    pub reviewer: Arc<dyn CodeReviewer>,
    pub pr_generator: Arc<dyn PrGenerator>,
}

impl Collaborators {
    /// Use one value for every role.
    pub fn from_shared<C>(collaborator: Arc<C>) -> Self
    where
        C: IssueAnalyzer + AutonomousResolver + CodeReviewer + PrGenerator + 'static,
    {
        Self {
            analyzer: collaborator.clone(),
            resolver: collaborator.clone(),
            reviewer: collaborator.clone(),
            pr_generator: collaborator,
        }
    }
}
