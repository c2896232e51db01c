use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::*;
use super::{AutonomousResolver, CodeReviewer, IssueAnalyzer, PrGenerator};
use crate::config::CollaboratorConfig;
use crate::error::{AppError, Result};

/// Collaborator adapter that forwards each stage to a JSON-over-HTTP service.
pub struct HttpCollaborators {
    client: Client,
    config: CollaboratorConfig,
}

impl HttpCollaborators {
    pub fn new(config: &CollaboratorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    async fn post<B, R>(&self, url: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut request = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(body);

        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Collaborator(format!(
                "{url} returned {status}: {body}"
            )));
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

// --- Request types ---

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    issue: &'a IssueInput,
}

#[derive(Debug, Serialize)]
struct ResolveRequest<'a> {
    issue: &'a IssueInput,
    analysis: &'a AnalysisResult,
}

#[derive(Debug, Serialize)]
struct ReviewRequest<'a> {
    issue: &'a IssueInput,
    solution: &'a Solution,
}

#[derive(Debug, Serialize)]
struct PullRequestRequest<'a> {
    issue: &'a IssueInput,
    resolution: &'a ResolutionResult,
    review: &'a ReviewResult,
    analysis: &'a AnalysisResult,
}

#[async_trait]
impl IssueAnalyzer for HttpCollaborators {
    async fn analyze(&self, issue: &IssueInput) -> Result<AnalysisResult> {
        self.post(&self.config.analyzer_url, &AnalyzeRequest { issue })
            .await
    }
}

#[async_trait]
impl AutonomousResolver for HttpCollaborators {
    async fn resolve(
        &self,
        analysis: &AnalysisResult,
        issue: &IssueInput,
    ) -> Result<ResolutionResult> {
        self.post(&self.config.resolver_url, &ResolveRequest { issue, analysis })
            .await
    }
}

#[async_trait]
impl CodeReviewer for HttpCollaborators {
    async fn review(&self, solution: &Solution, issue: &IssueInput) -> Result<ReviewResult> {
        self.post(&self.config.reviewer_url, &ReviewRequest { issue, solution })
            .await
    }
}

#[async_trait]
impl PrGenerator for HttpCollaborators {
    async fn create_pull_request(
        &self,
        issue: &IssueInput,
        resolution: &ResolutionResult,
        review: &ReviewResult,
        analysis: &AnalysisResult,
    ) -> Result<PullRequestRef> {
        let request = PullRequestRequest {
            issue,
            resolution,
            review,
            analysis,
        };
        self.post(&self.config.pr_generator_url, &request).await
    }
}
